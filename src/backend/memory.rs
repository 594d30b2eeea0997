//! In-memory backend client.
//!
//! Objects and staged multipart parts are held in
//! `tokio::sync::RwLock<HashMap<...>>` maps.  Every write lands under a
//! fresh generated key so that versioned buckets can hold multiple
//! copies of the same object key side by side.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    AbortMpuResult, BackendClient, BackendType, BoxFuture, ByteRange, CompleteMpuResult,
    DataLocation, KeyContext, MpuPartRef, PutResult,
};

/// Generate a unique backend-native data key.
fn generate_data_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// In-memory [`BackendClient`].
#[derive(Default)]
pub struct MemoryBackend {
    /// data key -> bytes.
    objects: RwLock<HashMap<String, Bytes>>,
    /// "{upload_id}/{part_number}" -> bytes.
    parts: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn part_key(upload_id: &str, part_number: u32) -> String {
        format!("{upload_id}/{part_number}")
    }
}

impl BackendClient for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Mem
    }

    fn put(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let req_id = req_id.to_string();
        let object_key = ctx.object_key.clone();
        Box::pin(async move {
            let key = generate_data_key();
            let etag = super::quoted_md5(&data);
            debug!(req_id, object_key, data_key = %key, "mem put");
            self.objects.write().await.insert(key.clone(), data);
            Ok(PutResult {
                key,
                etag: Some(etag),
                data_store_version_id: None,
            })
        })
    }

    fn get(
        &self,
        location: &DataLocation,
        range: Option<ByteRange>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>> {
        let key = location.key.clone();
        Box::pin(async move {
            let objects = self.objects.read().await;
            let data = objects
                .get(&key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no data found for key: {key}"))?;
            match range {
                Some((first, last)) => {
                    let end = (last + 1).min(data.len() as u64) as usize;
                    let start = (first as usize).min(end);
                    Ok(data.slice(start..end))
                }
                None => Ok(data),
            }
        })
    }

    fn delete(
        &self,
        location: &DataLocation,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = location.key.clone();
        Box::pin(async move {
            self.objects.write().await.remove(&key);
            Ok(())
        })
    }

    fn create_mpu(
        &self,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        // Parts are staged locally; no backend-side upload state.
        Box::pin(async { Ok(None) })
    }

    fn upload_part(
        &self,
        data: Bytes,
        _ctx: &KeyContext,
        upload_id: &str,
        _backend_upload_id: Option<&str>,
        part_number: u32,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let part_key = Self::part_key(upload_id, part_number);
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            self.parts.write().await.insert(part_key.clone(), data);
            Ok(PutResult {
                key: part_key,
                etag: Some(etag),
                data_store_version_id: None,
            })
        })
    }

    fn complete_mpu(
        &self,
        ctx: &KeyContext,
        upload_id: &str,
        _backend_upload_id: Option<&str>,
        parts: &[MpuPartRef],
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<CompleteMpuResult>> {
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        let req_id = req_id.to_string();
        let object_key = ctx.object_key.clone();
        Box::pin(async move {
            let mut combined = Vec::new();
            let mut combined_md5_bytes = Vec::new();
            {
                let staged = self.parts.read().await;
                for part in &parts {
                    let part_key = Self::part_key(&upload_id, part.part_number);
                    let data = staged
                        .get(&part_key)
                        .ok_or_else(|| anyhow::anyhow!("part not found: {part_key}"))?;

                    let mut hasher = Md5::new();
                    hasher.update(data);
                    combined_md5_bytes.extend_from_slice(&hasher.finalize());
                    combined.extend_from_slice(data);
                }
            }

            // Composite ETag: MD5 over the concatenated binary part MD5s.
            let mut composite = Md5::new();
            composite.update(&combined_md5_bytes);
            let etag = format!("\"{}-{}\"", hex::encode(composite.finalize()), parts.len());

            let content_length = combined.len() as u64;
            let key = generate_data_key();
            debug!(req_id, object_key, data_key = %key, parts = parts.len(), "mem complete mpu");
            self.objects
                .write()
                .await
                .insert(key.clone(), Bytes::from(combined));

            // Staged parts are no longer needed.
            let mut staged = self.parts.write().await;
            staged.retain(|k, _| !k.starts_with(&format!("{upload_id}/")));

            Ok(CompleteMpuResult {
                key,
                etag,
                data_store_version_id: None,
                content_length,
            })
        })
    }

    fn abort_mpu(
        &self,
        _ctx: &KeyContext,
        upload_id: &str,
        _backend_upload_id: Option<&str>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<AbortMpuResult>> {
        let prefix = format!("{upload_id}/");
        Box::pin(async move {
            self.parts.write().await.retain(|k, _| !k.starts_with(&prefix));
            Ok(AbortMpuResult::default())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
