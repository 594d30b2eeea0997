//! Scality data-daemon backend client.
//!
//! Talks to the native HTTP data daemon with generated hex keys:
//!
//!   PUT    {endpoint}/datastore/{key}
//!   GET    {endpoint}/datastore/{key}      (Range header honoured)
//!   DELETE {endpoint}/datastore/{key}
//!   GET    {endpoint}/healthcheck
//!
//! Unlike the cloud clients, GET addresses data by bare key; the gateway
//! hands this client the key straight out of the retrieval record, which
//! also lets it serve pre-`dataStoreName` legacy records.

use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::StatusCode;
use tracing::debug;

use super::{
    AbortMpuResult, BackendClient, BackendType, BoxFuture, ByteRange, CompleteMpuResult,
    DataLocation, KeyContext, LocationHealth, MpuPartRef, PutResult,
};

/// HTTP [`BackendClient`] for the scality data daemon.
pub struct ScalityBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl ScalityBackend {
    pub fn new(endpoint: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn generate_data_key() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn data_url(&self, key: &str) -> String {
        format!("{}/datastore/{key}", self.endpoint)
    }

    async fn put_raw(&self, key: &str, data: Bytes) -> anyhow::Result<()> {
        let resp = self
            .client
            .put(self.data_url(key))
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("scality put: {e}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("scality put: HTTP {}", resp.status());
        }
        Ok(())
    }

    async fn get_raw(&self, key: &str, range: Option<ByteRange>) -> anyhow::Result<Bytes> {
        let mut req = self.client.get(self.data_url(key));
        if let Some((first, last)) = range {
            req = req.header("range", format!("bytes={first}-{last}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("scality get: {e}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("scality get: HTTP {} for key {key}", resp.status());
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("scality get body: {e}"))?;
        Ok(body)
    }

    async fn delete_raw(&self, key: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.data_url(key))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("scality delete: {e}"))?;
        // The daemon answers 404 for keys it no longer holds.
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            anyhow::bail!("scality delete: HTTP {} for key {key}", resp.status());
        }
        Ok(())
    }
}

impl BackendClient for ScalityBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Scality
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
            let key = Self::generate_data_key();
            let etag = super::quoted_md5(&data);
            debug!(req_id, object_key, data_key = %key, "scality put");
            self.put_raw(&key, data).await?;
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
        Box::pin(async move { self.get_raw(&key, range).await })
    }

    fn delete(
        &self,
        location: &DataLocation,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = location.key.clone();
        Box::pin(async move { self.delete_raw(&key).await })
    }

    fn create_mpu(
        &self,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
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
        // Parts are ordinary daemon objects keyed per upload.
        let part_key = format!("{upload_id}-{part_number:05}-{}", Self::generate_data_key());
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            self.put_raw(&part_key, data).await?;
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
        _upload_id: &str,
        _backend_upload_id: Option<&str>,
        parts: &[MpuPartRef],
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<CompleteMpuResult>> {
        let parts = parts.to_vec();
        let req_id = req_id.to_string();
        let object_key = ctx.object_key.clone();
        Box::pin(async move {
            let mut combined = Vec::new();
            let mut combined_md5_bytes = Vec::new();
            for part in &parts {
                let part_key = part
                    .key
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("part {} has no data key", part.part_number))?;
                let data = self.get_raw(part_key, None).await?;

                let mut hasher = Md5::new();
                hasher.update(&data);
                combined_md5_bytes.extend_from_slice(&hasher.finalize());
                combined.extend_from_slice(&data);
            }

            let mut composite = Md5::new();
            composite.update(&combined_md5_bytes);
            let etag = format!("\"{}-{}\"", hex::encode(composite.finalize()), parts.len());

            let key = Self::generate_data_key();
            let content_length = combined.len() as u64;
            debug!(req_id, object_key, data_key = %key, parts = parts.len(), "scality complete mpu");
            self.put_raw(&key, Bytes::from(combined)).await?;

            for part in &parts {
                if let Some(part_key) = part.key.as_deref() {
                    let _ = self.delete_raw(part_key).await;
                }
            }

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
        _upload_id: &str,
        _backend_upload_id: Option<&str>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<AbortMpuResult>> {
        // Staged part objects are deleted by the caller from the recorded
        // part locations; the daemon has no upload state of its own.
        Box::pin(async { Ok(AbortMpuResult::default()) })
    }

    fn check_health(&self, location_name: &str) -> BoxFuture<'_, LocationHealth> {
        let location_name = location_name.to_string();
        Box::pin(async move {
            let url = format!("{}/healthcheck", self.endpoint);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => LocationHealth::ok(),
                Ok(resp) => {
                    LocationHealth::error(format!("{location_name}: HTTP {}", resp.status()))
                }
                Err(e) => LocationHealth::error(format!("{location_name}: {e}")),
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_normalized() {
        let backend = ScalityBackend::new("http://daemon:8000/".to_string()).unwrap();
        assert_eq!(backend.data_url("abc"), "http://daemon:8000/datastore/abc");
    }

    #[test]
    fn test_generated_keys_are_hex_and_unique() {
        let a = ScalityBackend::generate_data_key();
        let b = ScalityBackend::generate_data_key();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_reports_in_band() {
        let backend = ScalityBackend::new("http://127.0.0.1:1".to_string()).unwrap();
        let health = backend.check_health("scality-loc").await;
        assert_eq!(health.code, 500);
        assert!(health.error.unwrap().starts_with("scality-loc:"));
    }
}
