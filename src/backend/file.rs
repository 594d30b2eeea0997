//! Local file-tree backend client.
//!
//! Data keys are generated hex identifiers; each object lands at
//! `{root}/{first two hex chars}/{key}` so directories stay shallow.
//! Writes go to a temp file first, then fsync + rename.
//!
//! Staged multipart parts live under `{root}/.parts/{upload_id}/{n}`.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

use super::{
    AbortMpuResult, BackendClient, BackendType, BoxFuture, ByteRange, CompleteMpuResult,
    DataLocation, KeyContext, MpuPartRef, PutResult,
};

/// File-tree [`BackendClient`] rooted at a configured directory.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create the backend, making the root, temp, and parts directories.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(".tmp"))?;
        std::fs::create_dir_all(root.join(".parts"))?;
        Ok(Self { root })
    }

    fn generate_data_key() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Resolve a data key to its on-disk path.
    fn data_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        // Keys are generated hex; anything else is a corrupt record.
        if key.len() < 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("malformed data key: {key}");
        }
        Ok(self.root.join(&key[..2]).join(key))
    }

    fn part_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(".parts").join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.part_dir(upload_id).join(part_number.to_string())
    }

    /// Write bytes to a temp file, fsync, and rename into place.
    fn write_atomic(&self, final_path: &PathBuf, data: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self
            .root
            .join(".tmp")
            .join(format!("tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, final_path)?;
        Ok(())
    }
}

impl BackendClient for FileBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::File
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
            let path = self.data_path(&key)?;
            let etag = super::quoted_md5(&data);
            debug!(req_id, object_key, data_key = %key, "file put");

            // Blocking file I/O runs off the async worker.
            tokio::task::block_in_place(|| self.write_atomic(&path, &data))?;

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
            let path = self.data_path(&key)?;
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| anyhow::anyhow!("no data found for key {key}: {e}"))?;
            let data = Bytes::from(data);
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
            let path = self.data_path(&key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(anyhow::anyhow!("delete failed for key {key}: {e}")),
            }
        })
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
        let path = self.part_path(upload_id, part_number);
        let part_key = format!("{upload_id}/{part_number}");
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            tokio::task::block_in_place(|| self.write_atomic(&path, &data))?;
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
            for part in &parts {
                let path = self.part_path(&upload_id, part.part_number);
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    anyhow::anyhow!("part {} not found for {upload_id}: {e}", part.part_number)
                })?;

                let mut hasher = Md5::new();
                hasher.update(&data);
                combined_md5_bytes.extend_from_slice(&hasher.finalize());
                combined.extend_from_slice(&data);
            }

            let mut composite = Md5::new();
            composite.update(&combined_md5_bytes);
            let etag = format!("\"{}-{}\"", hex::encode(composite.finalize()), parts.len());

            let key = Self::generate_data_key();
            let path = self.data_path(&key)?;
            debug!(req_id, object_key, data_key = %key, parts = parts.len(), "file complete mpu");
            let content_length = combined.len() as u64;
            tokio::task::block_in_place(|| self.write_atomic(&path, &combined))?;

            let _ = tokio::fs::remove_dir_all(self.part_dir(&upload_id)).await;

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
        let dir = self.part_dir(upload_id);
        Box::pin(async move {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(AbortMpuResult::default()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Ok(AbortMpuResult::default())
                }
                Err(e) => Err(anyhow::anyhow!("abort cleanup failed: {e}")),
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> KeyContext {
        KeyContext::new("bucket", "key.txt")
    }

    fn location_for(key: &str) -> DataLocation {
        DataLocation::new(key.to_string(), "file-loc", BackendType::File, 0)
    }

    fn backend() -> (FileBackend, tempfile::TempDir) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::new(tmp.path().join("data")).expect("backend");
        (backend, tmp)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_get_roundtrip() {
        let (backend, _tmp) = backend();
        let data = Bytes::from("file bytes");
        let result = backend.put(data.clone(), &ctx(), "rid").await.unwrap();
        assert_eq!(
            result.etag.as_deref(),
            Some(crate::backend::quoted_md5(&data).as_str())
        );

        let got = backend
            .get(&location_for(&result.key), None, "rid")
            .await
            .unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_data_lands_in_fanned_out_directory() {
        let (backend, _tmp) = backend();
        let result = backend.put(Bytes::from("x"), &ctx(), "rid").await.unwrap();
        let path = backend.data_path(&result.key).unwrap();
        assert!(path.exists());
        assert_eq!(
            path.parent().unwrap().file_name().unwrap().to_str().unwrap(),
            &result.key[..2]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ranged_get() {
        let (backend, _tmp) = backend();
        let result = backend
            .put(Bytes::from("0123456789"), &ctx(), "rid")
            .await
            .unwrap();
        let got = backend
            .get(&location_for(&result.key), Some((3, 6)), "rid")
            .await
            .unwrap();
        assert_eq!(got, Bytes::from("3456"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_is_idempotent() {
        let (backend, _tmp) = backend();
        let result = backend.put(Bytes::from("x"), &ctx(), "rid").await.unwrap();
        let location = location_for(&result.key);
        backend.delete(&location, "rid").await.unwrap();
        backend.delete(&location, "rid").await.unwrap();
        assert!(backend.get(&location, None, "rid").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_data_key_is_rejected() {
        let (backend, _tmp) = backend();
        let bad = location_for("../../etc/passwd");
        assert!(backend.get(&bad, None, "rid").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mpu_roundtrip_and_cleanup() {
        let (backend, _tmp) = backend();
        let upload_id = "upload-9";

        let p1 = backend
            .upload_part(Bytes::from("aa"), &ctx(), upload_id, None, 1, "rid")
            .await
            .unwrap();
        let p2 = backend
            .upload_part(Bytes::from("bb"), &ctx(), upload_id, None, 2, "rid")
            .await
            .unwrap();

        let parts = vec![
            MpuPartRef {
                part_number: 1,
                etag: p1.etag.unwrap(),
                size: 2,
                key: Some(p1.key),
            },
            MpuPartRef {
                part_number: 2,
                etag: p2.etag.unwrap(),
                size: 2,
                key: Some(p2.key),
            },
        ];
        let result = backend
            .complete_mpu(&ctx(), upload_id, None, &parts, "rid")
            .await
            .unwrap();
        assert!(result.etag.ends_with("-2\""));
        assert_eq!(result.content_length, 4);

        let got = backend
            .get(&location_for(&result.key), None, "rid")
            .await
            .unwrap();
        assert_eq!(got, Bytes::from("aabb"));

        assert!(!backend.part_dir(upload_id).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_missing_upload_is_ok() {
        let (backend, _tmp) = backend();
        let result = backend
            .abort_mpu(&ctx(), "never-started", None, "rid")
            .await
            .unwrap();
        assert!(!result.skip_data_delete);
    }
}
