//! AWS S3 backend client.
//!
//! Forwards operations to a remote S3 bucket over the AWS SDK.  Native
//! keys follow the location's `bucket_match` flag: either the object key
//! alone, or `{s3_bucket}/{key}` when several gateway buckets share one
//! remote bucket.
//!
//! This variant carries the full optional capability set: server-side
//! copy, part copy, the native tagging API, and native part listing.
//! Multipart uploads run on the remote's own MPU machinery.
//!
//! Credentials come from the location details or the standard AWS
//! credential chain (env vars, `~/.aws/credentials`, IAM role).

use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, MetadataDirective, Tag, Tagging,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::LocationDetails;

use super::{
    build_native_key, AbortMpuResult, BackendCapabilities, BackendClient, BackendType, BoxFuture,
    ByteRange, CompleteMpuResult, DataLocation, KeyContext, LocationHealth, MpuPartRef,
    NativePart, PutResult,
};

/// [`BackendClient`] backed by a remote S3 bucket.
pub struct AwsBackend {
    client: Client,
    /// The remote bucket all gateway writes land in.
    bucket: String,
    bucket_match: bool,
}

impl AwsBackend {
    /// Build the SDK client for one `aws_s3` location.
    pub async fn new(location: &str, details: &LocationDetails) -> anyhow::Result<Self> {
        if details.bucket_name.is_empty() {
            anyhow::bail!("aws_s3 location {location} has no bucket_name");
        }

        let region = details
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(ref endpoint) = details.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        if let (Some(ref ak), Some(ref sk)) = (&details.access_key, &details.secret_key) {
            let creds = aws_sdk_s3::config::Credentials::new(ak, sk, None, None, "spanstore-config");
            loader = loader.credentials_provider(creds);
        }

        let sdk_config = loader.load().await;
        let s3_config =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(details.path_style);
        let client = Client::from_conf(s3_config.build());

        info!(
            location,
            bucket = %details.bucket_name,
            bucket_match = details.bucket_match,
            "aws_s3 backend initialized"
        );

        Ok(Self {
            client,
            bucket: details.bucket_name.clone(),
            bucket_match: details.bucket_match,
        })
    }

    fn native_key(&self, ctx: &KeyContext) -> String {
        build_native_key(&ctx.bucket_name, &ctx.object_key, self.bucket_match)
    }

    /// Strip the `x-amz-meta-` prefix off user-metadata header names.
    fn native_metadata(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(k, v)| {
                let name = k.strip_prefix("x-amz-meta-").unwrap_or(k);
                (name.to_string(), v.clone())
            })
            .collect()
    }

    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }

    /// Composite ETag over the binary part MD5s, `"{md5}-{n}"`.
    fn composite_etag(parts: &[MpuPartRef]) -> String {
        let mut combined = Vec::new();
        for part in parts {
            if let Ok(bytes) = hex::decode(part.etag.trim_matches('"')) {
                combined.extend_from_slice(&bytes);
            }
        }
        let mut hasher = Md5::new();
        hasher.update(&combined);
        format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts.len())
    }
}

impl BackendClient for AwsBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::AwsS3
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            copy_object: true,
            upload_part_copy: true,
            object_tagging: true,
            native_list_parts: true,
        }
    }

    fn put(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let key = self.native_key(ctx);
        let metadata = Self::native_metadata(&ctx.metadata_headers);
        let tagging = ctx.tagging.clone();
        let content_type = ctx.content_type.clone();
        let req_id = req_id.to_string();
        Box::pin(async move {
            // Local MD5 keeps the ETag stable even when the remote applies
            // its own encryption.
            let etag = super::quoted_md5(&data);
            debug!(req_id, bucket = %self.bucket, key, "aws put_object");

            let mut req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(aws_sdk_s3::primitives::ByteStream::from(data));
            for (k, v) in metadata {
                req = req.metadata(k, v);
            }
            if let Some(tags) = tagging {
                req = req.tagging(tags);
            }
            if let Some(ct) = content_type {
                req = req.content_type(ct);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;

            Ok(PutResult {
                key,
                etag: Some(etag),
                data_store_version_id: resp.version_id().map(|s| s.to_string()),
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
        let version_id = location.data_store_version_id.clone();
        Box::pin(async move {
            let mut req = self.client.get_object().bucket(&self.bucket).key(&key);
            if let Some((first, last)) = range {
                req = req.range(format!("bytes={first}-{last}"));
            }
            if let Some(vid) = version_id {
                req = req.version_id(vid);
            }

            let resp = req.send().await.map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    anyhow::anyhow!("no data found for key: {key}")
                } else {
                    Self::map_sdk_error("get_object", service_err)
                }
            })?;

            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();
            Ok(Bytes::from(body.to_vec()))
        })
    }

    fn delete(
        &self,
        location: &DataLocation,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = location.key.clone();
        let version_id = location.data_store_version_id.clone();
        Box::pin(async move {
            let mut req = self.client.delete_object().bucket(&self.bucket).key(&key);
            if let Some(vid) = version_id {
                req = req.version_id(vid);
            }
            // delete_object is idempotent on missing keys.
            req.send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;
            Ok(())
        })
    }

    fn create_mpu(
        &self,
        ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        let key = self.native_key(ctx);
        let metadata = Self::native_metadata(&ctx.metadata_headers);
        let tagging = ctx.tagging.clone();
        let content_type = ctx.content_type.clone();
        let req_id = req_id.to_string();
        Box::pin(async move {
            debug!(req_id, bucket = %self.bucket, key, "aws create_multipart_upload");
            let mut req = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&key);
            for (k, v) in metadata {
                req = req.metadata(k, v);
            }
            if let Some(tags) = tagging {
                req = req.tagging(tags);
            }
            if let Some(ct) = content_type {
                req = req.content_type(ct);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("create_multipart_upload", e))?;
            let upload_id = resp
                .upload_id()
                .ok_or_else(|| anyhow::anyhow!("AWS did not return an upload id"))?
                .to_string();
            Ok(Some(upload_id))
        })
    }

    fn upload_part(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        _upload_id: &str,
        backend_upload_id: Option<&str>,
        part_number: u32,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let key = self.native_key(ctx);
        let backend_upload_id = backend_upload_id.map(|s| s.to_string());
        Box::pin(async move {
            let upload_id = backend_upload_id
                .ok_or_else(|| anyhow::anyhow!("missing backend upload id for part upload"))?;
            let etag = super::quoted_md5(&data);

            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .body(aws_sdk_s3::primitives::ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part", e))?;

            Ok(PutResult {
                key,
                etag: Some(etag),
                data_store_version_id: None,
            })
        })
    }

    fn complete_mpu(
        &self,
        ctx: &KeyContext,
        _upload_id: &str,
        backend_upload_id: Option<&str>,
        parts: &[MpuPartRef],
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<CompleteMpuResult>> {
        let key = self.native_key(ctx);
        let backend_upload_id = backend_upload_id.map(|s| s.to_string());
        let parts = parts.to_vec();
        let req_id = req_id.to_string();
        Box::pin(async move {
            let upload_id = backend_upload_id
                .ok_or_else(|| anyhow::anyhow!("missing backend upload id for completion"))?;

            let completed_parts: Vec<CompletedPart> = parts
                .iter()
                .map(|p| {
                    CompletedPart::builder()
                        .e_tag(p.etag.clone())
                        .part_number(p.part_number as i32)
                        .build()
                })
                .collect();

            debug!(req_id, bucket = %self.bucket, key, parts = parts.len(), "aws complete_multipart_upload");
            let resp = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed_parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("complete_multipart_upload", e))?;

            let content_length = parts.iter().map(|p| p.size).sum();
            Ok(CompleteMpuResult {
                key,
                etag: Self::composite_etag(&parts),
                data_store_version_id: resp.version_id().map(|s| s.to_string()),
                content_length,
            })
        })
    }

    fn abort_mpu(
        &self,
        ctx: &KeyContext,
        _upload_id: &str,
        backend_upload_id: Option<&str>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<AbortMpuResult>> {
        let key = self.native_key(ctx);
        let backend_upload_id = backend_upload_id.map(|s| s.to_string());
        Box::pin(async move {
            if let Some(upload_id) = backend_upload_id {
                self.client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                    .map_err(|e| Self::map_sdk_error("abort_multipart_upload", e))?;
            }
            Ok(AbortMpuResult::default())
        })
    }

    fn list_parts(
        &self,
        ctx: &KeyContext,
        backend_upload_id: &str,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Vec<NativePart>>> {
        let key = self.native_key(ctx);
        let upload_id = backend_upload_id.to_string();
        Box::pin(async move {
            let resp = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("list_parts", e))?;

            Ok(resp
                .parts()
                .iter()
                .map(|p| NativePart {
                    part_number: p.part_number().unwrap_or_default() as u32,
                    etag: p.e_tag().unwrap_or_default().to_string(),
                    size: p.size().unwrap_or_default() as u64,
                    last_modified: p
                        .last_modified()
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                })
                .collect())
        })
    }

    fn copy_object(
        &self,
        source: &DataLocation,
        dest_ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let dest_key = self.native_key(dest_ctx);
        let copy_source = format!("{}/{}", self.bucket, source.key);
        let metadata = Self::native_metadata(&dest_ctx.metadata_headers);
        let replace = !dest_ctx.metadata_headers.is_empty();
        let req_id = req_id.to_string();
        Box::pin(async move {
            debug!(req_id, copy_source, dest_key, "aws copy_object");
            let mut req = self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .key(&dest_key)
                .copy_source(&copy_source)
                .metadata_directive(if replace {
                    MetadataDirective::Replace
                } else {
                    MetadataDirective::Copy
                });
            for (k, v) in metadata {
                req = req.metadata(k, v);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("copy_object", e.into_service_error()))?;

            let etag = resp
                .copy_object_result()
                .and_then(|r| r.e_tag())
                .unwrap_or_default()
                .to_string();
            let etag = if etag.starts_with('"') {
                etag
            } else {
                format!("\"{etag}\"")
            };

            Ok(PutResult {
                key: dest_key,
                etag: Some(etag),
                data_store_version_id: resp.version_id().map(|s| s.to_string()),
            })
        })
    }

    fn upload_part_copy(
        &self,
        source: &DataLocation,
        dest_ctx: &KeyContext,
        backend_upload_id: &str,
        part_number: u32,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let dest_key = self.native_key(dest_ctx);
        let copy_source = format!("{}/{}", self.bucket, source.key);
        let upload_id = backend_upload_id.to_string();
        Box::pin(async move {
            let resp = self
                .client
                .upload_part_copy()
                .bucket(&self.bucket)
                .key(&dest_key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .copy_source(&copy_source)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("upload_part_copy", e))?;

            let etag = resp
                .copy_part_result()
                .and_then(|r| r.e_tag())
                .unwrap_or_default()
                .to_string();

            Ok(PutResult {
                key: dest_key,
                etag: Some(etag),
                data_store_version_id: None,
            })
        })
    }

    fn object_put_tagging(
        &self,
        location: &DataLocation,
        tags: &[(String, String)],
        _metadata_headers: &HashMap<String, String>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = location.key.clone();
        let version_id = location.data_store_version_id.clone();
        let tags = tags.to_vec();
        Box::pin(async move {
            let tag_set: Vec<Tag> = tags
                .iter()
                .map(|(k, v)| {
                    Tag::builder()
                        .key(k)
                        .value(v)
                        .build()
                        .map_err(|e| Self::map_sdk_error("tag build", e))
                })
                .collect::<anyhow::Result<_>>()?;
            let tagging = Tagging::builder()
                .set_tag_set(Some(tag_set))
                .build()
                .map_err(|e| Self::map_sdk_error("tagging build", e))?;

            let mut req = self
                .client
                .put_object_tagging()
                .bucket(&self.bucket)
                .key(&key)
                .tagging(tagging);
            if let Some(vid) = version_id {
                req = req.version_id(vid);
            }
            req.send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object_tagging", e))?;
            Ok(())
        })
    }

    fn object_delete_tagging(
        &self,
        location: &DataLocation,
        _metadata_headers: &HashMap<String, String>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let key = location.key.clone();
        let version_id = location.data_store_version_id.clone();
        Box::pin(async move {
            let mut req = self
                .client
                .delete_object_tagging()
                .bucket(&self.bucket)
                .key(&key);
            if let Some(vid) = version_id {
                req = req.version_id(vid);
            }
            req.send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object_tagging", e))?;
            Ok(())
        })
    }

    fn check_health(&self, location_name: &str) -> BoxFuture<'_, LocationHealth> {
        let location_name = location_name.to_string();
        Box::pin(async move {
            match self
                .client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
            {
                Ok(_) => LocationHealth::ok(),
                Err(e) => LocationHealth::error(format!(
                    "{location_name}: {}",
                    e.into_service_error()
                )),
            }
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_metadata_strips_prefix() {
        let mut headers = HashMap::new();
        headers.insert("x-amz-meta-color".to_string(), "blue".to_string());
        headers.insert("x-amz-meta-scal-location-constraint".to_string(), "aws".to_string());
        let native = AwsBackend::native_metadata(&headers);
        assert_eq!(native.get("color").map(String::as_str), Some("blue"));
        assert_eq!(
            native.get("scal-location-constraint").map(String::as_str),
            Some("aws")
        );
        assert!(!native.keys().any(|k| k.starts_with("x-amz-meta-")));
    }

    #[test]
    fn test_composite_etag_format() {
        let parts = vec![
            MpuPartRef {
                part_number: 1,
                etag: "\"7ac66c0f148de9519b8bd264312c4d64\"".to_string(),
                size: 5,
                key: None,
            },
            MpuPartRef {
                part_number: 2,
                etag: "\"d41d8cd98f00b204e9800998ecf8427e\"".to_string(),
                size: 0,
                key: None,
            },
        ];
        let etag = AwsBackend::composite_etag(&parts);
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with("-2\""));
        let inner = etag.trim_matches('"');
        let dash = inner.rfind('-').unwrap();
        assert_eq!(inner[..dash].len(), 32);
    }
}
