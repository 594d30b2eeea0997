//! Azure Blob Storage backend client.
//!
//! Talks to the Blob REST API through `reqwest` with Shared Key
//! authentication.  Native blob names follow the location's
//! `bucket_match` flag, like the other cloud variants.
//!
//! Multipart strategy uses Block Blob primitives:
//!   `upload_part`  -> Put Block on the final blob (no temp objects)
//!   `complete_mpu` -> Put Block List to commit
//!   `abort_mpu`    -> nothing to delete at the data layer; uncommitted
//!                     blocks expire on their own, so the result carries
//!                     `skip_data_delete` and callers must not attempt a
//!                     follow-up data delete.
//!
//! Block IDs: `base64("{upload_id}:{part_number:05}")` -- the upload id
//! keeps concurrent uploads to one key from colliding.
//!
//! Tagging uses the native Set Blob Tags API (`?comp=tags`); clearing
//! the tag set writes an empty `<TagSet/>`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::LocationDetails;

use super::{
    build_native_key, AbortMpuResult, BackendCapabilities, BackendClient, BackendType, BoxFuture,
    ByteRange, CompleteMpuResult, DataLocation, KeyContext, LocationHealth, MpuPartRef, PutResult,
};

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// [`BackendClient`] backed by one Azure container.
pub struct AzureBackend {
    client: reqwest::Client,
    account: String,
    container: String,
    base_url: String,
    key_bytes: Vec<u8>,
    bucket_match: bool,
}

impl AzureBackend {
    /// Build the client for one `azure` location.
    pub fn new(location: &str, details: &LocationDetails) -> anyhow::Result<Self> {
        if details.bucket_name.is_empty() {
            anyhow::bail!("azure location {location} has no bucket_name");
        }
        let account = details
            .azure_storage_account_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("azure location {location} has no storage account"))?;
        let key = details
            .azure_storage_access_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("azure location {location} has no storage key"))?;
        let key_bytes = BASE64_STANDARD
            .decode(&key)
            .map_err(|e| anyhow::anyhow!("azure location {location}: storage key is not base64: {e}"))?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        let base_url = details
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{account}.blob.core.windows.net"));

        info!(
            location,
            container = %details.bucket_name,
            account,
            bucket_match = details.bucket_match,
            "azure backend initialized"
        );

        Ok(Self {
            client,
            account,
            container: details.bucket_name.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key_bytes,
            bucket_match: details.bucket_match,
        })
    }

    fn native_key(&self, ctx: &KeyContext) -> String {
        build_native_key(&ctx.bucket_name, &ctx.object_key, self.bucket_match)
    }

    fn block_id(upload_id: &str, part_number: u32) -> String {
        BASE64_STANDARD.encode(format!("{upload_id}:{part_number:05}"))
    }

    fn blob_url(&self, blob_name: &str) -> String {
        format!("{}/{}/{blob_name}", self.base_url, self.container)
    }

    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(std::time::SystemTime::now())
    }

    /// Shared Key authorization header.
    ///
    /// String-to-sign: VERB, Content-Encoding, Content-Language,
    /// Content-Length, Content-MD5, Content-Type, Date, If-Modified-Since,
    /// If-Match, If-None-Match, If-Unmodified-Since, Range, then the
    /// canonicalized `x-ms-*` headers and the canonicalized resource.
    /// Ranges travel as `x-ms-range` so the `Range` line stays empty.
    fn sign_request(
        &self,
        method: &str,
        resource_path: &str,
        content_length: Option<usize>,
        content_type: &str,
        date: &str,
        extra_headers: &[(String, String)],
        query_params: &[(String, String)],
    ) -> String {
        let content_length_str = match content_length {
            Some(0) | None => String::new(),
            Some(len) => len.to_string(),
        };

        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in extra_headers {
            let lk = k.to_lowercase();
            if lk.starts_with("x-ms-") && lk != "x-ms-date" && lk != "x-ms-version" {
                ms_headers.push((lk, v.clone()));
            }
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers: String = ms_headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut canonicalized_resource = format!("/{}/{resource_path}", self.account);
        if !query_params.is_empty() {
            let mut sorted = query_params.to_vec();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            for (k, v) in &sorted {
                canonicalized_resource.push_str(&format!("\n{}:{v}", k.to_lowercase()));
            }
        }

        let string_to_sign = format!(
            "{method}\n\n\n{content_length_str}\n\n{content_type}\n\n\n\n\n\n\n{canonicalized_headers}\n{canonicalized_resource}"
        );

        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&self.key_bytes).expect("hmac accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{signature}", self.account)
    }

    fn map_azure_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("Azure {context}: HTTP {status} - {body}")
    }

    /// Translate `x-amz-meta-*` headers into `x-ms-meta-*` header pairs.
    fn meta_headers(headers: &HashMap<String, String>) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(k, v)| {
                let name = k.strip_prefix("x-amz-meta-").unwrap_or(k);
                (format!("x-ms-meta-{name}"), v.clone())
            })
            .collect()
    }

    /// One signed request against a blob resource.
    #[allow(clippy::too_many_arguments)]
    async fn blob_request(
        &self,
        method: reqwest::Method,
        blob_name: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        content_type: &str,
        body: Option<Bytes>,
    ) -> anyhow::Result<reqwest::Response> {
        let date = Self::rfc1123_date();
        let resource_path = format!("{}/{blob_name}", self.container);
        let auth = self.sign_request(
            method.as_str(),
            &resource_path,
            body.as_ref().map(|b| b.len()),
            content_type,
            &date,
            extra_headers,
            query,
        );

        let mut url = self.blob_url(blob_name);
        if !query.is_empty() {
            let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url = format!("{url}?{}", qs.join("&"));
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION)
            .header("authorization", auth);
        if !content_type.is_empty() {
            req = req.header("content-type", content_type);
        }
        for (k, v) in extra_headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure request failed: {e}"))
    }

    fn render_block_list(block_ids: &[String]) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in block_ids {
            xml.push_str(&format!("<Latest>{id}</Latest>"));
        }
        xml.push_str("</BlockList>");
        xml
    }

    fn render_tag_set(tags: &[(String, String)]) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><Tags><TagSet>");
        for (k, v) in tags {
            xml.push_str(&format!("<Tag><Key>{k}</Key><Value>{v}</Value></Tag>"));
        }
        xml.push_str("</TagSet></Tags>");
        xml
    }
}

impl BackendClient for AzureBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Azure
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            copy_object: true,
            upload_part_copy: false,
            object_tagging: true,
            native_list_parts: false,
        }
    }

    fn put(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let blob_name = self.native_key(ctx);
        let mut headers = vec![("x-ms-blob-type".to_string(), "BlockBlob".to_string())];
        headers.extend(Self::meta_headers(&ctx.metadata_headers));
        let req_id = req_id.to_string();
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            debug!(req_id, container = %self.container, blob_name, "azure put blob");

            let resp = self
                .blob_request(
                    reqwest::Method::PUT,
                    &blob_name,
                    &[],
                    &headers,
                    "application/octet-stream",
                    Some(data),
                )
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("put blob", status, &body));
            }

            Ok(PutResult {
                key: blob_name,
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
        let blob_name = location.key.clone();
        Box::pin(async move {
            let mut headers = Vec::new();
            if let Some((first, last)) = range {
                headers.push(("x-ms-range".to_string(), format!("bytes={first}-{last}")));
            }

            let resp = self
                .blob_request(reqwest::Method::GET, &blob_name, &[], &headers, "", None)
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("get blob", status, &body));
            }
            let body = resp
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("Azure get blob body: {e}"))?;
            Ok(body)
        })
    }

    fn delete(
        &self,
        location: &DataLocation,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let blob_name = location.key.clone();
        Box::pin(async move {
            let resp = self
                .blob_request(reqwest::Method::DELETE, &blob_name, &[], &[], "", None)
                .await?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("delete blob", status, &body));
            }
            Ok(())
        })
    }

    fn create_mpu(
        &self,
        _ctx: &KeyContext,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        // Blocks are staged directly on the final blob; no remote state to
        // create up front.
        Box::pin(async { Ok(None) })
    }

    fn upload_part(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        upload_id: &str,
        _backend_upload_id: Option<&str>,
        part_number: u32,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let blob_name = self.native_key(ctx);
        let block_id = Self::block_id(upload_id, part_number);
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            let query = vec![
                ("comp".to_string(), "block".to_string()),
                ("blockid".to_string(), block_id),
            ];
            let resp = self
                .blob_request(
                    reqwest::Method::PUT,
                    &blob_name,
                    &query,
                    &[],
                    "application/octet-stream",
                    Some(data),
                )
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("put block", status, &body));
            }
            Ok(PutResult {
                key: blob_name,
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
        let blob_name = self.native_key(ctx);
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        let headers = Self::meta_headers(&ctx.metadata_headers);
        let req_id = req_id.to_string();
        Box::pin(async move {
            let block_ids: Vec<String> = parts
                .iter()
                .map(|p| Self::block_id(&upload_id, p.part_number))
                .collect();
            let body = Self::render_block_list(&block_ids);

            debug!(req_id, container = %self.container, blob_name, blocks = block_ids.len(), "azure put block list");
            let resp = self
                .blob_request(
                    reqwest::Method::PUT,
                    &blob_name,
                    &[("comp".to_string(), "blocklist".to_string())],
                    &headers,
                    "application/xml",
                    Some(Bytes::from(body)),
                )
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("put block list", status, &body));
            }

            // Composite ETag over the binary part MD5s, matching the other
            // backends.
            let mut combined = Vec::new();
            for part in &parts {
                if let Ok(bytes) = hex::decode(part.etag.trim_matches('"')) {
                    combined.extend_from_slice(&bytes);
                }
            }
            let mut hasher = md5::Md5::new();
            use md5::Digest;
            hasher.update(&combined);
            let etag = format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts.len());

            Ok(CompleteMpuResult {
                key: blob_name,
                etag,
                data_store_version_id: None,
                content_length: parts.iter().map(|p| p.size).sum(),
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
        // Uncommitted blocks expire on the service side; there is nothing
        // to delete here and callers must skip the post-abort data delete.
        Box::pin(async {
            Ok(AbortMpuResult {
                skip_data_delete: true,
            })
        })
    }

    fn copy_object(
        &self,
        source: &DataLocation,
        dest_ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let dest_blob = self.native_key(dest_ctx);
        let source_url = self.blob_url(&source.key);
        let mut headers = vec![("x-ms-copy-source".to_string(), source_url)];
        headers.extend(Self::meta_headers(&dest_ctx.metadata_headers));
        let req_id = req_id.to_string();
        Box::pin(async move {
            debug!(req_id, dest_blob, "azure copy blob");
            let resp = self
                .blob_request(reqwest::Method::PUT, &dest_blob, &[], &headers, "", None)
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("copy blob", status, &body));
            }
            Ok(PutResult {
                key: dest_blob,
                etag: None,
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
        let blob_name = location.key.clone();
        let body = Self::render_tag_set(tags);
        Box::pin(async move {
            let resp = self
                .blob_request(
                    reqwest::Method::PUT,
                    &blob_name,
                    &[("comp".to_string(), "tags".to_string())],
                    &[],
                    "application/xml",
                    Some(Bytes::from(body)),
                )
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_azure_error("set blob tags", status, &body));
            }
            Ok(())
        })
    }

    fn object_delete_tagging(
        &self,
        location: &DataLocation,
        metadata_headers: &HashMap<String, String>,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        // Clearing the tag set is a Set Blob Tags with an empty list.
        self.object_put_tagging(location, &[], metadata_headers, req_id)
    }

    fn check_health(&self, location_name: &str) -> BoxFuture<'_, LocationHealth> {
        let location_name = location_name.to_string();
        Box::pin(async move {
            let date = Self::rfc1123_date();
            let query = vec![("restype".to_string(), "container".to_string())];
            let auth = self.sign_request(
                "GET",
                &self.container,
                None,
                "",
                &date,
                &[],
                &query,
            );
            let url = format!("{}/{}?restype=container", self.base_url, self.container);
            let result = self
                .client
                .get(&url)
                .header("x-ms-date", &date)
                .header("x-ms-version", AZURE_API_VERSION)
                .header("authorization", auth)
                .send()
                .await;
            match result {
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
