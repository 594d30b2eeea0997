//! GCP Cloud Storage backend client.
//!
//! Talks to the GCS JSON API through `reqwest`.  GCS has no distinct
//! tagging API, so tags are folded into the native metadata map under a
//! `tag-` prefix; both put-tagging and delete-tagging rewrite the full
//! metadata map.
//!
//! Multipart strategy stages parts as temporary objects and assembles
//! them with `compose` (chained when more than 32 sources), then deletes
//! the staged parts.
//!
//! Credentials resolve from the configured credential file (the
//! `GCP_CRED` environment variable wins), falling back to the GCE
//! metadata server.  Service-account keys use the signed-JWT exchange;
//! `authorized_user` files use the refresh-token flow.

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::LocationDetails;

use super::{
    build_native_key, AbortMpuResult, BackendCapabilities, BackendClient, BackendType, BoxFuture,
    ByteRange, CompleteMpuResult, DataLocation, KeyContext, MpuPartRef, PutResult,
};

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1";

/// GCS media-upload base URL.
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

/// compose() accepts at most 32 source objects per call.
const MAX_COMPOSE_SOURCES: usize = 32;

/// Metadata-map prefix for folded-in tags.
const TAG_META_PREFIX: &str = "tag-";

#[derive(Debug, Serialize)]
struct ComposeSourceObject {
    name: String,
}

#[derive(Debug, Serialize)]
struct ComposeRequest {
    #[serde(rename = "sourceObjects")]
    source_objects: Vec<ComposeSourceObject>,
    destination: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

struct CachedToken {
    access_token: String,
    expiry: std::time::Instant,
}

/// [`BackendClient`] backed by one GCS bucket.
pub struct GcpBackend {
    client: reqwest::Client,
    bucket: String,
    bucket_match: bool,
    credentials_file: Option<String>,
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcpBackend {
    /// Build the client for one `gcp` location.
    pub fn new(location: &str, details: &LocationDetails) -> anyhow::Result<Self> {
        if details.bucket_name.is_empty() {
            anyhow::bail!("gcp location {location} has no bucket_name");
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        info!(
            location,
            bucket = %details.bucket_name,
            bucket_match = details.bucket_match,
            "gcp backend initialized"
        );

        Ok(Self {
            client,
            bucket: details.bucket_name.clone(),
            bucket_match: details.bucket_match,
            credentials_file: details.gcp_credentials_file.clone(),
            token_cache: Mutex::new(None),
        })
    }

    fn native_key(&self, ctx: &KeyContext) -> String {
        build_native_key(&ctx.bucket_name, &ctx.object_key, self.bucket_match)
    }

    fn encode_object(name: &str) -> String {
        utf8_percent_encode(name, NON_ALPHANUMERIC).to_string()
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{GCS_API_BASE}/b/{}/o/{}",
            self.bucket,
            Self::encode_object(name)
        )
    }

    /// Fold user metadata and tags into one native metadata map.
    fn native_metadata(
        headers: &HashMap<String, String>,
        tags: &[(String, String)],
    ) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| {
                let name = k.strip_prefix("x-amz-meta-").unwrap_or(k);
                (name.to_string(), v.clone())
            })
            .collect();
        for (k, v) in tags {
            map.insert(format!("{TAG_META_PREFIX}{k}"), v.clone());
        }
        map
    }

    /// Decode the `k=v&k2=v2` tagging form into pairs.
    fn decode_tag_query(tagging: &str) -> Vec<(String, String)> {
        tagging
            .split('&')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                let k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                Some((k, v))
            })
            .collect()
    }

    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }

    // ── Token resolution ────────────────────────────────────────────

    async fn access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.token_cache.lock().expect("token cache mutex poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.expiry > std::time::Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;
        let margin = expires_in.saturating_sub(60);
        {
            let mut cache = self.token_cache.lock().expect("token cache mutex poisoned");
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expiry: std::time::Instant::now() + std::time::Duration::from_secs(margin),
            });
        }
        Ok(token)
    }

    async fn fetch_access_token(&self) -> anyhow::Result<(String, u64)> {
        if let Some(ref path) = self.credentials_file {
            return self.token_from_credentials_file(path).await;
        }
        self.token_from_metadata_server().await
    }

    async fn token_from_credentials_file(&self, path: &str) -> anyhow::Result<(String, u64)> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read GCP credentials {path}: {e}"))?;
        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse GCP credentials: {e}"))?;

        match creds.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "service_account" => {
                let client_email = creds
                    .get("client_email")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing client_email in credentials"))?;
                let private_key = creds
                    .get("private_key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing private_key in credentials"))?;
                let token_uri = creds
                    .get("token_uri")
                    .and_then(|v| v.as_str())
                    .unwrap_or("https://oauth2.googleapis.com/token");
                self.exchange_jwt_for_token(client_email, private_key, token_uri)
                    .await
            }
            "authorized_user" => {
                self.token_from_refresh(
                    creds.get("client_id").and_then(|v| v.as_str()).unwrap_or(""),
                    creds
                        .get("client_secret")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                    creds
                        .get("refresh_token")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                )
                .await
            }
            other => Err(anyhow::anyhow!(
                "unsupported GCP credential type in {path}: {other}"
            )),
        }
    }

    async fn exchange_jwt_for_token(
        &self,
        client_email: &str,
        private_key: &str,
        token_uri: &str,
    ) -> anyhow::Result<(String, u64)> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: u64,
            exp: u64,
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            iss: client_email,
            scope: "https://www.googleapis.com/auth/devstorage.read_write",
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid service-account private key: {e}"))?;
        let jwt = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| anyhow::anyhow!("JWT signing failed: {e}"))?;

        let resp = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", jwt.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("token exchange request failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token exchange failed ({status}): {body}");
        }
        let token: TokenResponse = resp.json().await?;
        Ok((token.access_token, token.expires_in))
    }

    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("token refresh request failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token refresh failed ({status}): {body}");
        }
        let token: TokenResponse = resp.json().await?;
        Ok((token.access_token, token.expires_in))
    }

    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let resp = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("metadata server unreachable: {e}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("metadata server token fetch failed: HTTP {}", resp.status());
        }
        let token: TokenResponse = resp.json().await?;
        Ok((token.access_token, token.expires_in))
    }

    // ── GCS operations ──────────────────────────────────────────────

    async fn upload_object(&self, name: &str, data: Bytes) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let url = format!(
            "{GCS_UPLOAD_BASE}/b/{}/o?uploadType=media&name={}",
            self.bucket,
            Self::encode_object(name)
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("content-type", "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("upload", status, &body));
        }
        Ok(())
    }

    /// PATCH the object resource with a full replacement metadata map.
    async fn patch_metadata(
        &self,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let body = serde_json::json!({ "metadata": metadata });
        let resp = self
            .client
            .patch(self.object_url(name))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS metadata patch failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("metadata patch", status, &body));
        }
        Ok(())
    }

    async fn delete_raw(&self, name: &str) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .delete(self.object_url(name))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS delete request failed: {e}"))?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("delete", status, &body));
        }
        Ok(())
    }

    async fn compose(&self, sources: &[String], dest: &str) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let url = format!("{}/compose", self.object_url(dest));
        let req_body = ComposeRequest {
            source_objects: sources
                .iter()
                .map(|name| ComposeSourceObject { name: name.clone() })
                .collect(),
            destination: serde_json::json!({ "contentType": "application/octet-stream" }),
        };
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&req_body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS compose request failed: {e}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("compose", status, &body));
        }
        Ok(())
    }

    fn part_name(key: &str, upload_id: &str, part_number: u32) -> String {
        format!("{key}-{upload_id}-{part_number:05}")
    }
}

impl BackendClient for GcpBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Gcp
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
        let name = self.native_key(ctx);
        let tags = ctx
            .tagging
            .as_deref()
            .map(Self::decode_tag_query)
            .unwrap_or_default();
        let metadata = Self::native_metadata(&ctx.metadata_headers, &tags);
        let req_id = req_id.to_string();
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            debug!(req_id, bucket = %self.bucket, name, "gcp upload");
            self.upload_object(&name, data).await?;
            if !metadata.is_empty() {
                self.patch_metadata(&name, &metadata).await?;
            }
            Ok(PutResult {
                key: name,
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
        let name = location.key.clone();
        Box::pin(async move {
            let token = self.access_token().await?;
            let url = format!("{}?alt=media", self.object_url(&name));
            let mut req = self.client.get(&url).bearer_auth(&token);
            if let Some((first, last)) = range {
                req = req.header("range", format!("bytes={first}-{last}"));
            }
            let resp = req
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS download request failed: {e}"))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_gcs_error("download", status, &body));
            }
            let body = resp
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("GCS download body: {e}"))?;
            Ok(body)
        })
    }

    fn delete(
        &self,
        location: &DataLocation,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let name = location.key.clone();
        Box::pin(async move { self.delete_raw(&name).await })
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
        ctx: &KeyContext,
        upload_id: &str,
        _backend_upload_id: Option<&str>,
        part_number: u32,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let part_name = Self::part_name(&self.native_key(ctx), upload_id, part_number);
        Box::pin(async move {
            let etag = super::quoted_md5(&data);
            self.upload_object(&part_name, data).await?;
            Ok(PutResult {
                key: part_name,
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
        let final_name = self.native_key(ctx);
        let upload_id = upload_id.to_string();
        let parts = parts.to_vec();
        let req_id = req_id.to_string();
        Box::pin(async move {
            let mut sources: Vec<String> = parts
                .iter()
                .map(|p| Self::part_name(&final_name, &upload_id, p.part_number))
                .collect();
            let staged = sources.clone();

            debug!(req_id, bucket = %self.bucket, final_name, parts = parts.len(), "gcp compose");

            // compose() takes at most 32 sources; fold larger uploads into
            // intermediate objects first.
            let mut round = 0usize;
            while sources.len() > MAX_COMPOSE_SOURCES {
                let mut next = Vec::new();
                for (i, chunk) in sources.chunks(MAX_COMPOSE_SOURCES).enumerate() {
                    let intermediate = format!("{final_name}-{upload_id}-compose-{round}-{i}");
                    self.compose(chunk, &intermediate).await?;
                    next.push(intermediate);
                }
                round += 1;
                sources = next;
            }
            self.compose(&sources, &final_name).await?;

            // Staged parts and intermediates are no longer needed.
            for name in staged.iter().chain(sources.iter()) {
                if name != &final_name {
                    let _ = self.delete_raw(name).await;
                }
            }

            let mut combined = Vec::new();
            for part in &parts {
                if let Ok(bytes) = hex::decode(part.etag.trim_matches('"')) {
                    combined.extend_from_slice(&bytes);
                }
            }
            use md5::Digest;
            let mut hasher = md5::Md5::new();
            hasher.update(&combined);
            let etag = format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts.len());

            Ok(CompleteMpuResult {
                key: final_name,
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
        // Staged parts are standalone objects whose locations the caller
        // recorded; the follow-up data delete sweeps them.
        Box::pin(async { Ok(AbortMpuResult::default()) })
    }

    fn copy_object(
        &self,
        source: &DataLocation,
        dest_ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        let dest_name = self.native_key(dest_ctx);
        let source_name = source.key.clone();
        let tags = dest_ctx
            .tagging
            .as_deref()
            .map(Self::decode_tag_query)
            .unwrap_or_default();
        let metadata = Self::native_metadata(&dest_ctx.metadata_headers, &tags);
        let req_id = req_id.to_string();
        Box::pin(async move {
            let token = self.access_token().await?;
            let url = format!(
                "{}/rewriteTo/b/{}/o/{}",
                self.object_url(&source_name),
                self.bucket,
                Self::encode_object(&dest_name)
            );
            debug!(req_id, source_name, dest_name, "gcp rewrite");

            // Single-bucket rewrites complete in one round; loop on the
            // rewrite token anyway.
            let mut rewrite_token: Option<String> = None;
            loop {
                let mut req = self.client.post(&url).bearer_auth(&token);
                if let Some(ref t) = rewrite_token {
                    req = req.query(&[("rewriteToken", t)]);
                }
                let resp = req
                    .header("content-length", "0")
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("GCS rewrite request failed: {e}"))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Self::map_gcs_error("rewrite", status, &body));
                }
                let body: serde_json::Value = resp.json().await?;
                if body.get("done").and_then(|v| v.as_bool()).unwrap_or(true) {
                    break;
                }
                rewrite_token = body
                    .get("rewriteToken")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }

            if !metadata.is_empty() {
                self.patch_metadata(&dest_name, &metadata).await?;
            }

            Ok(PutResult {
                key: dest_name,
                etag: None,
                data_store_version_id: None,
            })
        })
    }

    fn object_put_tagging(
        &self,
        location: &DataLocation,
        tags: &[(String, String)],
        metadata_headers: &HashMap<String, String>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        // No tagging API: rewrite the whole metadata map with the tags
        // folded in.
        let name = location.key.clone();
        let metadata = Self::native_metadata(metadata_headers, tags);
        Box::pin(async move { self.patch_metadata(&name, &metadata).await })
    }

    fn object_delete_tagging(
        &self,
        location: &DataLocation,
        metadata_headers: &HashMap<String, String>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let name = location.key.clone();
        let metadata = Self::native_metadata(metadata_headers, &[]);
        Box::pin(async move { self.patch_metadata(&name, &metadata).await })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationDetails;

    fn backend() -> GcpBackend {
        let details = LocationDetails {
            bucket_name: "gcs-bucket".to_string(),
            bucket_match: true,
            ..LocationDetails::default()
        };
        GcpBackend::new("gcp-test", &details).unwrap()
    }

    #[test]
    fn test_native_metadata_folds_tags_with_prefix() {
        let mut headers = HashMap::new();
        headers.insert("x-amz-meta-color".to_string(), "blue".to_string());
        let tags = vec![("env".to_string(), "prod".to_string())];
        let map = GcpBackend::native_metadata(&headers, &tags);
        assert_eq!(map.get("color").map(String::as_str), Some("blue"));
        assert_eq!(map.get("tag-env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_delete_tagging_map_drops_tags_only() {
        let mut headers = HashMap::new();
        headers.insert("x-amz-meta-color".to_string(), "blue".to_string());
        let map = GcpBackend::native_metadata(&headers, &[]);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("color"));
    }

    #[test]
    fn test_decode_tag_query() {
        let pairs = GcpBackend::decode_tag_query("a=1&b%20c=2%263");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b c".to_string(), "2&3".to_string())
            ]
        );
    }

    #[test]
    fn test_object_url_encodes_name() {
        let backend = backend();
        let url = backend.object_url("a/b c.txt");
        assert!(url.ends_with("/o/a%2Fb%20c%2Etxt"));
    }

    #[test]
    fn test_part_names_sort_by_part_number() {
        let a = GcpBackend::part_name("k", "u", 2);
        let b = GcpBackend::part_name("k", "u", 10);
        assert!(a < b);
    }
}
