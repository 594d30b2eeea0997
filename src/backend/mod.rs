//! Data backend clients.
//!
//! The [`BackendClient`] trait abstracts over where object bytes
//! physically live.  One variant exists per backend type: in-process
//! memory, local file tree, the scality HTTP data daemon, AWS S3, Azure
//! Blob Storage, and GCP Cloud Storage.
//!
//! Optional capabilities (native copy, part copy, tagging, native part
//! listing) are advertised through [`BackendCapabilities`] flags rather
//! than probed method pointers; the gateway turns a missing capability
//! into `NotImplemented`.

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

pub mod aws;
pub mod azure;
pub mod file;
pub mod gcp;
pub mod memory;
pub mod scality;

pub use crate::config::BackendType;

/// Boxed future alias used across client method signatures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// ETag of a zero-byte object.
pub const EMPTY_OBJECT_ETAG: &str = "\"d41d8cd98f00b204e9800998ecf8427e\"";

/// Compute the quoted MD5-hex ETag for a byte slice.
pub fn quoted_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Derive the backend-native key for a cloud location.
///
/// With `bucket_match` one S3 bucket maps 1:1 onto the remote bucket and
/// the object key is used alone; otherwise multiple S3 buckets are
/// multiplexed onto one remote bucket and the S3 bucket name becomes a
/// key prefix.  Fixed per location for the life of an object.
pub fn build_native_key(bucket: &str, key: &str, bucket_match: bool) -> String {
    if bucket_match {
        key.to_string()
    } else {
        format!("{bucket}/{key}")
    }
}

/// The opaque record returned by a successful PUT and consumed by
/// GET/DELETE ("data retrieval info").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLocation {
    /// Backend-native object identifier.
    pub key: String,
    /// Location constraint that holds the data.
    pub data_store_name: String,
    /// Backend-type wire tag (`mem`, `file`, `scality`, `aws_s3`, ...).
    pub data_store_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_store_etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_store_version_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphered_data_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_scheme: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key_id: Option<String>,
}

impl DataLocation {
    pub fn new(key: String, location: &str, backend_type: BackendType, size: u64) -> Self {
        Self {
            key,
            data_store_name: location.to_string(),
            data_store_type: backend_type.as_str().to_string(),
            size,
            data_store_etag: None,
            data_store_version_id: None,
            ciphered_data_key: None,
            crypto_scheme: None,
            master_key_id: None,
        }
    }
}

/// Retrieval argument accepted by GET/DELETE.
///
/// Records that predate `dataStoreName` are bare backend keys; the
/// gateway routes those to the `legacy` client.
#[derive(Debug, Clone)]
pub enum ObjectGetInfo {
    Record(DataLocation),
    LegacyKey(String),
}

/// Everything a backend needs to name and annotate one object write.
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub bucket_name: String,
    pub object_key: String,
    /// `x-amz-meta-*` headers (lowercased full names).
    pub metadata_headers: HashMap<String, String>,
    /// Query-string-encoded tag set (`k=v&k2=v2`).
    pub tagging: Option<String>,
    pub content_type: Option<String>,
}

impl KeyContext {
    pub fn new(bucket: &str, key: &str) -> Self {
        Self {
            bucket_name: bucket.to_string(),
            object_key: key.to_string(),
            ..Self::default()
        }
    }
}

/// Result of a backend PUT.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Backend-native key the data landed under.
    pub key: String,
    /// Quoted MD5 hex of the written bytes.
    pub etag: Option<String>,
    /// Remote version id, when the backend versions objects itself.
    pub data_store_version_id: Option<String>,
}

/// Result of completing a multipart upload at the backend.
#[derive(Debug, Clone)]
pub struct CompleteMpuResult {
    pub key: String,
    /// Composite ETag (`"{md5}-{n}"`).
    pub etag: String,
    pub data_store_version_id: Option<String>,
    pub content_length: u64,
}

/// Result of aborting a multipart upload at the backend.
///
/// `skip_data_delete` is set by backends whose abort already discards
/// staged data (azure block blobs); callers must not attempt a follow-up
/// data delete when it is set.
#[derive(Debug, Clone, Default)]
pub struct AbortMpuResult {
    pub skip_data_delete: bool,
}

/// One part reference handed to `complete_mpu`.
#[derive(Debug, Clone)]
pub struct MpuPartRef {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    /// Backend-native part key (internal backends).
    pub key: Option<String>,
}

/// One part entry returned by a native part listing.
#[derive(Debug, Clone)]
pub struct NativePart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: String,
}

/// In-band healthcheck result; probing never throws.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LocationHealth {
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocationHealth {
    pub fn ok() -> Self {
        Self {
            code: 200,
            message: Some("OK".to_string()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: None,
            error: Some(message.into()),
        }
    }
}

/// Optional capability flags per variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCapabilities {
    pub copy_object: bool,
    pub upload_part_copy: bool,
    pub object_tagging: bool,
    pub native_list_parts: bool,
}

/// Inclusive byte range `[first, last]`.
pub type ByteRange = (u64, u64);

/// Async contract every backend client satisfies.
///
/// Methods are hand-desugared to pinned boxed futures so the trait stays
/// object-safe; optional operations have refusing default bodies and are
/// gated by [`BackendCapabilities`] at the gateway.
pub trait BackendClient: Send + Sync + 'static {
    fn backend_type(&self) -> BackendType;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Write `data`, returning the native key and MD5 ETag.
    fn put(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>>;

    /// Read back one location record, optionally a byte range.
    fn get(
        &self,
        location: &DataLocation,
        range: Option<ByteRange>,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Bytes>>;

    /// Delete one location record.  Idempotent on "not found".
    fn delete(&self, location: &DataLocation, req_id: &str)
        -> BoxFuture<'_, anyhow::Result<()>>;

    /// Start a multipart upload; returns the backend-native upload id
    /// when the backend runs its own MPU machinery.
    fn create_mpu(
        &self,
        ctx: &KeyContext,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Option<String>>>;

    /// Write one part.
    #[allow(clippy::too_many_arguments)]
    fn upload_part(
        &self,
        data: Bytes,
        ctx: &KeyContext,
        upload_id: &str,
        backend_upload_id: Option<&str>,
        part_number: u32,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>>;

    /// Assemble previously uploaded parts into the final object.
    fn complete_mpu(
        &self,
        ctx: &KeyContext,
        upload_id: &str,
        backend_upload_id: Option<&str>,
        parts: &[MpuPartRef],
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<CompleteMpuResult>>;

    /// Abort a multipart upload and discard staged parts.
    fn abort_mpu(
        &self,
        ctx: &KeyContext,
        upload_id: &str,
        backend_upload_id: Option<&str>,
        req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<AbortMpuResult>>;

    /// Native part listing (aws_s3 only).
    fn list_parts(
        &self,
        _ctx: &KeyContext,
        _backend_upload_id: &str,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<Vec<NativePart>>> {
        Box::pin(async { anyhow::bail!("part listing is not supported by this backend") })
    }

    /// Same-backend server-side copy.
    fn copy_object(
        &self,
        _source: &DataLocation,
        _dest_ctx: &KeyContext,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        Box::pin(async { anyhow::bail!("object copy is not supported by this backend") })
    }

    /// Same-backend server-side part copy.
    fn upload_part_copy(
        &self,
        _source: &DataLocation,
        _dest_ctx: &KeyContext,
        _backend_upload_id: &str,
        _part_number: u32,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<PutResult>> {
        Box::pin(async { anyhow::bail!("part copy is not supported by this backend") })
    }

    /// Replace the object's tag set at the backend.
    fn object_put_tagging(
        &self,
        _location: &DataLocation,
        _tags: &[(String, String)],
        _metadata_headers: &HashMap<String, String>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { anyhow::bail!("object tagging is not supported by this backend") })
    }

    /// Remove the object's tag set at the backend.
    fn object_delete_tagging(
        &self,
        _location: &DataLocation,
        _metadata_headers: &HashMap<String, String>,
        _req_id: &str,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { anyhow::bail!("object tagging is not supported by this backend") })
    }

    /// Probe this backend's liveness.  Errors are returned in-band.
    fn check_health(&self, _location_name: &str) -> BoxFuture<'_, LocationHealth> {
        Box::pin(async { LocationHealth::ok() })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
