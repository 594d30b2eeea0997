//! Abstract metadata-plane contract.
//!
//! The metadata store proper is an external collaborator; this module
//! defines the narrow interface the gateway needs from it: versioned
//! object records, bucket attributes and flags, the per-owner bucket
//! index ("users bucket"), and the shadow bucket that tracks in-flight
//! multipart uploads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backend::DataLocation;

/// Splitter used in users-bucket index keys.
pub const SPLITTER: &str = "..|..";
/// Splitter used by the previous index layout; reads tolerate both.
pub const LEGACY_SPLITTER: &str = "::";

/// Prefix of the hidden bucket that shadows in-flight MPUs.
pub const MPU_SHADOW_PREFIX: &str = "mpuShadowBucket";

/// Key prefix of MPU overview records inside the shadow bucket.
pub const MPU_OVERVIEW_PREFIX: &str = "overview";

/// Replication status stamped on objects written by the replication
/// worker.
pub const REPLICA_STATUS: &str = "REPLICA";

/// Generate an opaque, lexically increasing version id.
pub fn generate_version_id() -> String {
    let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let unique = uuid::Uuid::new_v4().simple();
    format!("{micros:016x}-{unique}")
}

/// Bucket versioning state machine: None -> Enabled <-> Suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VersioningState {
    #[default]
    None,
    Enabled,
    Suspended,
}

/// Per-bucket server-side-encryption settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Only `AES256` is supported.
    pub algorithm: String,
    /// KMS master key backing this bucket.
    pub master_key_id: String,
}

/// Bucket attributes and lifecycle flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketInfo {
    pub name: String,
    pub owner_canonical_id: String,
    /// Default location constraint for objects in this bucket.
    pub location_constraint: String,
    pub versioning: VersioningState,
    pub sse: Option<SseConfig>,
    /// Set while the bucket is being created; cleared on first success.
    pub transient: bool,
    /// Set by the deletion pipeline before the metadata is removed, so a
    /// crash mid-pipeline leaves the bucket recoverable by the sweeper.
    pub deleted: bool,
    pub created_at: String,
}

/// One version of an object, or a delete marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub key: String,
    /// Absent on never-versioned buckets; `"null"` for writes made while
    /// versioning is suspended.
    pub version_id: Option<String>,
    pub is_delete_marker: bool,
    pub size: u64,
    /// Quoted MD5 hex ETag.
    pub etag: String,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub expires: Option<String>,
    pub website_redirect_location: Option<String>,
    /// `x-amz-meta-*` headers, lowercased full names.
    pub user_metadata: HashMap<String, String>,
    /// Decoded tag pairs.
    pub tags: Vec<(String, String)>,
    pub owner_canonical_id: String,
    /// Canned ACL: `private` or `public-read`.
    pub acl: String,
    pub last_modified: String,
    /// Physical placement of the data.
    pub locations: Vec<DataLocation>,
    /// `REPLICA` for objects written by the replication worker.
    pub replication_status: Option<String>,
}

impl ObjectMetadata {
    /// Whether a foreign account may read this object.
    pub fn is_public_read(&self) -> bool {
        self.acl == "public-read"
    }
}

/// How a write interacts with the bucket's version chain.
#[derive(Debug, Clone)]
pub struct PutVersionOptions {
    pub versioning: VersioningState,
    /// Supplied by replica writes; generated otherwise.
    pub version_id: Option<String>,
}

/// Listing entry used by the bucket-emptiness check.
#[derive(Debug, Clone)]
pub struct VersionListEntry {
    pub key: String,
    pub version_id: Option<String>,
    pub is_delete_marker: bool,
}

/// Overview record of one in-flight multipart upload.
#[derive(Debug, Clone)]
pub struct MpuRecord {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub owner_canonical_id: String,
    /// Controlling location constraint chosen at initiate time.
    pub location: String,
    /// Backend-native upload id, when the backend runs its own MPU.
    pub backend_upload_id: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub tagging: Option<String>,
    /// Content-Type supplied at initiate time, stamped onto the
    /// completed object.
    pub content_type: Option<String>,
    pub initiated_at: String,
}

/// One uploaded part of an in-flight MPU.
#[derive(Debug, Clone)]
pub struct MpuPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: String,
    pub locations: Vec<DataLocation>,
}

/// Async metadata-plane contract.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    // ── Buckets ─────────────────────────────────────────────────────

    async fn create_bucket(&self, info: BucketInfo) -> anyhow::Result<()>;

    async fn get_bucket(&self, name: &str) -> anyhow::Result<Option<BucketInfo>>;

    /// Replace bucket attributes (flags, versioning, sse).
    async fn put_bucket(&self, info: BucketInfo) -> anyhow::Result<()>;

    /// Remove bucket metadata.  Not-found is not an error (the invisible
    /// delete sweeper replays this).
    async fn delete_bucket(&self, name: &str) -> anyhow::Result<()>;

    // ── Objects ─────────────────────────────────────────────────────

    /// Write one object version per `opts`, returning the version id the
    /// write was stored under (`None` on never-versioned buckets).
    async fn put_object(
        &self,
        meta: ObjectMetadata,
        opts: PutVersionOptions,
    ) -> anyhow::Result<Option<String>>;

    /// Read the tip (`version_id: None`) or a specific version.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> anyhow::Result<Option<ObjectMetadata>>;

    /// Remove a specific version (tip is re-derived from the remainder).
    async fn delete_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> anyhow::Result<()>;

    /// Remove the whole key (unversioned delete).
    async fn delete_object(&self, bucket: &str, key: &str) -> anyhow::Result<()>;

    /// List up to `max_keys` versions and delete markers across the
    /// bucket, in key order.
    async fn list_versions(
        &self,
        bucket: &str,
        max_keys: usize,
    ) -> anyhow::Result<Vec<VersionListEntry>>;

    // ── Users bucket ────────────────────────────────────────────────

    /// Record `bucket` in `owner`'s bucket index.
    async fn add_user_bucket(&self, owner: &str, bucket: &str) -> anyhow::Result<()>;

    /// Remove `bucket` from `owner`'s index.  Tolerates both the current
    /// and the legacy key layout; not-found in either is not an error.
    async fn remove_user_bucket(&self, owner: &str, bucket: &str) -> anyhow::Result<()>;

    // ── Shadow MPU bucket ───────────────────────────────────────────

    async fn create_mpu(&self, record: MpuRecord) -> anyhow::Result<()>;

    async fn get_mpu(&self, bucket: &str, upload_id: &str) -> anyhow::Result<Option<MpuRecord>>;

    async fn delete_mpu(&self, bucket: &str, upload_id: &str) -> anyhow::Result<()>;

    /// List up to `max_keys` MPU overview keys for the in-flight check.
    async fn list_mpu_overviews(&self, bucket: &str, max_keys: usize)
        -> anyhow::Result<Vec<String>>;

    async fn put_mpu_part(
        &self,
        bucket: &str,
        upload_id: &str,
        part: MpuPart,
    ) -> anyhow::Result<()>;

    /// Parts in ascending part-number order.
    async fn list_mpu_parts(&self, bucket: &str, upload_id: &str) -> anyhow::Result<Vec<MpuPart>>;
}

// ── Tests ───────────────────────────────────────────────────────────
