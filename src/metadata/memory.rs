//! In-memory metadata-plane implementation.
//!
//! Version chains are kept per key in insertion order; the tip is the
//! most recently written version.  Good enough to drive the full gateway
//! test suite without an external metadata service.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use super::store::{
    generate_version_id, BucketInfo, MetadataStore, MpuPart, MpuRecord, ObjectMetadata,
    PutVersionOptions, VersionListEntry, VersioningState, LEGACY_SPLITTER, MPU_OVERVIEW_PREFIX,
    MPU_SHADOW_PREFIX, SPLITTER,
};

/// The `"null"` version id used for writes while versioning is suspended.
const NULL_VERSION_ID: &str = "null";

type VersionChain = Vec<ObjectMetadata>;
type MpuEntry = (MpuRecord, BTreeMap<u32, MpuPart>);

/// In-memory [`MetadataStore`].
#[derive(Default)]
pub struct MemoryMetadataStore {
    buckets: RwLock<HashMap<String, BucketInfo>>,
    /// bucket -> key -> versions (newest last).
    objects: RwLock<HashMap<String, BTreeMap<String, VersionChain>>>,
    /// Users-bucket index keys: `{owner}{SPLITTER}{bucket}`.
    users: RwLock<HashSet<String>>,
    /// shadow-bucket name -> upload id -> (overview, parts).
    mpus: RwLock<HashMap<String, HashMap<String, MpuEntry>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shadow_bucket(bucket: &str) -> String {
        format!("{MPU_SHADOW_PREFIX}{bucket}")
    }

    fn overview_key(key: &str, upload_id: &str) -> String {
        format!("{MPU_OVERVIEW_PREFIX}{SPLITTER}{key}{SPLITTER}{upload_id}")
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_bucket(&self, info: BucketInfo) -> anyhow::Result<()> {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(&info.name) {
            anyhow::bail!("bucket already exists: {}", info.name);
        }
        buckets.insert(info.name.clone(), info);
        Ok(())
    }

    async fn get_bucket(&self, name: &str) -> anyhow::Result<Option<BucketInfo>> {
        Ok(self.buckets.read().await.get(name).cloned())
    }

    async fn put_bucket(&self, info: BucketInfo) -> anyhow::Result<()> {
        self.buckets.write().await.insert(info.name.clone(), info);
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> anyhow::Result<()> {
        self.buckets.write().await.remove(name);
        self.objects.write().await.remove(name);
        Ok(())
    }

    async fn put_object(
        &self,
        mut meta: ObjectMetadata,
        opts: PutVersionOptions,
    ) -> anyhow::Result<Option<String>> {
        let mut objects = self.objects.write().await;
        let keys = objects.entry(meta.bucket.clone()).or_default();
        let chain = keys.entry(meta.key.clone()).or_default();

        match opts.versioning {
            VersioningState::None => {
                meta.version_id = None;
                chain.clear();
                chain.push(meta);
                Ok(None)
            }
            VersioningState::Enabled => {
                let id = opts.version_id.unwrap_or_else(generate_version_id);
                meta.version_id = Some(id.clone());
                // A replayed replica write replaces its own version in place.
                if let Some(existing) = chain
                    .iter_mut()
                    .find(|v| v.version_id.as_deref() == Some(id.as_str()))
                {
                    *existing = meta;
                } else {
                    chain.push(meta);
                }
                Ok(Some(id))
            }
            VersioningState::Suspended => {
                meta.version_id = Some(NULL_VERSION_ID.to_string());
                chain.retain(|v| v.version_id.as_deref() != Some(NULL_VERSION_ID));
                chain.push(meta);
                Ok(Some(NULL_VERSION_ID.to_string()))
            }
        }
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> anyhow::Result<Option<ObjectMetadata>> {
        let objects = self.objects.read().await;
        let chain = match objects.get(bucket).and_then(|keys| keys.get(key)) {
            Some(chain) => chain,
            None => return Ok(None),
        };
        match version_id {
            Some(vid) => Ok(chain
                .iter()
                .find(|v| v.version_id.as_deref() == Some(vid))
                .cloned()),
            None => Ok(chain.last().cloned()),
        }
    }

    async fn delete_version(
        &self,
        bucket: &str,
        key: &str,
        version_id: &str,
    ) -> anyhow::Result<()> {
        let mut objects = self.objects.write().await;
        if let Some(keys) = objects.get_mut(bucket) {
            if let Some(chain) = keys.get_mut(key) {
                chain.retain(|v| v.version_id.as_deref() != Some(version_id));
                if chain.is_empty() {
                    keys.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        let mut objects = self.objects.write().await;
        if let Some(keys) = objects.get_mut(bucket) {
            keys.remove(key);
        }
        Ok(())
    }

    async fn list_versions(
        &self,
        bucket: &str,
        max_keys: usize,
    ) -> anyhow::Result<Vec<VersionListEntry>> {
        let objects = self.objects.read().await;
        let mut out = Vec::new();
        if let Some(keys) = objects.get(bucket) {
            'outer: for (key, chain) in keys.iter() {
                for version in chain {
                    out.push(VersionListEntry {
                        key: key.clone(),
                        version_id: version.version_id.clone(),
                        is_delete_marker: version.is_delete_marker,
                    });
                    if out.len() >= max_keys {
                        break 'outer;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn add_user_bucket(&self, owner: &str, bucket: &str) -> anyhow::Result<()> {
        self.users
            .write()
            .await
            .insert(format!("{owner}{SPLITTER}{bucket}"));
        Ok(())
    }

    async fn remove_user_bucket(&self, owner: &str, bucket: &str) -> anyhow::Result<()> {
        let mut users = self.users.write().await;
        users.remove(&format!("{owner}{SPLITTER}{bucket}"));
        users.remove(&format!("{owner}{LEGACY_SPLITTER}{bucket}"));
        Ok(())
    }

    async fn create_mpu(&self, record: MpuRecord) -> anyhow::Result<()> {
        let shadow = Self::shadow_bucket(&record.bucket);
        let mut mpus = self.mpus.write().await;
        mpus.entry(shadow)
            .or_default()
            .insert(record.upload_id.clone(), (record, BTreeMap::new()));
        Ok(())
    }

    async fn get_mpu(&self, bucket: &str, upload_id: &str) -> anyhow::Result<Option<MpuRecord>> {
        let mpus = self.mpus.read().await;
        Ok(mpus
            .get(&Self::shadow_bucket(bucket))
            .and_then(|uploads| uploads.get(upload_id))
            .map(|(record, _)| record.clone()))
    }

    async fn delete_mpu(&self, bucket: &str, upload_id: &str) -> anyhow::Result<()> {
        let mut mpus = self.mpus.write().await;
        if let Some(uploads) = mpus.get_mut(&Self::shadow_bucket(bucket)) {
            uploads.remove(upload_id);
        }
        Ok(())
    }

    async fn list_mpu_overviews(
        &self,
        bucket: &str,
        max_keys: usize,
    ) -> anyhow::Result<Vec<String>> {
        let mpus = self.mpus.read().await;
        let mut keys: Vec<String> = mpus
            .get(&Self::shadow_bucket(bucket))
            .map(|uploads| {
                uploads
                    .values()
                    .map(|(record, _)| Self::overview_key(&record.key, &record.upload_id))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys.truncate(max_keys);
        Ok(keys)
    }

    async fn put_mpu_part(
        &self,
        bucket: &str,
        upload_id: &str,
        part: MpuPart,
    ) -> anyhow::Result<()> {
        let mut mpus = self.mpus.write().await;
        let uploads = mpus
            .get_mut(&Self::shadow_bucket(bucket))
            .ok_or_else(|| anyhow::anyhow!("no such upload: {upload_id}"))?;
        let (_, parts) = uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow::anyhow!("no such upload: {upload_id}"))?;
        parts.insert(part.part_number, part);
        Ok(())
    }

    async fn list_mpu_parts(&self, bucket: &str, upload_id: &str) -> anyhow::Result<Vec<MpuPart>> {
        let mpus = self.mpus.read().await;
        Ok(mpus
            .get(&Self::shadow_bucket(bucket))
            .and_then(|uploads| uploads.get(upload_id))
            .map(|(_, parts)| parts.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
