//! Multi-backend gateway: the uniform façade over all backend clients.
//!
//! Every operation is dispatched to `clients[controlling location]`.
//! Optional capabilities are gated here: a missing capability produces
//! `NotImplemented` with a description naming the source and target
//! backend types.  Backend failures are wrapped as `InternalError` with
//! the backend's message interpolated; the original cause is logged,
//! never exposed.

use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::backend::{
    AbortMpuResult, BackendType, ByteRange, DataLocation, KeyContext, LocationHealth, MpuPartRef,
    NativePart, ObjectGetInfo,
};
use crate::errors::S3Error;
use crate::location::{LocationRegistry, LEGACY_LOCATION};

/// Uniform façade over the location registry's clients.
pub struct MultiBackendGateway {
    registry: Arc<LocationRegistry>,
}

impl MultiBackendGateway {
    pub fn new(registry: Arc<LocationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    fn client_for(
        &self,
        location: &str,
    ) -> Result<Arc<dyn crate::backend::BackendClient>, S3Error> {
        self.registry.client(location).ok_or_else(|| {
            error!(location, "no data backend matching controlling locationConstraint");
            S3Error::internal("dispatch", format!("no backend for location {location}"))
        })
    }

    /// Resolve a retrieval argument to `(client, location record)`.
    ///
    /// Bare-string records predate `dataStoreName` and go to the `legacy`
    /// client with the string as the key; everything else dispatches on
    /// the record's location.  The scality client addresses data by bare
    /// key either way, so both forms flow through the same call.
    fn resolve_get_info(
        &self,
        info: &ObjectGetInfo,
    ) -> Result<(Arc<dyn crate::backend::BackendClient>, DataLocation), S3Error> {
        match info {
            ObjectGetInfo::LegacyKey(key) => {
                let client = self.client_for(LEGACY_LOCATION)?;
                let location = DataLocation::new(
                    key.clone(),
                    LEGACY_LOCATION,
                    client.backend_type(),
                    0,
                );
                Ok((client, location))
            }
            ObjectGetInfo::Record(record) => {
                let client = self.client_for(&record.data_store_name)?;
                Ok((client, record.clone()))
            }
        }
    }

    /// Reject malformed tag queries before any backend call.
    fn validate_tagging(tagging: Option<&str>) -> Result<(), S3Error> {
        let Some(query) = tagging else {
            return Ok(());
        };
        if query.is_empty() {
            return Err(S3Error::InvalidArgument {
                message: "empty tag query".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for pair in query.split('&') {
            let Some((key, _value)) = pair.split_once('=') else {
                return Err(S3Error::InvalidArgument {
                    message: format!("malformed tag entry: {pair}"),
                });
            };
            if key.is_empty() {
                return Err(S3Error::InvalidArgument {
                    message: "tag with empty key".to_string(),
                });
            }
            if !seen.insert(key.to_string()) {
                return Err(S3Error::InvalidArgument {
                    message: format!("duplicate tag key: {key}"),
                });
            }
        }
        Ok(())
    }

    // ── Core data ops ───────────────────────────────────────────────

    /// PUT to the controlling location, returning the full retrieval
    /// record.
    pub async fn put(
        &self,
        data: Bytes,
        location: &str,
        ctx: &KeyContext,
        req_id: &str,
    ) -> Result<DataLocation, S3Error> {
        Self::validate_tagging(ctx.tagging.as_deref())?;
        let client = self.client_for(location)?;
        let size = data.len() as u64;
        metrics::counter!(
            crate::metrics::BACKEND_OPERATIONS_TOTAL,
            "operation" => "put", "location" => location.to_string()
        )
        .increment(1);

        let result = client
            .put(data, ctx, req_id)
            .await
            .map_err(|e| S3Error::internal("backend PUT", e))?;

        let mut record = DataLocation::new(result.key, location, client.backend_type(), size);
        record.data_store_etag = result.etag;
        record.data_store_version_id = result.data_store_version_id;
        Ok(record)
    }

    pub async fn get(
        &self,
        info: &ObjectGetInfo,
        range: Option<ByteRange>,
        req_id: &str,
    ) -> Result<Bytes, S3Error> {
        let (client, location) = self.resolve_get_info(info)?;
        metrics::counter!(
            crate::metrics::BACKEND_OPERATIONS_TOTAL,
            "operation" => "get", "location" => location.data_store_name.clone()
        )
        .increment(1);
        client
            .get(&location, range, req_id)
            .await
            .map_err(|e| S3Error::internal("backend GET", e))
    }

    pub async fn delete(&self, info: &ObjectGetInfo, req_id: &str) -> Result<(), S3Error> {
        let (client, location) = self.resolve_get_info(info)?;
        metrics::counter!(
            crate::metrics::BACKEND_OPERATIONS_TOTAL,
            "operation" => "delete", "location" => location.data_store_name.clone()
        )
        .increment(1);
        client
            .delete(&location, req_id)
            .await
            .map_err(|e| S3Error::internal("backend DELETE", e))
    }

    // ── Multipart ───────────────────────────────────────────────────

    pub async fn create_mpu(
        &self,
        location: &str,
        ctx: &KeyContext,
        req_id: &str,
    ) -> Result<Option<String>, S3Error> {
        Self::validate_tagging(ctx.tagging.as_deref())?;
        let client = self.client_for(location)?;
        client
            .create_mpu(ctx, req_id)
            .await
            .map_err(|e| S3Error::internal("backend initiate MPU", e))
    }

    /// Upload one part; returns the part's location record and ETag.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part(
        &self,
        data: Bytes,
        location: &str,
        ctx: &KeyContext,
        upload_id: &str,
        backend_upload_id: Option<&str>,
        part_number: u32,
        req_id: &str,
    ) -> Result<(DataLocation, String), S3Error> {
        let client = self.client_for(location)?;
        let size = data.len() as u64;
        let result = client
            .upload_part(data, ctx, upload_id, backend_upload_id, part_number, req_id)
            .await
            .map_err(|e| S3Error::internal("backend upload part", e))?;

        let etag = result.etag.unwrap_or_default();
        let mut record = DataLocation::new(result.key, location, client.backend_type(), size);
        record.data_store_etag = Some(etag.clone());
        Ok((record, etag))
    }

    /// Complete the upload; returns the final object's location record
    /// and composite ETag.
    pub async fn complete_mpu(
        &self,
        location: &str,
        ctx: &KeyContext,
        upload_id: &str,
        backend_upload_id: Option<&str>,
        parts: &[MpuPartRef],
        req_id: &str,
    ) -> Result<(DataLocation, String), S3Error> {
        let client = self.client_for(location)?;
        let result = client
            .complete_mpu(ctx, upload_id, backend_upload_id, parts, req_id)
            .await
            .map_err(|e| S3Error::internal("backend complete MPU", e))?;

        let mut record = DataLocation::new(
            result.key,
            location,
            client.backend_type(),
            result.content_length,
        );
        record.data_store_etag = Some(result.etag.clone());
        record.data_store_version_id = result.data_store_version_id;
        Ok((record, result.etag))
    }

    /// Abort the upload.  The azure variant's abort is a data-layer
    /// no-op; its `skip_data_delete` tells callers not to attempt a
    /// follow-up data delete.
    pub async fn abort_mpu(
        &self,
        location: &str,
        ctx: &KeyContext,
        upload_id: &str,
        backend_upload_id: Option<&str>,
        req_id: &str,
    ) -> Result<AbortMpuResult, S3Error> {
        let client = self.client_for(location)?;
        client
            .abort_mpu(ctx, upload_id, backend_upload_id, req_id)
            .await
            .map_err(|e| S3Error::internal("backend abort MPU", e))
    }

    /// Whether the location's client can list parts natively.
    pub fn supports_native_list_parts(&self, location: &str) -> bool {
        self.registry
            .client(location)
            .map(|c| c.capabilities().native_list_parts)
            .unwrap_or(false)
    }

    pub async fn list_parts(
        &self,
        location: &str,
        ctx: &KeyContext,
        backend_upload_id: &str,
        req_id: &str,
    ) -> Result<Vec<NativePart>, S3Error> {
        let client = self.client_for(location)?;
        if !client.capabilities().native_list_parts {
            return Err(S3Error::NotImplemented {
                message: format!(
                    "part listing is not implemented for the {} backend",
                    client.backend_type()
                ),
            });
        }
        client
            .list_parts(ctx, backend_upload_id, req_id)
            .await
            .map_err(|e| S3Error::internal("backend list parts", e))
    }

    // ── Copy ────────────────────────────────────────────────────────

    /// Whether `source` can be copied natively into `dest_location`.
    pub fn supports_native_copy(&self, source: &DataLocation, dest_location: &str) -> bool {
        source.data_store_name == dest_location
            && self
                .registry
                .client(dest_location)
                .map(|c| c.capabilities().copy_object)
                .unwrap_or(false)
    }

    pub async fn copy_object(
        &self,
        source: &DataLocation,
        dest_location: &str,
        dest_ctx: &KeyContext,
        req_id: &str,
    ) -> Result<DataLocation, S3Error> {
        let client = self.client_for(dest_location)?;
        if !self.supports_native_copy(source, dest_location) {
            return Err(S3Error::NotImplemented {
                message: format!(
                    "object copy from {} to {} backend is not implemented",
                    source.data_store_type,
                    client.backend_type()
                ),
            });
        }
        let result = client
            .copy_object(source, dest_ctx, req_id)
            .await
            .map_err(|e| S3Error::internal("backend copy", e))?;

        let mut record =
            DataLocation::new(result.key, dest_location, client.backend_type(), source.size);
        record.data_store_etag = result.etag;
        record.data_store_version_id = result.data_store_version_id;
        Ok(record)
    }

    /// Whether `source` can be part-copied natively into `dest_location`.
    pub fn supports_native_part_copy(&self, source: &DataLocation, dest_location: &str) -> bool {
        source.data_store_name == dest_location
            && self
                .registry
                .client(dest_location)
                .map(|c| c.capabilities().upload_part_copy)
                .unwrap_or(false)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upload_part_copy(
        &self,
        source: &DataLocation,
        dest_location: &str,
        dest_ctx: &KeyContext,
        backend_upload_id: &str,
        part_number: u32,
        req_id: &str,
    ) -> Result<(DataLocation, String), S3Error> {
        let client = self.client_for(dest_location)?;
        if !self.supports_native_part_copy(source, dest_location) {
            return Err(S3Error::NotImplemented {
                message: format!(
                    "part copy from {} to {} backend is not implemented",
                    source.data_store_type,
                    client.backend_type()
                ),
            });
        }
        let result = client
            .upload_part_copy(source, dest_ctx, backend_upload_id, part_number, req_id)
            .await
            .map_err(|e| S3Error::internal("backend part copy", e))?;

        let etag = result.etag.unwrap_or_default();
        let mut record =
            DataLocation::new(result.key, dest_location, client.backend_type(), source.size);
        record.data_store_etag = Some(etag.clone());
        Ok((record, etag))
    }

    // ── Tagging ─────────────────────────────────────────────────────

    pub async fn object_put_tagging(
        &self,
        location_record: &DataLocation,
        tags: &[(String, String)],
        metadata_headers: &HashMap<String, String>,
        req_id: &str,
    ) -> Result<(), S3Error> {
        let client = self.client_for(&location_record.data_store_name)?;
        if !client.capabilities().object_tagging {
            return Err(S3Error::NotImplemented {
                message: format!(
                    "object tagging is not implemented for the {} backend",
                    client.backend_type()
                ),
            });
        }
        client
            .object_put_tagging(location_record, tags, metadata_headers, req_id)
            .await
            .map_err(|e| S3Error::internal("backend put tagging", e))
    }

    pub async fn object_delete_tagging(
        &self,
        location_record: &DataLocation,
        metadata_headers: &HashMap<String, String>,
        req_id: &str,
    ) -> Result<(), S3Error> {
        let client = self.client_for(&location_record.data_store_name)?;
        if !client.capabilities().object_tagging {
            return Err(S3Error::NotImplemented {
                message: format!(
                    "object tagging is not implemented for the {} backend",
                    client.backend_type()
                ),
            });
        }
        client
            .object_delete_tagging(location_record, metadata_headers, req_id)
            .await
            .map_err(|e| S3Error::internal("backend delete tagging", e))
    }

    /// Whether tagging needs a backend-side write for this record.
    pub fn supports_backend_tagging(&self, location: &str) -> bool {
        self.registry
            .client(location)
            .map(|c| c.capabilities().object_tagging)
            .unwrap_or(false)
    }

    // ── Aggregated healthcheck ──────────────────────────────────────

    /// Probe the registered locations.
    ///
    /// scality locations are probed individually.  For `aws_s3` and
    /// `azure`, one random location per type is probed and recorded
    /// under the probed name only: probing every cloud location on every
    /// healthcheck is slow and rate-limit-prone, and random sampling
    /// still gives a liveness signal.  Everything else reports a
    /// synthesized `200 OK`.
    pub async fn healthcheck(&self) -> HashMap<String, LocationHealth> {
        let mut results = HashMap::new();
        let mut aws_locations = Vec::new();
        let mut azure_locations = Vec::new();

        for (name, client) in self.registry.iter() {
            if name == LEGACY_LOCATION {
                continue;
            }
            match client.backend_type() {
                BackendType::Scality => {
                    results.insert(name.clone(), client.check_health(name).await);
                }
                BackendType::AwsS3 => aws_locations.push(name.clone()),
                BackendType::Azure => azure_locations.push(name.clone()),
                _ => {
                    results.insert(name.clone(), LocationHealth::ok());
                }
            }
        }

        for pool in [aws_locations, azure_locations] {
            let Some(name) = pool.choose(&mut rand::thread_rng()) else {
                continue;
            };
            if let Some(client) = self.registry.client(name) {
                let health = client.check_health(name).await;
                if health.error.is_some() {
                    warn!(location = %name, "healthcheck probe failed");
                }
                results.insert(name.clone(), health);
            }
        }

        results
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::BackendClient;

    fn gateway_with_mem(locations: &[&str], default: &str) -> MultiBackendGateway {
        let mut clients: HashMap<String, Arc<dyn BackendClient>> = HashMap::new();
        for name in locations {
            clients.insert(name.to_string(), Arc::new(MemoryBackend::new()));
        }
        clients.insert(
            LEGACY_LOCATION.to_string(),
            clients.get(default).cloned().unwrap(),
        );
        MultiBackendGateway::new(Arc::new(LocationRegistry::from_clients(
            clients,
            HashMap::new(),
            default.to_string(),
        )))
    }

    #[tokio::test]
    async fn test_put_builds_full_retrieval_record() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let ctx = KeyContext::new("bucket", "key");
        let record = gateway
            .put(Bytes::from("hello"), "mem-a", &ctx, "rid")
            .await
            .unwrap();

        assert_eq!(record.data_store_name, "mem-a");
        assert_eq!(record.data_store_type, "mem");
        assert_eq!(record.size, 5);
        assert!(record.data_store_etag.as_deref().unwrap().starts_with('"'));

        let got = gateway
            .get(&ObjectGetInfo::Record(record), None, "rid")
            .await
            .unwrap();
        assert_eq!(got, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_put_to_missing_location_is_internal_error() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let ctx = KeyContext::new("bucket", "key");
        let err = gateway
            .put(Bytes::from("x"), "nope", &ctx, "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InternalError");
    }

    #[tokio::test]
    async fn test_malformed_tagging_rejected_before_dispatch() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let mut ctx = KeyContext::new("bucket", "key");

        ctx.tagging = Some("no-equals-sign".to_string());
        let err = gateway
            .put(Bytes::from("x"), "mem-a", &ctx, "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");

        ctx.tagging = Some("a=1&a=2".to_string());
        let err = gateway
            .put(Bytes::from("x"), "mem-a", &ctx, "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");

        ctx.tagging = Some("a=1&b=2".to_string());
        assert!(gateway.put(Bytes::from("x"), "mem-a", &ctx, "rid").await.is_ok());
    }

    #[tokio::test]
    async fn test_legacy_bare_key_routes_to_legacy_client() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let ctx = KeyContext::new("bucket", "key");
        let record = gateway
            .put(Bytes::from("old data"), "mem-a", &ctx, "rid")
            .await
            .unwrap();

        // A record that predates dataStoreName arrives as a bare key;
        // legacy aliases the default location's client, so the bytes
        // resolve.
        let got = gateway
            .get(&ObjectGetInfo::LegacyKey(record.key.clone()), None, "rid")
            .await
            .unwrap();
        assert_eq!(got, Bytes::from("old data"));

        gateway
            .delete(&ObjectGetInfo::LegacyKey(record.key), "rid")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_copy_between_mem_locations_is_not_implemented() {
        let gateway = gateway_with_mem(&["mem-a", "mem-b"], "mem-a");
        let ctx = KeyContext::new("bucket", "key");
        let record = gateway
            .put(Bytes::from("src"), "mem-a", &ctx, "rid")
            .await
            .unwrap();

        let err = gateway
            .copy_object(&record, "mem-b", &ctx, "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
        // The description names both backend types.
        assert!(err.to_string().contains("mem"));
    }

    #[tokio::test]
    async fn test_tagging_capability_check() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let record = DataLocation::new("k".into(), "mem-a", BackendType::Mem, 0);
        let err = gateway
            .object_put_tagging(&record, &[], &HashMap::new(), "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
        assert!(!gateway.supports_backend_tagging("mem-a"));
    }

    #[tokio::test]
    async fn test_list_parts_capability_check() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let ctx = KeyContext::new("bucket", "key");
        let err = gateway
            .list_parts("mem-a", &ctx, "backend-upload", "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
        assert!(!gateway.supports_native_list_parts("mem-a"));
    }

    #[tokio::test]
    async fn test_healthcheck_synthesizes_ok_for_internal_backends() {
        let gateway = gateway_with_mem(&["mem-a", "mem-b"], "mem-a");
        let results = gateway.healthcheck().await;

        assert_eq!(results.len(), 2);
        assert!(results.values().all(|h| h.code == 200));
        // The legacy alias is not reported separately.
        assert!(!results.contains_key(LEGACY_LOCATION));
    }

    #[tokio::test]
    async fn test_abort_mpu_reports_skip_flag_from_client() {
        let gateway = gateway_with_mem(&["mem-a"], "mem-a");
        let ctx = KeyContext::new("bucket", "key");
        let result = gateway
            .abort_mpu("mem-a", &ctx, "upload-1", None, "rid")
            .await
            .unwrap();
        assert!(!result.skip_data_delete);
    }
}
