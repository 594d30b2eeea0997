//! Top-level data wrapper: the entry point request handlers use for all
//! object data I/O.
//!
//! Responsibilities on top of the gateway:
//!   - MD5 accounting on PUT, with the `Content-MD5` comparison firing
//!     after the write is durable and a compensating background delete
//!     of the offending write on mismatch;
//!   - the encryption pipe (cipher on PUT, offset-aligned decipher on
//!     GET) when the bucket carries SSE;
//!   - the retrying single delete (three total attempts);
//!   - the bounded-concurrency batch delete with the overwrite-skip
//!     policy for external backends;
//!   - the runtime `switch` seam that swaps the active gateway.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

use crate::backend::{ByteRange, DataLocation, KeyContext, ObjectGetInfo};
use crate::errors::S3Error;
use crate::gateway::MultiBackendGateway;
use crate::kms::KeyManager;
use crate::metadata::store::SseConfig;

/// Delete attempts: one initial try plus two retries.
const DELETE_ATTEMPTS: u32 = 3;

/// Batch deletes keep at most this many backend calls in flight.
const BATCH_DELETE_CONCURRENCY: usize = 5;

/// Top-level data dispatcher.
pub struct DataWrapper {
    /// Swapped at runtime only through [`DataWrapper::switch`].
    gateway: RwLock<Arc<MultiBackendGateway>>,
    kms: Arc<dyn KeyManager>,
}

impl DataWrapper {
    pub fn new(gateway: Arc<MultiBackendGateway>, kms: Arc<dyn KeyManager>) -> Self {
        Self {
            gateway: RwLock::new(gateway),
            kms,
        }
    }

    /// The active gateway.
    pub fn gateway(&self) -> Arc<MultiBackendGateway> {
        self.gateway.read().expect("gateway lock poisoned").clone()
    }

    /// Replace the active gateway (test seam).
    pub fn switch(&self, gateway: Arc<MultiBackendGateway>) {
        *self.gateway.write().expect("gateway lock poisoned") = gateway;
    }

    pub fn kms(&self) -> Arc<dyn KeyManager> {
        self.kms.clone()
    }

    // ── PUT ─────────────────────────────────────────────────────────

    /// Store one object's bytes, returning the retrieval record and the
    /// hex MD5 of the plaintext.
    ///
    /// When `content_md5` (base64, from the `Content-MD5` header) is
    /// supplied and disagrees with the computed hash, the just-written
    /// record is deleted in the background and the caller sees
    /// `BadDigest`.  Only that write is compensated.
    pub async fn put(
        &self,
        data: Bytes,
        location: &str,
        ctx: &KeyContext,
        content_md5: Option<&str>,
        sse: Option<&SseConfig>,
        req_id: &str,
    ) -> Result<(DataLocation, String), S3Error> {
        // Decode the declared digest up front so a malformed header never
        // costs a backend write.
        let declared = match content_md5 {
            Some(header) => {
                let decoded = BASE64_STANDARD
                    .decode(header)
                    .map_err(|_| S3Error::InvalidDigest)?;
                if decoded.len() != 16 {
                    return Err(S3Error::InvalidDigest);
                }
                Some(decoded)
            }
            None => None,
        };

        let mut hasher = Md5::new();
        hasher.update(&data);
        let computed = hasher.finalize().to_vec();
        let computed_hex = hex::encode(&computed);

        // Encryption pipe: the backend stores ciphertext; the record
        // carries what GET needs to undo it.
        let (payload, cipher_fields) = match sse {
            Some(sse) => {
                let mut bundle = self
                    .kms
                    .create_cipher_bundle(&sse.master_key_id)
                    .await
                    .map_err(|e| S3Error::internal("KMS cipher bundle", e))?;
                let ciphertext = bundle.cipher.apply(data);
                (
                    ciphertext,
                    Some((
                        bundle.ciphered_data_key,
                        bundle.crypto_scheme,
                        bundle.master_key_id,
                    )),
                )
            }
            None => (data, None),
        };

        let gateway = self.gateway();
        let mut record = gateway.put(payload, location, ctx, req_id).await?;
        if let Some((ciphered_data_key, crypto_scheme, master_key_id)) = cipher_fields {
            record.ciphered_data_key = Some(ciphered_data_key);
            record.crypto_scheme = Some(crypto_scheme);
            record.master_key_id = Some(master_key_id);
        }

        if let Some(declared) = declared {
            if declared != computed {
                warn!(req_id, "Content-MD5 mismatch, removing the write");
                let offending = ObjectGetInfo::Record(record.clone());
                tokio::spawn(async move {
                    if let Err(e) =
                        delete_with_retry_via(&gateway, &offending, "md5-compensation").await
                    {
                        error!("compensating delete failed: {e}");
                    }
                });
                return Err(S3Error::BadDigest);
            }
        }

        Ok((record, computed_hex))
    }

    // ── GET ─────────────────────────────────────────────────────────

    /// Read an object's bytes from its location records, optionally a
    /// byte range, deciphering when the records carry cipher state.
    pub async fn get(
        &self,
        locations: &[DataLocation],
        range: Option<ByteRange>,
        req_id: &str,
    ) -> Result<Bytes, S3Error> {
        let gateway = self.gateway();
        let mut out = Vec::new();
        // Offset of the current location's first byte within the object.
        let mut position: u64 = 0;

        for location in locations {
            let len = location.size;
            let sub_range = match range {
                None => Some(None),
                Some((first, last)) => {
                    let loc_first = position;
                    let loc_last = position + len.saturating_sub(1);
                    if last < loc_first || first > loc_last {
                        None
                    } else {
                        let sub_first = first.saturating_sub(loc_first);
                        let sub_last = last.min(loc_last) - loc_first;
                        Some(Some((sub_first, sub_last)))
                    }
                }
            };
            position += len;

            let Some(sub_range) = sub_range else {
                continue;
            };

            let chunk = gateway
                .get(&ObjectGetInfo::Record(location.clone()), sub_range, req_id)
                .await?;

            let chunk = match &location.ciphered_data_key {
                Some(ciphered_key) => {
                    let master_key_id = location.master_key_id.as_deref().ok_or_else(|| {
                        S3Error::internal("decipher", "record has no master key id")
                    })?;
                    let offset = sub_range.map(|(first, _)| first).unwrap_or(0);
                    let mut decipher = self
                        .kms
                        .create_decipher_bundle(master_key_id, ciphered_key, offset)
                        .await
                        .map_err(|e| S3Error::internal("KMS decipher bundle", e))?;
                    decipher.apply(chunk)
                }
                None => chunk,
            };
            out.extend_from_slice(&chunk);
        }

        Ok(Bytes::from(out))
    }

    // ── DELETE ──────────────────────────────────────────────────────

    /// Delete one record with up to three total attempts.
    pub async fn delete_with_retry(
        &self,
        info: &ObjectGetInfo,
        req_id: &str,
    ) -> Result<(), S3Error> {
        delete_with_retry_via(&self.gateway(), info, req_id).await
    }

    /// Whether the overwrite-skip policy protects `existing` from the
    /// delete that follows `new_location`'s write.
    ///
    /// External backends overwrite native keys in place, so when a PUT
    /// lands on the same external backend type and the same location as
    /// the record being replaced, deleting the old record would destroy
    /// the object that was just written.
    fn skip_on_overwrite(
        request_method: &str,
        existing: &DataLocation,
        new_location: Option<&DataLocation>,
    ) -> bool {
        if request_method != "PUT" {
            return false;
        }
        let Some(new_location) = new_location else {
            return false;
        };
        let Some(backend_type) = crate::backend::BackendType::parse(&existing.data_store_type)
        else {
            return false;
        };
        backend_type.is_external()
            && existing.data_store_type == new_location.data_store_type
            && existing.data_store_name == new_location.data_store_name
    }

    /// Delete a batch of records with bounded concurrency, applying the
    /// overwrite-skip policy per entry.  Failures are logged after the
    /// retries are exhausted; the enclosing request does not fail.
    pub async fn batch_delete(
        &self,
        locations: Vec<DataLocation>,
        request_method: &str,
        new_location: Option<&DataLocation>,
        req_id: &str,
    ) {
        let to_delete: Vec<DataLocation> = locations
            .into_iter()
            .filter(|existing| {
                if Self::skip_on_overwrite(request_method, existing, new_location) {
                    debug!(
                        req_id,
                        key = %existing.key,
                        location = %existing.data_store_name,
                        "skipping delete of overwritten external record"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();

        stream::iter(to_delete)
            .map(|location| async move {
                let result = self
                    .delete_with_retry(&ObjectGetInfo::Record(location.clone()), req_id)
                    .await;
                if let Err(e) = result {
                    error!(
                        req_id,
                        key = %location.key,
                        location = %location.data_store_name,
                        "batch delete entry failed: {e}"
                    );
                }
            })
            .buffer_unordered(BATCH_DELETE_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;
    }
}

/// Retrying delete as a small state machine over `{attempt, last_error}`.
async fn delete_with_retry_via(
    gateway: &MultiBackendGateway,
    info: &ObjectGetInfo,
    req_id: &str,
) -> Result<(), S3Error> {
    let mut attempt = 1;
    let mut last_error;

    loop {
        match gateway.delete(info, req_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(req_id, attempt, "data delete attempt failed");
                last_error = e;
            }
        }
        if attempt >= DELETE_ATTEMPTS {
            error!(req_id, attempts = attempt, "data delete exhausted retries");
            return Err(last_error);
        }
        attempt += 1;
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{BackendClient, BackendType};
    use crate::kms::MemoryKeyManager;
    use crate::location::{LocationRegistry, LEGACY_LOCATION};
    use std::collections::HashMap;

    fn wrapper() -> (DataWrapper, Arc<MemoryKeyManager>) {
        let mut clients: HashMap<String, Arc<dyn BackendClient>> = HashMap::new();
        clients.insert("mem-a".to_string(), Arc::new(MemoryBackend::new()));
        clients.insert("aws-east".to_string(), Arc::new(MemoryBackend::new()));
        clients.insert(
            LEGACY_LOCATION.to_string(),
            clients.get("mem-a").cloned().unwrap(),
        );
        let registry = LocationRegistry::from_clients(
            clients,
            HashMap::new(),
            "mem-a".to_string(),
        );
        let kms = Arc::new(MemoryKeyManager::new());
        let wrapper = DataWrapper::new(
            Arc::new(MultiBackendGateway::new(Arc::new(registry))),
            kms.clone(),
        );
        (wrapper, kms)
    }

    fn ctx() -> KeyContext {
        KeyContext::new("bucket", "key")
    }

    #[tokio::test]
    async fn test_put_reports_plaintext_md5() {
        let (wrapper, _) = wrapper();
        let data = Bytes::from("hello world");
        let (record, md5_hex) = wrapper
            .put(data.clone(), "mem-a", &ctx(), None, None, "rid")
            .await
            .unwrap();
        assert_eq!(md5_hex, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(record.size, 11);

        let got = wrapper.get(&[record], None, "rid").await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_content_md5_mismatch_is_bad_digest() {
        let (wrapper, _) = wrapper();
        // Valid base64 of 16 bytes that are not the body's MD5.
        let wrong = BASE64_STANDARD.encode([0u8; 16]);
        let err = wrapper
            .put(
                Bytes::from("body"),
                "mem-a",
                &ctx(),
                Some(&wrong),
                None,
                "rid",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BadDigest");
    }

    #[tokio::test]
    async fn test_content_md5_invalid_encoding_is_invalid_digest() {
        let (wrapper, _) = wrapper();
        let err = wrapper
            .put(
                Bytes::from("body"),
                "mem-a",
                &ctx(),
                Some("not-base64!!!"),
                None,
                "rid",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidDigest");

        // Wrong digest length is also rejected before any write.
        let short = BASE64_STANDARD.encode([0u8; 8]);
        let err = wrapper
            .put(Bytes::from("body"), "mem-a", &ctx(), Some(&short), None, "rid")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidDigest");
    }

    #[tokio::test]
    async fn test_content_md5_match_succeeds() {
        let (wrapper, _) = wrapper();
        let data = Bytes::from("body");
        let mut hasher = Md5::new();
        hasher.update(&data);
        let digest = BASE64_STANDARD.encode(hasher.finalize());

        let result = wrapper
            .put(data, "mem-a", &ctx(), Some(&digest), None, "rid")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sse_roundtrip_stores_ciphertext() {
        let (wrapper, kms) = wrapper();
        let master_key_id = kms.create_bucket_key().await.unwrap();
        let sse = SseConfig {
            algorithm: "AES256".to_string(),
            master_key_id,
        };

        let data = Bytes::from("secret payload");
        let (record, _) = wrapper
            .put(data.clone(), "mem-a", &ctx(), None, Some(&sse), "rid")
            .await
            .unwrap();
        assert!(record.ciphered_data_key.is_some());
        assert_eq!(record.crypto_scheme, Some(1));

        // Raw backend bytes differ from the plaintext.
        let raw = wrapper
            .gateway()
            .get(&ObjectGetInfo::Record(record.clone()), None, "rid")
            .await
            .unwrap();
        assert_ne!(raw, data);

        // The wrapper deciphers on the way out.
        let got = wrapper.get(&[record], None, "rid").await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_sse_ranged_get_deciphers_at_offset() {
        let (wrapper, kms) = wrapper();
        let master_key_id = kms.create_bucket_key().await.unwrap();
        let sse = SseConfig {
            algorithm: "AES256".to_string(),
            master_key_id,
        };

        let data = Bytes::from("0123456789abcdef");
        let (record, _) = wrapper
            .put(data.clone(), "mem-a", &ctx(), None, Some(&sse), "rid")
            .await
            .unwrap();

        let got = wrapper.get(&[record], Some((4, 9)), "rid").await.unwrap();
        assert_eq!(got, data.slice(4..10));
    }

    #[tokio::test]
    async fn test_multi_location_get_concatenates_and_ranges() {
        let (wrapper, _) = wrapper();
        let (a, _) = wrapper
            .put(Bytes::from("hello "), "mem-a", &ctx(), None, None, "rid")
            .await
            .unwrap();
        let (b, _) = wrapper
            .put(Bytes::from("world"), "mem-a", &ctx(), None, None, "rid")
            .await
            .unwrap();
        let locations = vec![a, b];

        let full = wrapper.get(&locations, None, "rid").await.unwrap();
        assert_eq!(full, Bytes::from("hello world"));

        // Range spanning the location boundary.
        let cross = wrapper.get(&locations, Some((4, 7)), "rid").await.unwrap();
        assert_eq!(cross, Bytes::from("o wo"));

        // Range entirely within the second location.
        let tail = wrapper.get(&locations, Some((6, 10)), "rid").await.unwrap();
        assert_eq!(tail, Bytes::from("world"));
    }

    #[tokio::test]
    async fn test_delete_with_retry_deletes() {
        let (wrapper, _) = wrapper();
        let (record, _) = wrapper
            .put(Bytes::from("x"), "mem-a", &ctx(), None, None, "rid")
            .await
            .unwrap();

        wrapper
            .delete_with_retry(&ObjectGetInfo::Record(record.clone()), "rid")
            .await
            .unwrap();
        assert!(wrapper.get(&[record], None, "rid").await.is_err());
    }

    #[test]
    fn test_overwrite_skip_policy_table() {
        let external_old = DataLocation::new("k1".into(), "aws-east", BackendType::AwsS3, 1);
        let external_new = DataLocation::new("k1".into(), "aws-east", BackendType::AwsS3, 1);
        let other_location = DataLocation::new("k1".into(), "aws-west", BackendType::AwsS3, 1);
        let internal_old = DataLocation::new("k2".into(), "mem-a", BackendType::Mem, 1);

        // PUT overwriting the same external location: skip the delete.
        assert!(DataWrapper::skip_on_overwrite(
            "PUT",
            &external_old,
            Some(&external_new)
        ));
        // DELETE requests always proceed.
        assert!(!DataWrapper::skip_on_overwrite(
            "DELETE",
            &external_old,
            Some(&external_new)
        ));
        // Cross-location PUT proceeds.
        assert!(!DataWrapper::skip_on_overwrite(
            "PUT",
            &external_old,
            Some(&other_location)
        ));
        // Internal backends always proceed.
        assert!(!DataWrapper::skip_on_overwrite(
            "PUT",
            &internal_old,
            Some(&internal_old.clone())
        ));
        // No destination record: proceed.
        assert!(!DataWrapper::skip_on_overwrite("PUT", &external_old, None));
    }

    #[tokio::test]
    async fn test_batch_delete_removes_entries_and_honors_skip() {
        let (wrapper, _) = wrapper();
        let (internal, _) = wrapper
            .put(Bytes::from("internal"), "mem-a", &ctx(), None, None, "rid")
            .await
            .unwrap();
        let (external, _) = wrapper
            .put(Bytes::from("external"), "aws-east", &ctx(), None, None, "rid")
            .await
            .unwrap();
        // The test registry backs aws-east with a memory client; stamp the
        // record as an external type to drive the policy.
        let mut external = external;
        external.data_store_type = BackendType::AwsS3.as_str().to_string();

        let new_write = DataLocation::new("k1".into(), "aws-east", BackendType::AwsS3, 1);
        wrapper
            .batch_delete(
                vec![internal.clone(), external.clone()],
                "PUT",
                Some(&new_write),
                "rid",
            )
            .await;

        // The internal record is gone; the external one was skipped.
        assert!(wrapper.get(&[internal], None, "rid").await.is_err());
        let mut readable = external.clone();
        readable.data_store_type = BackendType::Mem.as_str().to_string();
        assert!(wrapper.get(&[readable], None, "rid").await.is_ok());
    }

    #[tokio::test]
    async fn test_1000_record_batch_delete() {
        let (wrapper, _) = wrapper();
        let mut records = Vec::new();
        for i in 0..1000 {
            let (record, _) = wrapper
                .put(
                    Bytes::from(format!("obj-{i}")),
                    "mem-a",
                    &ctx(),
                    None,
                    None,
                    "rid",
                )
                .await
                .unwrap();
            records.push(record);
        }

        wrapper
            .batch_delete(records.clone(), "DELETE", None, "rid")
            .await;

        for record in records {
            assert!(wrapper.get(&[record], None, "rid").await.is_err());
        }
    }

    #[tokio::test]
    async fn test_switch_swaps_active_gateway() {
        let (wrapper, _) = wrapper();
        let (record, _) = wrapper
            .put(Bytes::from("x"), "mem-a", &ctx(), None, None, "rid")
            .await
            .unwrap();

        // A fresh gateway over fresh clients does not know the record.
        let mut clients: HashMap<String, Arc<dyn BackendClient>> = HashMap::new();
        clients.insert("mem-a".to_string(), Arc::new(MemoryBackend::new()));
        clients.insert(
            LEGACY_LOCATION.to_string(),
            clients.get("mem-a").cloned().unwrap(),
        );
        let registry =
            LocationRegistry::from_clients(clients, HashMap::new(), "mem-a".to_string());
        wrapper.switch(Arc::new(MultiBackendGateway::new(Arc::new(registry))));

        assert!(wrapper.get(&[record], None, "rid").await.is_err());
    }
}
