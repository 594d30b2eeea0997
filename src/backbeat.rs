//! Internal replication surface ("backbeat").
//!
//! Mounted at `/_/backbeat/{data|metadata|multiplebackenddata}/{bucket}/{key}`,
//! this surface receives replica writes from the external replication
//! worker: raw object data, object metadata, and multipart-upload
//! fragments, all keyed by an externally supplied source version id.
//!
//! Every request must come from the replication service account.  The
//! `multiplebackenddata` operations additionally pass a location
//! coherence check: the advertised storage class must be a registered
//! location whose type matches `x-scal-storage-type` and whose remote
//! bucket matches the request's bucket, so a misconfigured worker
//! cannot stampede data across backend types.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{build_native_key, DataLocation, KeyContext, MpuPartRef, ObjectGetInfo};
use crate::errors::{generate_request_id, S3Error};
use crate::handlers::extract_user_metadata;
use crate::metadata::store::{
    ObjectMetadata, PutVersionOptions, VersioningState, REPLICA_STATUS,
};
use crate::{AppState, AuthContext};

// Header contract shared by the backbeat operations.
pub const STORAGE_TYPE_HEADER: &str = "x-scal-storage-type";
pub const STORAGE_CLASS_HEADER: &str = "x-scal-storage-class";
pub const VERSION_ID_HEADER: &str = "x-scal-version-id";
pub const CANONICAL_ID_HEADER: &str = "x-scal-canonical-id";
pub const PART_NUMBER_HEADER: &str = "x-scal-part-number";
pub const UPLOAD_ID_HEADER: &str = "x-scal-upload-id";
pub const REPLICATION_CONTENT_HEADER: &str = "x-scal-replication-content";

fn require_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, S3Error> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| S3Error::InvalidRequest {
            message: format!("missing header {name}"),
        })
}

/// Only the replication service account carries the `objectReplicate`
/// capability.
fn check_replication_principal(state: &AppState, auth: &AuthContext) -> Result<(), S3Error> {
    if auth.can_replicate(&state.config) {
        Ok(())
    } else {
        Err(S3Error::AccessDenied {
            message: "replication requires the objectReplicate capability".to_string(),
        })
    }
}

/// Pin the replica's target to the advertised backend.
///
/// Returns `(location name, bucket_match)` on success.
fn check_location_coherence(
    state: &AppState,
    headers: &HeaderMap,
    bucket: &str,
) -> Result<(String, bool), S3Error> {
    let storage_type = require_header(headers, STORAGE_TYPE_HEADER)?;
    let storage_class = require_header(headers, STORAGE_CLASS_HEADER)?;

    let gateway = state.data.gateway();
    let config = gateway.registry().config(storage_class).ok_or_else(|| {
        S3Error::InvalidRequest {
            message: format!("unknown storage class: {storage_class}"),
        }
    })?;

    if config.backend_type.as_str() != storage_type {
        return Err(S3Error::InvalidRequest {
            message: format!(
                "storage class {storage_class} is {}, not {storage_type}",
                config.backend_type
            ),
        });
    }
    if config.details.bucket_name != bucket {
        return Err(S3Error::InvalidRequest {
            message: format!("storage class {storage_class} does not target bucket {bucket}"),
        });
    }
    Ok((storage_class.to_string(), config.details.bucket_match))
}

/// Bucket precondition for the data/metadata routes: replication must
/// not silently mutate a non-versioned bucket.
async fn fetch_versioned_bucket(
    state: &AppState,
    bucket: &str,
) -> Result<crate::metadata::store::BucketInfo, S3Error> {
    let info = crate::handlers::fetch_bucket(state, bucket).await?;
    if info.versioning != VersioningState::Enabled {
        return Err(S3Error::InvalidBucketState {
            message: format!("bucket {bucket} does not have versioning enabled"),
        });
    }
    Ok(info)
}

// ── Internal data route ─────────────────────────────────────────────

/// `PUT /_/backbeat/data/{bucket}/{key}` -- store raw replica data via
/// the data wrapper; responds with the location records the worker
/// stitches into the object's metadata.
pub async fn put_data(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    check_replication_principal(&state, auth)?;
    let bucket_info = fetch_versioned_bucket(&state, bucket).await?;
    let content_md5 = require_header(headers, "content-md5")?.to_string();

    let location = bucket_info.location_constraint.clone();
    let mut ctx = KeyContext::new(bucket, key);
    ctx.content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let (record, _) = state
        .data
        .put(
            body,
            &location,
            &ctx,
            Some(&content_md5),
            bucket_info.sse.as_ref(),
            &req_id,
        )
        .await?;

    debug!(req_id, bucket, key, "replica data stored");
    metrics::counter!(crate::metrics::REPLICA_WRITES_TOTAL, "route" => "data").increment(1);
    let body = serde_json::json!([{
        "key": record.key,
        "dataStoreName": record.data_store_name,
    }]);
    Ok((StatusCode::OK, Json(body)).into_response())
}

// ── Internal metadata route ─────────────────────────────────────────

/// `PUT /_/backbeat/metadata/{bucket}/{key}` -- write replica object
/// metadata.
///
/// With `x-scal-replication-content: METADATA` the target version must
/// already exist and its physical `locations` are preserved; otherwise
/// the supplied record is written as a new version carrying the source
/// version id and the `REPLICA` status.
pub async fn put_metadata(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    check_replication_principal(&state, auth)?;
    fetch_versioned_bucket(&state, bucket).await?;

    let mut incoming: ObjectMetadata =
        serde_json::from_slice(body).map_err(|_| S3Error::MalformedPOSTRequest)?;
    incoming.bucket = bucket.to_string();
    incoming.key = key.to_string();
    incoming.replication_status = Some(REPLICA_STATUS.to_string());

    let version_id = match incoming.version_id.clone() {
        Some(vid) => vid,
        None => require_header(headers, VERSION_ID_HEADER)?.to_string(),
    };

    let metadata_only = headers
        .get(REPLICATION_CONTENT_HEADER)
        .and_then(|v| v.to_str().ok())
        == Some("METADATA");
    if metadata_only {
        // Metadata-only replication overwrites everything except the
        // physical location record; without a target the worker must
        // retry as a full replication.
        let existing = state
            .metadata
            .get_object(bucket, key, Some(&version_id))
            .await?
            .ok_or(S3Error::ObjNotFound)?;
        incoming.locations = existing.locations;
    }

    state
        .metadata
        .put_object(
            incoming,
            PutVersionOptions {
                versioning: VersioningState::Enabled,
                version_id: Some(version_id.clone()),
            },
        )
        .await?;

    metrics::counter!(crate::metrics::REPLICA_WRITES_TOTAL, "route" => "metadata").increment(1);
    Ok((StatusCode::OK, Json(serde_json::json!({ "versionId": version_id }))).into_response())
}

// ── multiplebackenddata operations ──────────────────────────────────

/// `PUT ...?operation=putobject` -- full-object replica write to an
/// external backend.
pub async fn put_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    check_replication_principal(&state, auth)?;
    let (location, _) = check_location_coherence(&state, headers, bucket)?;

    let version_id = require_header(headers, VERSION_ID_HEADER)?.to_string();
    require_header(headers, CANONICAL_ID_HEADER)?;
    let content_md5 = require_header(headers, "content-md5")?.to_string();

    let mut ctx = KeyContext::new(bucket, key);
    ctx.metadata_headers = extract_user_metadata(headers);
    // The replica carries its provenance into the backend's metadata.
    ctx.metadata_headers.insert(
        "x-amz-meta-scal-replication-status".to_string(),
        REPLICA_STATUS.to_string(),
    );
    ctx.metadata_headers.insert(
        "x-amz-meta-scal-version-id".to_string(),
        version_id.clone(),
    );
    ctx.content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    state
        .data
        .put(body, &location, &ctx, Some(&content_md5), None, &req_id)
        .await?;

    debug!(req_id, bucket, key, location = %location, "replica object stored");
    metrics::counter!(crate::metrics::REPLICA_WRITES_TOTAL, "route" => "putobject").increment(1);
    Ok((StatusCode::OK, Json(serde_json::json!({ "versionId": version_id }))).into_response())
}

/// `PUT ...?operation=putpart` -- one replica MPU part.
pub async fn put_part(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    check_replication_principal(&state, auth)?;
    let (location, _) = check_location_coherence(&state, headers, bucket)?;

    let part_number: u32 = require_header(headers, PART_NUMBER_HEADER)?
        .parse()
        .map_err(|_| S3Error::InvalidRequest {
            message: "invalid x-scal-part-number".to_string(),
        })?;
    let upload_id = require_header(headers, UPLOAD_ID_HEADER)?.to_string();

    let ctx = KeyContext::new(bucket, key);
    let gateway = state.data.gateway();
    let (_, etag) = gateway
        .upload_part(
            body,
            &location,
            &ctx,
            &upload_id,
            Some(&upload_id),
            part_number,
            &req_id,
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "partNumber": part_number, "ETag": etag })),
    )
        .into_response())
}

/// `POST ...?operation=initiatempu` -- start a replica MPU.
pub async fn initiate_mpu(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    check_replication_principal(&state, auth)?;
    let (location, _) = check_location_coherence(&state, headers, bucket)?;

    let version_id = require_header(headers, VERSION_ID_HEADER)?.to_string();

    let mut ctx = KeyContext::new(bucket, key);
    ctx.metadata_headers = extract_user_metadata(headers);
    ctx.metadata_headers.insert(
        "x-amz-meta-scal-version-id".to_string(),
        version_id,
    );

    let gateway = state.data.gateway();
    let backend_upload_id = gateway.create_mpu(&location, &ctx, &req_id).await?;
    let upload_id =
        backend_upload_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    Ok((StatusCode::OK, Json(serde_json::json!({ "uploadId": upload_id }))).into_response())
}

#[derive(Debug, Deserialize)]
struct CompletedPartBody {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Size", default)]
    size: u64,
}

/// `POST ...?operation=completempu` -- commit a replica MPU.
pub async fn complete_mpu(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: &[u8],
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    check_replication_principal(&state, auth)?;
    let (location, _) = check_location_coherence(&state, headers, bucket)?;
    let upload_id = require_header(headers, UPLOAD_ID_HEADER)?.to_string();

    let parts: Vec<CompletedPartBody> =
        serde_json::from_slice(body).map_err(|_| S3Error::MalformedPOSTRequest)?;
    if parts.is_empty() {
        return Err(S3Error::MalformedPOSTRequest);
    }
    let part_refs: Vec<MpuPartRef> = parts
        .iter()
        .map(|p| MpuPartRef {
            part_number: p.part_number,
            etag: p.etag.clone(),
            size: p.size,
            key: None,
        })
        .collect();

    let ctx = KeyContext::new(bucket, key);
    let gateway = state.data.gateway();
    gateway
        .complete_mpu(
            &location,
            &ctx,
            &upload_id,
            Some(&upload_id),
            &part_refs,
            &req_id,
        )
        .await?;

    Ok((StatusCode::OK, Json(serde_json::json!({}))).into_response())
}

/// `DELETE ...?operation=deleteobject` -- remove a replica object.
pub async fn delete_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    check_replication_principal(&state, auth)?;
    let (location, bucket_match) = check_location_coherence(&state, headers, bucket)?;

    let gateway = state.data.gateway();
    let client = gateway
        .registry()
        .client(&location)
        .ok_or_else(|| S3Error::internal("dispatch", format!("no backend for {location}")))?;
    let record = DataLocation::new(
        build_native_key(bucket, key, bucket_match),
        &location,
        client.backend_type(),
        0,
    );

    state
        .data
        .delete_with_retry(&ObjectGetInfo::Record(record), &req_id)
        .await?;

    Ok((StatusCode::OK, Json(serde_json::json!({}))).into_response())
}

/// Dispatch a `multiplebackenddata` request on its `operation` query
/// parameter.
pub async fn dispatch_multiple_backend(
    state: Arc<AppState>,
    method: &axum::http::Method,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let operation = query.get("operation").map(String::as_str).unwrap_or("");
    match (method.as_str(), operation) {
        ("PUT", "putobject") => put_object(state, bucket, key, headers, body, auth).await,
        ("PUT", "putpart") => put_part(state, bucket, key, headers, body, auth).await,
        ("POST", "initiatempu") => initiate_mpu(state, bucket, key, headers, auth).await,
        ("POST", "completempu") => {
            complete_mpu(state, bucket, key, headers, &body, auth).await
        }
        ("DELETE", "deleteobject") => delete_object(state, bucket, key, headers, auth).await,
        _ => Err(S3Error::InvalidRequest {
            message: format!("unknown backbeat operation: {operation}"),
        }),
    }
}
