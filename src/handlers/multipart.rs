//! Multipart-upload S3 handlers.
//!
//! The shadow MPU bucket (via the metadata plane) is the source of truth
//! for in-flight uploads and their parts; backends that run their own
//! MPU machinery (aws_s3) additionally track a backend upload id.  Part
//! listings prefer the backend's native listing when one exists.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendType, KeyContext, MpuPartRef};
use crate::errors::{generate_request_id, S3Error};
use crate::metadata::store::{MpuPart, MpuRecord, ObjectMetadata, PutVersionOptions, VersioningState};
use crate::xml::{self, PartEntry};
use crate::{AppState, AuthContext};

use super::{extract_user_metadata, fetch_bucket, now_iso8601, strip_etag_quotes};

/// S3 part numbers are 1..=10000.
const MAX_PART_NUMBER: u32 = 10_000;

fn header_str<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_part_number(query: &HashMap<String, String>) -> Result<u32, S3Error> {
    let raw = query.get("partNumber").ok_or_else(|| S3Error::InvalidArgument {
        message: "missing partNumber".to_string(),
    })?;
    let part_number: u32 = raw.parse().map_err(|_| S3Error::InvalidArgument {
        message: format!("invalid partNumber: {raw}"),
    })?;
    if part_number == 0 || part_number > MAX_PART_NUMBER {
        return Err(S3Error::InvalidArgument {
            message: format!("partNumber must be between 1 and {MAX_PART_NUMBER}"),
        });
    }
    Ok(part_number)
}

async fn fetch_mpu(
    state: &AppState,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<MpuRecord, S3Error> {
    let upload_id = query.get("uploadId").ok_or_else(|| S3Error::InvalidArgument {
        message: "missing uploadId".to_string(),
    })?;
    state
        .metadata
        .get_mpu(bucket, upload_id)
        .await?
        .ok_or_else(|| S3Error::NoSuchUpload {
            upload_id: upload_id.clone(),
        })
}

/// Whether parts of this backend type exist as standalone data objects
/// whose locations must be recorded (and deleted on abort).  aws_s3
/// parts live inside the remote upload; azure blocks are uncommitted
/// service state.
fn parts_are_standalone(data_store_type: &str) -> bool {
    !matches!(
        BackendType::parse(data_store_type),
        Some(BackendType::AwsS3) | Some(BackendType::Azure)
    )
}

/// `POST /{bucket}/{key}?uploads` -- initiate a multipart upload.
pub async fn create_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &axum::http::HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    let bucket_info = fetch_bucket(&state, bucket).await?;

    let header_override = header_str(headers, crate::location::LOCATION_HEADER);
    let gateway = state.data.gateway();
    let location = crate::location::resolve_location(
        header_override,
        Some(&bucket_info.location_constraint),
        gateway.registry(),
    )?;

    let mut ctx = KeyContext::new(bucket, key);
    ctx.metadata_headers = extract_user_metadata(headers);
    ctx.tagging = header_str(headers, "x-amz-tagging").map(String::from);
    ctx.content_type = header_str(headers, "content-type").map(String::from);

    let backend_upload_id = gateway.create_mpu(&location, &ctx, &req_id).await?;
    let upload_id = uuid::Uuid::new_v4().simple().to_string();

    state
        .metadata
        .create_mpu(MpuRecord {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            owner_canonical_id: auth.canonical_id.clone(),
            location,
            backend_upload_id,
            user_metadata: ctx.metadata_headers.clone(),
            tagging: ctx.tagging.clone(),
            content_type: ctx.content_type.clone(),
            initiated_at: now_iso8601(),
        })
        .await?;

    let body = xml::render_initiate_mpu_result(bucket, key, &upload_id);
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=U` -- upload one part.
pub async fn upload_part(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let part_number = parse_part_number(query)?;
    let mpu = fetch_mpu(&state, bucket, query).await?;

    let ctx = KeyContext::new(bucket, key);
    let gateway = state.data.gateway();
    let size = body.len() as u64;
    let (record, etag) = gateway
        .upload_part(
            body,
            &mpu.location,
            &ctx,
            &mpu.upload_id,
            mpu.backend_upload_id.as_deref(),
            part_number,
            &req_id,
        )
        .await?;

    // Re-uploading a part orphans the previous staged object.
    let previous = state
        .metadata
        .list_mpu_parts(bucket, &mpu.upload_id)
        .await?
        .into_iter()
        .find(|p| p.part_number == part_number);
    if let Some(previous) = previous {
        if !previous.locations.is_empty() {
            state
                .data
                .batch_delete(previous.locations, "PUT", Some(&record), &req_id)
                .await;
        }
    }

    let locations = if parts_are_standalone(&record.data_store_type) {
        vec![record]
    } else {
        Vec::new()
    };
    state
        .metadata
        .put_mpu_part(
            bucket,
            &mpu.upload_id,
            MpuPart {
                part_number,
                etag: etag.clone(),
                size,
                last_modified: now_iso8601(),
                locations,
            },
        )
        .await?;

    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert("etag", HeaderValue::from_str(&etag).expect("valid etag"));
    Ok(response)
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=U` with
/// `x-amz-copy-source` -- copy a part from an existing object.
pub async fn upload_part_copy(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &axum::http::HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let part_number = parse_part_number(query)?;
    let mpu = fetch_mpu(&state, bucket, query).await?;

    let source = super::object::fetch_part_copy_source(&state, headers, auth).await?;

    let ctx = KeyContext::new(bucket, key);
    let gateway = state.data.gateway();
    let single_source = (source.locations.len() == 1).then(|| source.locations[0].clone());

    let native_copy = match (&single_source, mpu.backend_upload_id.as_deref()) {
        (Some(src_record), Some(backend_upload_id))
            if src_record.ciphered_data_key.is_none()
                && gateway.supports_native_part_copy(src_record, &mpu.location) =>
        {
            Some((src_record.clone(), backend_upload_id.to_string()))
        }
        _ => None,
    };

    let (record, etag, size) = match native_copy {
        Some((src_record, backend_upload_id)) => {
            let (record, etag) = gateway
                .upload_part_copy(
                    &src_record,
                    &mpu.location,
                    &ctx,
                    &backend_upload_id,
                    part_number,
                    &req_id,
                )
                .await?;
            (record, etag, source.size)
        }
        _ => {
            let data = state.data.get(&source.locations, None, &req_id).await?;
            let size = data.len() as u64;
            let (record, etag) = gateway
                .upload_part(
                    data,
                    &mpu.location,
                    &ctx,
                    &mpu.upload_id,
                    mpu.backend_upload_id.as_deref(),
                    part_number,
                    &req_id,
                )
                .await?;
            (record, etag, size)
        }
    };

    let locations = if parts_are_standalone(&record.data_store_type) {
        vec![record]
    } else {
        Vec::new()
    };
    let last_modified = now_iso8601();
    state
        .metadata
        .put_mpu_part(
            bucket,
            &mpu.upload_id,
            MpuPart {
                part_number,
                etag: etag.clone(),
                size,
                last_modified: last_modified.clone(),
                locations,
            },
        )
        .await?;

    let body = xml::render_copy_result("CopyPartResult", &etag, &last_modified);
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}

/// `GET /{bucket}/{key}?uploadId=U` -- list uploaded parts.
pub async fn list_parts(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let mpu = fetch_mpu(&state, bucket, query).await?;

    let gateway = state.data.gateway();
    let body = match (&mpu.backend_upload_id, gateway.supports_native_list_parts(&mpu.location)) {
        (Some(backend_upload_id), true) => {
            let ctx = KeyContext::new(bucket, key);
            let parts = gateway
                .list_parts(&mpu.location, &ctx, backend_upload_id, &req_id)
                .await?;
            let entries: Vec<PartEntry<'_>> = parts
                .iter()
                .map(|p| PartEntry {
                    part_number: p.part_number,
                    etag: &p.etag,
                    size: p.size,
                    last_modified: &p.last_modified,
                })
                .collect();
            xml::render_list_parts_result(bucket, key, &mpu.upload_id, &entries, false)
        }
        _ => {
            let parts = state.metadata.list_mpu_parts(bucket, &mpu.upload_id).await?;
            let entries: Vec<PartEntry<'_>> = parts
                .iter()
                .map(|p| PartEntry {
                    part_number: p.part_number,
                    etag: &p.etag,
                    size: p.size,
                    last_modified: &p.last_modified,
                })
                .collect();
            xml::render_list_parts_result(bucket, key, &mpu.upload_id, &entries, false)
        }
    };

    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}

/// `POST /{bucket}/{key}?uploadId=U` -- complete the upload.
pub async fn complete_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: &[u8],
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    let bucket_info = fetch_bucket(&state, bucket).await?;
    let mpu = fetch_mpu(&state, bucket, query).await?;

    let requested = xml::parse_complete_mpu_xml(body)?;
    if requested.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(S3Error::InvalidPartOrder);
    }

    let recorded = state.metadata.list_mpu_parts(bucket, &mpu.upload_id).await?;
    let by_number: HashMap<u32, &MpuPart> =
        recorded.iter().map(|p| (p.part_number, p)).collect();

    let mut part_refs = Vec::with_capacity(requested.len());
    for (part_number, etag) in &requested {
        let Some(part) = by_number.get(part_number) else {
            return Err(S3Error::InvalidPart {
                message: format!("part {part_number} was never uploaded"),
            });
        };
        if strip_etag_quotes(etag) != strip_etag_quotes(&part.etag) {
            return Err(S3Error::InvalidPart {
                message: format!("part {part_number} ETag does not match"),
            });
        }
        part_refs.push(MpuPartRef {
            part_number: *part_number,
            etag: part.etag.clone(),
            size: part.size,
            key: part.locations.first().map(|l| l.key.clone()),
        });
    }

    let mut ctx = KeyContext::new(bucket, key);
    ctx.metadata_headers = mpu.user_metadata.clone();
    ctx.tagging = mpu.tagging.clone();
    ctx.content_type = mpu.content_type.clone();

    let gateway = state.data.gateway();
    let (record, composite_etag) = gateway
        .complete_mpu(
            &mpu.location,
            &ctx,
            &mpu.upload_id,
            mpu.backend_upload_id.as_deref(),
            &part_refs,
            &req_id,
        )
        .await?;

    let old_locations = if bucket_info.versioning == VersioningState::None {
        state
            .metadata
            .get_object(bucket, key, None)
            .await?
            .filter(|old| !old.is_delete_marker)
            .map(|old| old.locations)
    } else {
        None
    };

    let meta = ObjectMetadata {
        bucket: bucket.to_string(),
        key: key.to_string(),
        version_id: None,
        is_delete_marker: false,
        size: record.size,
        etag: composite_etag.clone(),
        content_type: mpu
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        content_encoding: None,
        cache_control: None,
        content_disposition: None,
        expires: None,
        website_redirect_location: None,
        user_metadata: mpu.user_metadata.clone(),
        tags: mpu
            .tagging
            .as_deref()
            .map(xml::decode_tag_query)
            .unwrap_or_default(),
        owner_canonical_id: auth.canonical_id.clone(),
        acl: "private".to_string(),
        last_modified: now_iso8601(),
        locations: vec![record.clone()],
        replication_status: None,
    };
    let version_id = state
        .metadata
        .put_object(
            meta,
            PutVersionOptions {
                versioning: bucket_info.versioning,
                version_id: None,
            },
        )
        .await?;

    if let Some(old) = old_locations {
        state
            .data
            .batch_delete(old, "PUT", Some(&record), &req_id)
            .await;
    }
    state.metadata.delete_mpu(bucket, &mpu.upload_id).await?;

    let location_url = format!("/{bucket}/{key}");
    let body = xml::render_complete_mpu_result(&location_url, bucket, key, &composite_etag);
    let mut response = (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response();
    if let Some(vid) = version_id {
        response.headers_mut().insert(
            "x-amz-version-id",
            HeaderValue::from_str(&vid).expect("valid version id"),
        );
    }
    Ok(response)
}

/// `DELETE /{bucket}/{key}?uploadId=U` -- abort the upload.
///
/// Azure's abort is a no-op at the data layer; its `skip_data_delete`
/// flag suppresses the follow-up delete of staged part data.
pub async fn abort_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let mpu = fetch_mpu(&state, bucket, query).await?;

    let ctx = KeyContext::new(bucket, key);
    let gateway = state.data.gateway();
    let result = gateway
        .abort_mpu(
            &mpu.location,
            &ctx,
            &mpu.upload_id,
            mpu.backend_upload_id.as_deref(),
            &req_id,
        )
        .await?;

    if !result.skip_data_delete {
        let staged: Vec<_> = state
            .metadata
            .list_mpu_parts(bucket, &mpu.upload_id)
            .await?
            .into_iter()
            .flat_map(|p| p.locations)
            .collect();
        if !staged.is_empty() {
            state.data.batch_delete(staged, "DELETE", None, &req_id).await;
        }
    }

    state.metadata.delete_mpu(bucket, &mpu.upload_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Tests ───────────────────────────────────────────────────────────
