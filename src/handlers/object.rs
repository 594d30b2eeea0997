//! Object-level S3 handlers: PUT, GET, HEAD, DELETE, COPY, tagging, and
//! multi-object delete.
//!
//! All data I/O flows through the [`crate::data::DataWrapper`]; the
//! controlling location constraint is resolved per request from the
//! header override, the bucket default, and the registry.

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{DataLocation, KeyContext};
use crate::errors::{generate_request_id, S3Error};
use crate::location::{resolve_location, LOCATION_HEADER};
use crate::metadata::store::{ObjectMetadata, PutVersionOptions, VersioningState};
use crate::xml::{self, DeleteErrorEntry, DeletedEntry};
use crate::{AppState, AuthContext};

use super::{
    extract_user_metadata, fetch_bucket, now_iso8601, parse_iso8601, parse_range,
    strip_aws_chunked, strip_etag_quotes,
};

/// Upper bound on entries in one multi-object delete request.
const MULTI_DELETE_MAX_KEYS: usize = 1000;

// ── Conditional evaluation ──────────────────────────────────────────

/// Evaluate read conditions (GET/HEAD): `If-Match` /
/// `If-Unmodified-Since` fail with 412, `If-None-Match` /
/// `If-Modified-Since` signal 304.
///
/// Precedence: a passing `If-Match` skips `If-Unmodified-Since`; a
/// present `If-None-Match` skips `If-Modified-Since`.
pub fn evaluate_read_conditions(
    headers: &HeaderMap,
    etag: &str,
    last_modified: &str,
) -> Result<(), S3Error> {
    evaluate_conditions(
        headers,
        etag,
        last_modified,
        ("if-match", "if-none-match", "if-modified-since", "if-unmodified-since"),
        true,
    )
}

/// Evaluate copy-source conditions (`x-amz-copy-source-if-*`).  Unlike
/// reads, every failing condition is `PreconditionFailed`.
pub fn evaluate_copy_conditions(
    headers: &HeaderMap,
    etag: &str,
    last_modified: &str,
) -> Result<(), S3Error> {
    evaluate_conditions(
        headers,
        etag,
        last_modified,
        (
            "x-amz-copy-source-if-match",
            "x-amz-copy-source-if-none-match",
            "x-amz-copy-source-if-modified-since",
            "x-amz-copy-source-if-unmodified-since",
        ),
        false,
    )
}

fn evaluate_conditions(
    headers: &HeaderMap,
    etag: &str,
    last_modified: &str,
    (h_match, h_none_match, h_modified, h_unmodified): (&str, &str, &str, &str),
    is_read: bool,
) -> Result<(), S3Error> {
    let etag_inner = strip_etag_quotes(etag);
    let last_modified_time = parse_iso8601(last_modified);

    if let Some(if_match) = headers.get(h_match).and_then(|v| v.to_str().ok()) {
        let wanted = strip_etag_quotes(if_match);
        if wanted != "*" && wanted != etag_inner {
            return Err(S3Error::PreconditionFailed);
        }
        // A passing If-Match short-circuits If-Unmodified-Since.
    } else if let Some(if_unmodified) = headers.get(h_unmodified).and_then(|v| v.to_str().ok()) {
        if let (Some(obj_time), Ok(threshold)) =
            (last_modified_time, httpdate::parse_http_date(if_unmodified))
        {
            if obj_time > threshold {
                return Err(S3Error::PreconditionFailed);
            }
        }
    }

    if let Some(if_none_match) = headers.get(h_none_match).and_then(|v| v.to_str().ok()) {
        let unwanted = strip_etag_quotes(if_none_match);
        if unwanted == "*" || unwanted == etag_inner {
            return Err(if is_read {
                S3Error::NotModified
            } else {
                S3Error::PreconditionFailed
            });
        }
    } else if let Some(if_modified) = headers.get(h_modified).and_then(|v| v.to_str().ok()) {
        if let (Some(obj_time), Ok(threshold)) =
            (last_modified_time, httpdate::parse_http_date(if_modified))
        {
            if obj_time <= threshold {
                return Err(if is_read {
                    S3Error::NotModified
                } else {
                    S3Error::PreconditionFailed
                });
            }
        }
    }

    Ok(())
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Resolve the controlling location constraint for a write to `bucket`.
fn resolve_put_location(
    state: &AppState,
    headers: &HeaderMap,
    bucket_location: &str,
) -> Result<String, S3Error> {
    let header_override = headers.get(LOCATION_HEADER).and_then(|v| v.to_str().ok());
    let gateway = state.data.gateway();
    resolve_location(header_override, Some(bucket_location), gateway.registry())
}

fn validate_website_redirect(headers: &HeaderMap) -> Result<Option<String>, S3Error> {
    let Some(value) = headers
        .get("x-amz-website-redirect-location")
        .and_then(|v| v.to_str().ok())
    else {
        return Ok(None);
    };
    if value.starts_with("http://") || value.starts_with("https://") || value.starts_with('/') {
        Ok(Some(value.to_string()))
    } else {
        Err(S3Error::InvalidRedirectLocation)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// May `auth` read `meta`?  The owner always can; everyone else needs
/// `public-read`.
fn check_read_access(meta: &ObjectMetadata, auth: &AuthContext) -> Result<(), S3Error> {
    if meta.owner_canonical_id == auth.canonical_id || meta.is_public_read() {
        Ok(())
    } else {
        Err(S3Error::AccessDenied {
            message: "Access Denied".to_string(),
        })
    }
}

/// Response headers common to GET and HEAD.
fn object_headers(meta: &ObjectMetadata) -> Vec<(String, String)> {
    let mut out = vec![
        ("etag".to_string(), meta.etag.clone()),
        ("content-type".to_string(), meta.content_type.clone()),
        ("accept-ranges".to_string(), "bytes".to_string()),
    ];
    if let Some(time) = parse_iso8601(&meta.last_modified) {
        out.push(("last-modified".to_string(), httpdate::fmt_http_date(time)));
    }
    if let Some(ref encoding) = meta.content_encoding {
        // `aws-chunked` is a transport artifact, never echoed back.
        out.push(("content-encoding".to_string(), strip_aws_chunked(encoding)));
    }
    if let Some(ref cache_control) = meta.cache_control {
        out.push(("cache-control".to_string(), cache_control.clone()));
    }
    if let Some(ref disposition) = meta.content_disposition {
        out.push(("content-disposition".to_string(), disposition.clone()));
    }
    if let Some(ref expires) = meta.expires {
        out.push(("expires".to_string(), expires.clone()));
    }
    if let Some(ref redirect) = meta.website_redirect_location {
        out.push(("x-amz-website-redirect-location".to_string(), redirect.clone()));
    }
    if let Some(ref version_id) = meta.version_id {
        out.push(("x-amz-version-id".to_string(), version_id.clone()));
    }
    if let Some(ref status) = meta.replication_status {
        out.push(("x-amz-replication-status".to_string(), status.clone()));
    }
    if !meta.tags.is_empty() {
        out.push(("x-amz-tagging-count".to_string(), meta.tags.len().to_string()));
    }
    for (name, value) in &meta.user_metadata {
        out.push((name.clone(), value.clone()));
    }
    out
}

fn apply_headers(mut response: Response, headers: Vec<(String, String)>) -> Response {
    let map = response.headers_mut();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            map.insert(name, value);
        }
    }
    response
}

/// Fetch object metadata for a read: the tip, or a named version.
///
/// A tip that is a delete marker reads as `NoSuchKey`; addressing a
/// delete marker by version id is refused with `MethodNotAllowed`.
async fn fetch_object_for_read(
    state: &AppState,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
) -> Result<ObjectMetadata, S3Error> {
    match version_id {
        Some(vid) => {
            let meta = state
                .metadata
                .get_object(bucket, key, Some(vid))
                .await?
                .ok_or_else(|| S3Error::NoSuchVersion {
                    version_id: vid.to_string(),
                })?;
            if meta.is_delete_marker {
                return Err(S3Error::MethodNotAllowed);
            }
            Ok(meta)
        }
        None => {
            let meta = state
                .metadata
                .get_object(bucket, key, None)
                .await?
                .ok_or_else(|| S3Error::NoSuchKey {
                    key: key.to_string(),
                })?;
            if meta.is_delete_marker {
                return Err(S3Error::NoSuchKey {
                    key: key.to_string(),
                });
            }
            Ok(meta)
        }
    }
}

/// Build the metadata record for a fresh write.
#[allow(clippy::too_many_arguments)]
fn build_object_metadata(
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    auth: &AuthContext,
    etag: String,
    size: u64,
    locations: Vec<DataLocation>,
    tags: Vec<(String, String)>,
    website_redirect: Option<String>,
) -> ObjectMetadata {
    ObjectMetadata {
        bucket: bucket.to_string(),
        key: key.to_string(),
        version_id: None,
        is_delete_marker: false,
        size,
        etag,
        content_type: header_str(headers, "content-type")
            .unwrap_or("application/octet-stream")
            .to_string(),
        content_encoding: header_str(headers, "content-encoding").map(String::from),
        cache_control: header_str(headers, "cache-control").map(String::from),
        content_disposition: header_str(headers, "content-disposition").map(String::from),
        expires: header_str(headers, "expires").map(String::from),
        website_redirect_location: website_redirect,
        user_metadata: extract_user_metadata(headers),
        tags,
        owner_canonical_id: auth.canonical_id.clone(),
        acl: header_str(headers, "x-amz-acl")
            .unwrap_or("private")
            .to_string(),
        last_modified: now_iso8601(),
        locations,
        replication_status: None,
    }
}

// ── PUT ─────────────────────────────────────────────────────────────

/// `PUT /{bucket}/{key}` -- store an object.
pub async fn put_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Bytes,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    let bucket_info = fetch_bucket(&state, bucket).await?;
    let location = resolve_put_location(&state, headers, &bucket_info.location_constraint)?;
    let website_redirect = validate_website_redirect(headers)?;

    let tagging = header_str(headers, "x-amz-tagging").map(String::from);
    let mut ctx = KeyContext::new(bucket, key);
    ctx.metadata_headers = extract_user_metadata(headers);
    ctx.tagging = tagging.clone();
    ctx.content_type = header_str(headers, "content-type").map(String::from);

    let size = body.len() as u64;
    let (record, md5_hex) = state
        .data
        .put(
            body,
            &location,
            &ctx,
            header_str(headers, "content-md5"),
            bucket_info.sse.as_ref(),
            &req_id,
        )
        .await?;
    let etag = format!("\"{md5_hex}\"");

    // The previous tip's data becomes garbage on an unversioned
    // overwrite; collect it before the metadata write replaces it.
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

    let tags = tagging.as_deref().map(xml::decode_tag_query).unwrap_or_default();
    let meta = build_object_metadata(
        bucket,
        key,
        headers,
        auth,
        etag.clone(),
        size,
        vec![record.clone()],
        tags,
        website_redirect,
    );
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
        debug!(req_id, bucket, key, "overwrite: clearing previous data");
        state
            .data
            .batch_delete(old, "PUT", Some(&record), &req_id)
            .await;
    }

    let mut response = StatusCode::OK.into_response();
    let mut headers_out = vec![("etag".to_string(), etag)];
    if let Some(vid) = version_id {
        headers_out.push(("x-amz-version-id".to_string(), vid));
    }
    response = apply_headers(response, headers_out);
    Ok(response)
}

// ── GET / HEAD ──────────────────────────────────────────────────────

/// `GET /{bucket}/{key}` -- fetch an object or a byte range of it.
pub async fn get_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let meta =
        fetch_object_for_read(&state, bucket, key, query.get("versionId").map(String::as_str))
            .await?;
    check_read_access(&meta, auth)?;
    evaluate_read_conditions(headers, &meta.etag, &meta.last_modified)?;

    let range = parse_range(headers, meta.size)?;
    let data = state.data.get(&meta.locations, range, &req_id).await?;

    let mut response = match range {
        Some((first, last)) => {
            let mut r = (StatusCode::PARTIAL_CONTENT, data).into_response();
            let content_range = format!("bytes {first}-{last}/{}", meta.size);
            r.headers_mut().insert(
                "content-range",
                HeaderValue::from_str(&content_range).expect("valid content-range"),
            );
            r
        }
        None => (StatusCode::OK, data).into_response(),
    };
    response = apply_headers(response, object_headers(&meta));
    Ok(response)
}

/// `HEAD /{bucket}/{key}` -- object metadata only.
pub async fn head_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    fetch_bucket(&state, bucket).await?;
    let meta =
        fetch_object_for_read(&state, bucket, key, query.get("versionId").map(String::as_str))
            .await?;
    check_read_access(&meta, auth)?;
    evaluate_read_conditions(headers, &meta.etag, &meta.last_modified)?;

    let mut response = StatusCode::OK.into_response();
    response = apply_headers(response, object_headers(&meta));
    response.headers_mut().insert(
        "content-length",
        HeaderValue::from_str(&meta.size.to_string()).expect("valid length"),
    );
    Ok(response)
}

// ── DELETE ──────────────────────────────────────────────────────────

/// `DELETE /{bucket}/{key}` -- delete an object or one version of it.
///
/// On a versioning-enabled bucket a delete without a version id lays
/// down a delete marker; with a version id it removes that version and
/// its data.
pub async fn delete_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    let bucket_info = fetch_bucket(&state, bucket).await?;

    match query.get("versionId") {
        Some(version_id) => {
            let existing = state
                .metadata
                .get_object(bucket, key, Some(version_id))
                .await?;
            let Some(existing) = existing else {
                // Deleting an absent version is a no-op.
                return Ok(StatusCode::NO_CONTENT.into_response());
            };
            state
                .metadata
                .delete_version(bucket, key, version_id)
                .await?;
            if !existing.is_delete_marker {
                state
                    .data
                    .batch_delete(existing.locations, "DELETE", None, &req_id)
                    .await;
            }
            let mut response = StatusCode::NO_CONTENT.into_response();
            let mut headers_out = vec![("x-amz-version-id".to_string(), version_id.clone())];
            if existing.is_delete_marker {
                headers_out.push(("x-amz-delete-marker".to_string(), "true".to_string()));
            }
            response = apply_headers(response, headers_out);
            Ok(response)
        }
        None => match bucket_info.versioning {
            VersioningState::Enabled | VersioningState::Suspended => {
                let marker = delete_marker_base(bucket, key, auth);
                let version_id = state
                    .metadata
                    .put_object(
                        marker,
                        PutVersionOptions {
                            versioning: bucket_info.versioning,
                            version_id: None,
                        },
                    )
                    .await?;
                let mut response = StatusCode::NO_CONTENT.into_response();
                let mut headers_out =
                    vec![("x-amz-delete-marker".to_string(), "true".to_string())];
                if let Some(vid) = version_id {
                    headers_out.push(("x-amz-version-id".to_string(), vid));
                }
                response = apply_headers(response, headers_out);
                Ok(response)
            }
            VersioningState::None => {
                if let Some(existing) = state.metadata.get_object(bucket, key, None).await? {
                    state.metadata.delete_object(bucket, key).await?;
                    if !existing.is_delete_marker {
                        state
                            .data
                            .batch_delete(existing.locations, "DELETE", None, &req_id)
                            .await;
                    }
                }
                Ok(StatusCode::NO_CONTENT.into_response())
            }
        },
    }
}

fn delete_marker_base(bucket: &str, key: &str, auth: &AuthContext) -> ObjectMetadata {
    ObjectMetadata {
        bucket: bucket.to_string(),
        key: key.to_string(),
        version_id: None,
        is_delete_marker: true,
        size: 0,
        etag: String::new(),
        content_type: String::new(),
        content_encoding: None,
        cache_control: None,
        content_disposition: None,
        expires: None,
        website_redirect_location: None,
        user_metadata: HashMap::new(),
        tags: Vec::new(),
        owner_canonical_id: auth.canonical_id.clone(),
        acl: "private".to_string(),
        last_modified: now_iso8601(),
        locations: Vec::new(),
        replication_status: None,
    }
}

/// `POST /{bucket}?delete` -- multi-object delete.
///
/// At most 1000 entries; more fails with `MalformedXML` before any
/// deletion occurs.  Per-object failures land in the `<Error>` list with
/// stable codes; quiet mode omits the `<Deleted>` entries.
pub async fn delete_objects(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    let bucket_info = fetch_bucket(&state, bucket).await?;

    let (entries, quiet) = xml::parse_delete_xml(body)?;
    if entries.is_empty() || entries.len() > MULTI_DELETE_MAX_KEYS {
        return Err(S3Error::MalformedXML);
    }

    let mut deleted: Vec<(String, Option<String>, bool)> = Vec::new();
    let mut errors: Vec<(String, &'static str, String)> = Vec::new();

    for entry in &entries {
        // Per-object access: the bucket owner may delete anything; other
        // principals only their own objects.
        let existing = state
            .metadata
            .get_object(bucket, &entry.key, entry.version_id.as_deref())
            .await?;
        if let Some(ref meta) = existing {
            if meta.owner_canonical_id != auth.canonical_id
                && bucket_info.owner_canonical_id != auth.canonical_id
            {
                errors.push((entry.key.clone(), "AccessDenied", "Access Denied".to_string()));
                continue;
            }
        }

        match (&entry.version_id, bucket_info.versioning) {
            (Some(vid), _) => {
                if let Some(meta) = existing {
                    state.metadata.delete_version(bucket, &entry.key, vid).await?;
                    if !meta.is_delete_marker {
                        state
                            .data
                            .batch_delete(meta.locations, "DELETE", None, &req_id)
                            .await;
                    }
                    deleted.push((entry.key.clone(), Some(vid.clone()), meta.is_delete_marker));
                } else {
                    deleted.push((entry.key.clone(), Some(vid.clone()), false));
                }
            }
            (None, VersioningState::Enabled | VersioningState::Suspended) => {
                let marker = delete_marker_base(bucket, &entry.key, auth);
                let version_id = state
                    .metadata
                    .put_object(
                        marker,
                        PutVersionOptions {
                            versioning: bucket_info.versioning,
                            version_id: None,
                        },
                    )
                    .await?;
                deleted.push((entry.key.clone(), version_id, true));
            }
            (None, VersioningState::None) => {
                if let Some(meta) = existing {
                    state.metadata.delete_object(bucket, &entry.key).await?;
                    if !meta.is_delete_marker {
                        state
                            .data
                            .batch_delete(meta.locations, "DELETE", None, &req_id)
                            .await;
                    }
                }
                // Deleting an absent key still reports success.
                deleted.push((entry.key.clone(), None, false));
            }
        }
    }

    let deleted_entries: Vec<DeletedEntry<'_>> = deleted
        .iter()
        .map(|(key, version_id, delete_marker)| DeletedEntry {
            key,
            version_id: version_id.as_deref(),
            delete_marker: *delete_marker,
        })
        .collect();
    let error_entries: Vec<DeleteErrorEntry<'_>> = errors
        .iter()
        .map(|(key, code, message)| DeleteErrorEntry { key, code, message })
        .collect();

    let body = xml::render_delete_result(&deleted_entries, &error_entries, quiet);
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}

// ── COPY ────────────────────────────────────────────────────────────

/// Parse `x-amz-copy-source` into `(bucket, key, version_id)`.
fn parse_copy_source(headers: &HeaderMap) -> Result<(String, String, Option<String>), S3Error> {
    let raw = header_str(headers, "x-amz-copy-source").ok_or_else(|| S3Error::InvalidArgument {
        message: "missing x-amz-copy-source".to_string(),
    })?;
    let decoded = percent_encoding::percent_decode_str(raw).decode_utf8_lossy();
    let (path, version_id) = match decoded.split_once("?versionId=") {
        Some((path, vid)) => (path.to_string(), Some(vid.to_string())),
        None => (decoded.into_owned(), None),
    };
    let path = path.strip_prefix('/').unwrap_or(&path).to_string();
    let (bucket, key) = path.split_once('/').ok_or_else(|| S3Error::InvalidArgument {
        message: format!("invalid x-amz-copy-source: {raw}"),
    })?;
    if bucket.is_empty() || key.is_empty() {
        return Err(S3Error::InvalidArgument {
            message: format!("invalid x-amz-copy-source: {raw}"),
        });
    }
    Ok((bucket.to_string(), key.to_string(), version_id))
}

/// Fetch the source object for a COPY.
///
/// Addressing a delete-marker version by id is `InvalidRequest`; a tip
/// that is a delete marker is `NoSuchKey`.
async fn fetch_copy_source(
    state: &AppState,
    bucket: &str,
    key: &str,
    version_id: Option<&str>,
) -> Result<ObjectMetadata, S3Error> {
    fetch_bucket(state, bucket).await?;
    match version_id {
        Some(vid) => {
            let meta = state
                .metadata
                .get_object(bucket, key, Some(vid))
                .await?
                .ok_or_else(|| S3Error::NoSuchVersion {
                    version_id: vid.to_string(),
                })?;
            if meta.is_delete_marker {
                return Err(S3Error::InvalidRequest {
                    message: "The source of a copy request may not specifically refer to a delete marker by version id.".to_string(),
                });
            }
            Ok(meta)
        }
        None => {
            let meta = state
                .metadata
                .get_object(bucket, key, None)
                .await?
                .ok_or_else(|| S3Error::NoSuchKey {
                    key: key.to_string(),
                })?;
            if meta.is_delete_marker {
                return Err(S3Error::NoSuchKey {
                    key: key.to_string(),
                });
            }
            Ok(meta)
        }
    }
}

/// Resolve and authorize the source object of a part copy.
pub(crate) async fn fetch_part_copy_source(
    state: &AppState,
    headers: &HeaderMap,
    auth: &AuthContext,
) -> Result<ObjectMetadata, S3Error> {
    let (src_bucket, src_key, src_version) = parse_copy_source(headers)?;
    let source = fetch_copy_source(state, &src_bucket, &src_key, src_version.as_deref()).await?;
    check_read_access(&source, auth)?;
    Ok(source)
}

/// `PUT /{bucket}/{key}` with `x-amz-copy-source` -- copy an object.
pub async fn copy_object(
    state: Arc<AppState>,
    dest_bucket: &str,
    dest_key: &str,
    headers: &HeaderMap,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    let (src_bucket, src_key, src_version) = parse_copy_source(headers)?;
    let source = fetch_copy_source(&state, &src_bucket, &src_key, src_version.as_deref()).await?;
    check_read_access(&source, auth)?;
    evaluate_copy_conditions(headers, &source.etag, &source.last_modified)?;

    let dest_bucket_info = fetch_bucket(&state, dest_bucket).await?;
    let dest_location =
        resolve_put_location(&state, headers, &dest_bucket_info.location_constraint)?;

    // COPY keeps the source's descriptive metadata; REPLACE takes it all
    // from this request.
    let directive = header_str(headers, "x-amz-metadata-directive").unwrap_or("COPY");
    let replace = match directive {
        "COPY" => false,
        "REPLACE" => true,
        other => {
            return Err(S3Error::InvalidArgument {
                message: format!("unknown metadata directive: {other}"),
            })
        }
    };

    let mut dest_ctx = KeyContext::new(dest_bucket, dest_key);
    if replace {
        dest_ctx.metadata_headers = extract_user_metadata(headers);
        dest_ctx.content_type = header_str(headers, "content-type").map(String::from);
    } else {
        dest_ctx.metadata_headers = source.user_metadata.clone();
        dest_ctx.content_type = Some(source.content_type.clone());
    }

    let gateway = state.data.gateway();
    let sse = dest_bucket_info.sse.as_ref();
    let single_source = (source.locations.len() == 1).then(|| source.locations[0].clone());

    // Same-location copies on capable backends stay server-side; every
    // other combination streams through the data wrapper.
    let (new_locations, etag) = match single_source {
        Some(ref src_record)
            if sse.is_none()
                && src_record.ciphered_data_key.is_none()
                && gateway.supports_native_copy(src_record, &dest_location) =>
        {
            let record = gateway
                .copy_object(src_record, &dest_location, &dest_ctx, &req_id)
                .await?;
            (vec![record], source.etag.clone())
        }
        _ => {
            let data = state.data.get(&source.locations, None, &req_id).await?;
            let (record, md5_hex) = state
                .data
                .put(data, &dest_location, &dest_ctx, None, sse, &req_id)
                .await?;
            (vec![record], format!("\"{md5_hex}\""))
        }
    };

    let old_locations = if dest_bucket_info.versioning == VersioningState::None {
        state
            .metadata
            .get_object(dest_bucket, dest_key, None)
            .await?
            .filter(|old| !old.is_delete_marker)
            .map(|old| old.locations)
    } else {
        None
    };

    let last_modified = now_iso8601();
    let meta = ObjectMetadata {
        bucket: dest_bucket.to_string(),
        key: dest_key.to_string(),
        version_id: None,
        is_delete_marker: false,
        size: source.size,
        etag: etag.clone(),
        content_type: dest_ctx
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        content_encoding: if replace {
            header_str(headers, "content-encoding").map(String::from)
        } else {
            source.content_encoding.clone()
        },
        cache_control: if replace {
            header_str(headers, "cache-control").map(String::from)
        } else {
            source.cache_control.clone()
        },
        content_disposition: if replace {
            header_str(headers, "content-disposition").map(String::from)
        } else {
            source.content_disposition.clone()
        },
        expires: if replace {
            header_str(headers, "expires").map(String::from)
        } else {
            source.expires.clone()
        },
        website_redirect_location: validate_website_redirect(headers)?,
        user_metadata: dest_ctx.metadata_headers.clone(),
        tags: if replace {
            header_str(headers, "x-amz-tagging")
                .map(xml::decode_tag_query)
                .unwrap_or_default()
        } else {
            source.tags.clone()
        },
        owner_canonical_id: auth.canonical_id.clone(),
        acl: header_str(headers, "x-amz-acl").unwrap_or("private").to_string(),
        last_modified: last_modified.clone(),
        locations: new_locations.clone(),
        replication_status: None,
    };

    let version_id = state
        .metadata
        .put_object(
            meta,
            PutVersionOptions {
                versioning: dest_bucket_info.versioning,
                version_id: None,
            },
        )
        .await?;

    if let Some(old) = old_locations {
        state
            .data
            .batch_delete(old, "PUT", new_locations.first(), &req_id)
            .await;
    }

    let body = xml::render_copy_result("CopyObjectResult", &etag, &last_modified);
    let mut response = (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response();
    if let Some(vid) = version_id {
        response = apply_headers(response, vec![("x-amz-version-id".to_string(), vid)]);
    }
    Ok(response)
}

// ── Tagging ─────────────────────────────────────────────────────────

/// `PUT /{bucket}/{key}?tagging` -- replace the object's tag set.
pub async fn put_object_tagging(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let mut meta =
        fetch_object_for_read(&state, bucket, key, query.get("versionId").map(String::as_str))
            .await?;

    let tag_query = xml::parse_tagging_xml(body)?;
    let tags = xml::decode_tag_query(&tag_query);

    // External backends keep a backend-side tag set in sync.
    let gateway = state.data.gateway();
    if let Some(location) = meta.locations.first() {
        if gateway.supports_backend_tagging(&location.data_store_name) {
            gateway
                .object_put_tagging(location, &tags, &meta.user_metadata, &req_id)
                .await?;
        }
    }

    meta.tags = tags;
    let versioning = if meta.version_id.is_some() {
        VersioningState::Enabled
    } else {
        VersioningState::None
    };
    let version_id = meta.version_id.clone();
    state
        .metadata
        .put_object(
            meta,
            PutVersionOptions {
                versioning,
                version_id,
            },
        )
        .await?;

    Ok(StatusCode::OK.into_response())
}

/// `GET /{bucket}/{key}?tagging` -- read the object's tag set.
pub async fn get_object_tagging(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    fetch_bucket(&state, bucket).await?;
    let meta =
        fetch_object_for_read(&state, bucket, key, query.get("versionId").map(String::as_str))
            .await?;
    let body = xml::render_tagging(&meta.tags);
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}

/// `DELETE /{bucket}/{key}?tagging` -- clear the object's tag set.
pub async fn delete_object_tagging(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let req_id = generate_request_id();
    fetch_bucket(&state, bucket).await?;
    let mut meta =
        fetch_object_for_read(&state, bucket, key, query.get("versionId").map(String::as_str))
            .await?;

    let gateway = state.data.gateway();
    if let Some(location) = meta.locations.first() {
        if gateway.supports_backend_tagging(&location.data_store_name) {
            gateway
                .object_delete_tagging(location, &meta.user_metadata, &req_id)
                .await?;
        }
    }

    meta.tags.clear();
    let versioning = if meta.version_id.is_some() {
        VersioningState::Enabled
    } else {
        VersioningState::None
    };
    let version_id = meta.version_id.clone();
    state
        .metadata
        .put_object(
            meta,
            PutVersionOptions {
                versioning,
                version_id,
            },
        )
        .await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const ETAG: &str = "\"7ac66c0f148de9519b8bd264312c4d64\"";
    const LAST_MODIFIED: &str = "2026-03-01T12:00:00.000Z";
    const EQUAL_DATE: &str = "Sun, 01 Mar 2026 12:00:00 GMT";
    const PAST_DATE: &str = "Sat, 01 Mar 2025 12:00:00 GMT";
    const FUTURE_DATE: &str = "Mon, 01 Mar 2027 12:00:00 GMT";

    fn copy_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    fn copy_eval(pairs: &[(&str, &str)]) -> Result<(), S3Error> {
        evaluate_copy_conditions(&copy_headers(pairs), ETAG, LAST_MODIFIED)
    }

    // The twelve combinations of the conditional-copy truth table.

    #[test]
    fn test_copy_if_match_etag_ok() {
        assert!(copy_eval(&[("x-amz-copy-source-if-match", ETAG)]).is_ok());
    }

    #[test]
    fn test_copy_if_match_star_ok() {
        assert!(copy_eval(&[("x-amz-copy-source-if-match", "*")]).is_ok());
    }

    #[test]
    fn test_copy_if_match_bad_412() {
        let err = copy_eval(&[("x-amz-copy-source-if-match", "\"bad\"")]).unwrap_err();
        assert_eq!(err.code(), "PreconditionFailed");
    }

    #[test]
    fn test_copy_if_none_match_bad_ok() {
        assert!(copy_eval(&[("x-amz-copy-source-if-none-match", "\"bad\"")]).is_ok());
    }

    #[test]
    fn test_copy_if_none_match_etag_412() {
        let err = copy_eval(&[("x-amz-copy-source-if-none-match", ETAG)]).unwrap_err();
        assert_eq!(err.code(), "PreconditionFailed");
    }

    #[test]
    fn test_copy_if_modified_since_past_ok() {
        assert!(copy_eval(&[("x-amz-copy-source-if-modified-since", PAST_DATE)]).is_ok());
    }

    #[test]
    fn test_copy_if_modified_since_equal_412() {
        let err =
            copy_eval(&[("x-amz-copy-source-if-modified-since", EQUAL_DATE)]).unwrap_err();
        assert_eq!(err.code(), "PreconditionFailed");
    }

    #[test]
    fn test_copy_if_unmodified_since_future_ok() {
        assert!(copy_eval(&[("x-amz-copy-source-if-unmodified-since", FUTURE_DATE)]).is_ok());
    }

    #[test]
    fn test_copy_if_unmodified_since_equal_ok() {
        assert!(copy_eval(&[("x-amz-copy-source-if-unmodified-since", EQUAL_DATE)]).is_ok());
    }

    #[test]
    fn test_copy_if_unmodified_since_past_412() {
        let err =
            copy_eval(&[("x-amz-copy-source-if-unmodified-since", PAST_DATE)]).unwrap_err();
        assert_eq!(err.code(), "PreconditionFailed");
    }

    #[test]
    fn test_copy_if_match_composed_with_if_unmodified_since() {
        // A present If-Match decides alone; If-Unmodified-Since is skipped.
        assert!(copy_eval(&[
            ("x-amz-copy-source-if-match", ETAG),
            ("x-amz-copy-source-if-unmodified-since", FUTURE_DATE),
        ])
        .is_ok());
        assert!(copy_eval(&[
            ("x-amz-copy-source-if-match", ETAG),
            ("x-amz-copy-source-if-unmodified-since", PAST_DATE),
        ])
        .is_ok());
        assert_eq!(
            copy_eval(&[
                ("x-amz-copy-source-if-match", "\"bad\""),
                ("x-amz-copy-source-if-unmodified-since", FUTURE_DATE),
            ])
            .unwrap_err()
            .code(),
            "PreconditionFailed"
        );
        assert_eq!(
            copy_eval(&[
                ("x-amz-copy-source-if-match", "\"bad\""),
                ("x-amz-copy-source-if-unmodified-since", PAST_DATE),
            ])
            .unwrap_err()
            .code(),
            "PreconditionFailed"
        );
    }

    #[test]
    fn test_read_conditions_signal_304() {
        let headers = copy_headers(&[("if-none-match", ETAG)]);
        let err = evaluate_read_conditions(&headers, ETAG, LAST_MODIFIED).unwrap_err();
        assert_eq!(err.code(), "NotModified");

        let headers = copy_headers(&[("if-modified-since", FUTURE_DATE)]);
        let err = evaluate_read_conditions(&headers, ETAG, LAST_MODIFIED).unwrap_err();
        assert_eq!(err.code(), "NotModified");
    }

    #[test]
    fn test_parse_copy_source_forms() {
        let headers = copy_headers(&[("x-amz-copy-source", "/src-bucket/path/to/key")]);
        let (bucket, key, vid) = parse_copy_source(&headers).unwrap();
        assert_eq!(bucket, "src-bucket");
        assert_eq!(key, "path/to/key");
        assert!(vid.is_none());

        let headers =
            copy_headers(&[("x-amz-copy-source", "src-bucket/key?versionId=abc123")]);
        let (_, key, vid) = parse_copy_source(&headers).unwrap();
        assert_eq!(key, "key");
        assert_eq!(vid.as_deref(), Some("abc123"));

        let headers = copy_headers(&[("x-amz-copy-source", "justbucket")]);
        assert!(parse_copy_source(&headers).is_err());
    }

    #[test]
    fn test_website_redirect_validation() {
        let ok = copy_headers(&[("x-amz-website-redirect-location", "/elsewhere")]);
        assert_eq!(
            validate_website_redirect(&ok).unwrap().as_deref(),
            Some("/elsewhere")
        );

        let bad = copy_headers(&[("x-amz-website-redirect-location", "ftp://nope")]);
        assert_eq!(
            validate_website_redirect(&bad).unwrap_err().code(),
            "InvalidRedirectLocation"
        );
    }
}
