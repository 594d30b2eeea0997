//! Bucket-level handlers, including the deletion coordinator.
//!
//! Bucket deletion is a sequential pipeline: emptiness check, in-flight
//! MPU check, mark `deleted`, detach from the owner's bucket index, and
//! finalise (drop metadata, destroy the SSE master key).  A crash after
//! the mark leaves the bucket recoverable by [`invisible_delete`], the
//! sweeper entry point that replays the last two stages tolerating
//! missing state.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::S3Error;
use crate::location::resolve_location;
use crate::metadata::store::{BucketInfo, SseConfig, VersioningState};
use crate::{AppState, AuthContext};

use super::now_iso8601;

/// Header enabling per-bucket AES-256 server-side encryption at create
/// time.
pub const SSE_HEADER: &str = "x-amz-scal-server-side-encryption";

/// Light S3 bucket-name validation.
fn validate_bucket_name(name: &str) -> Result<(), S3Error> {
    let valid_len = (3..=63).contains(&name.len());
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
    if valid_len && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(S3Error::InvalidArgument {
            message: format!("invalid bucket name: {name}"),
        })
    }
}

/// Parse the optional `<CreateBucketConfiguration>` body.
fn parse_location_constraint(body: &[u8]) -> Result<Option<String>, S3Error> {
    if body.is_empty() {
        return Ok(None);
    }
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);
    let mut in_constraint = false;
    let mut constraint = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                in_constraint = e.name().as_ref() == b"LocationConstraint";
            }
            Ok(Event::End(_)) => in_constraint = false,
            Ok(Event::Text(ref e)) => {
                if in_constraint {
                    constraint = Some(e.unescape().unwrap_or_default().to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }
    Ok(constraint)
}

/// `PUT /{bucket}` -- create a bucket.
pub async fn create_bucket(
    state: Arc<AppState>,
    bucket: &str,
    headers: &axum::http::HeaderMap,
    body: &[u8],
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    validate_bucket_name(bucket)?;

    if let Some(existing) = state.metadata.get_bucket(bucket).await? {
        if existing.deleted {
            // A previous delete stalled after the mark; finish it before
            // recreating.
            invisible_delete(&state, &existing).await?;
        } else if existing.owner_canonical_id == auth.canonical_id {
            return Err(S3Error::BucketAlreadyOwnedByYou {
                bucket: bucket.to_string(),
            });
        } else {
            return Err(S3Error::BucketAlreadyExists {
                bucket: bucket.to_string(),
            });
        }
    }

    // The requested constraint is the bucket's pinned location, not a
    // per-request override, so naming an unregistered one is an error
    // rather than a fall-through.
    let requested = parse_location_constraint(body)?;
    let gateway = state.data.gateway();
    let location = resolve_location(None, requested.as_deref(), gateway.registry())?;

    let sse = match headers.get(SSE_HEADER).and_then(|v| v.to_str().ok()) {
        Some("AES256") => {
            let master_key_id = state
                .data
                .kms()
                .create_bucket_key()
                .await
                .map_err(|e| S3Error::internal("KMS bucket key", e))?;
            Some(SseConfig {
                algorithm: "AES256".to_string(),
                master_key_id,
            })
        }
        Some(other) => {
            return Err(S3Error::InvalidArgument {
                message: format!("unsupported server-side encryption: {other}"),
            })
        }
        None => None,
    };

    state
        .metadata
        .create_bucket(BucketInfo {
            name: bucket.to_string(),
            owner_canonical_id: auth.canonical_id.clone(),
            location_constraint: location,
            versioning: VersioningState::None,
            sse,
            transient: false,
            deleted: false,
            created_at: now_iso8601(),
        })
        .await?;
    state
        .metadata
        .add_user_bucket(&auth.canonical_id, bucket)
        .await?;

    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(
        "location",
        HeaderValue::from_str(&format!("/{bucket}")).expect("valid location"),
    );
    Ok(response)
}

/// `HEAD /{bucket}`.
pub async fn head_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    super::fetch_bucket(&state, bucket).await?;
    Ok(StatusCode::OK.into_response())
}

/// `PUT /{bucket}?versioning` -- flip the versioning state.
pub async fn put_bucket_versioning(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let mut info = super::fetch_bucket(&state, bucket).await?;
    if info.owner_canonical_id != auth.canonical_id {
        return Err(S3Error::AccessDenied {
            message: "Access Denied".to_string(),
        });
    }

    let text = String::from_utf8_lossy(body);
    let versioning = if text.contains("<Status>Enabled</Status>") {
        VersioningState::Enabled
    } else if text.contains("<Status>Suspended</Status>") {
        VersioningState::Suspended
    } else {
        return Err(S3Error::MalformedXML);
    };

    info.versioning = versioning;
    state.metadata.put_bucket(info).await?;
    Ok(StatusCode::OK.into_response())
}

/// `GET /{bucket}?versioning`.
pub async fn get_bucket_versioning(
    state: Arc<AppState>,
    bucket: &str,
) -> Result<Response, S3Error> {
    let info = super::fetch_bucket(&state, bucket).await?;
    let status = match info.versioning {
        VersioningState::None => String::new(),
        VersioningState::Enabled => "<Status>Enabled</Status>".to_string(),
        VersioningState::Suspended => "<Status>Suspended</Status>".to_string(),
    };
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><VersioningConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">{status}</VersioningConfiguration>"
    );
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response())
}

/// `DELETE /{bucket}` -- the deletion pipeline.
pub async fn delete_bucket(
    state: Arc<AppState>,
    bucket: &str,
    auth: &AuthContext,
) -> Result<Response, S3Error> {
    let mut info = super::fetch_bucket(&state, bucket).await?;
    if info.owner_canonical_id != auth.canonical_id {
        return Err(S3Error::AccessDenied {
            message: "Access Denied".to_string(),
        });
    }

    // Stage 1: emptiness.  One hit of any version or delete marker is
    // enough to refuse.
    if !state.metadata.list_versions(bucket, 1).await?.is_empty() {
        return Err(S3Error::BucketNotEmpty {
            bucket: bucket.to_string(),
        });
    }

    // Stage 2: in-flight MPUs get their own error code so operators can
    // tell the two situations apart.
    if !state.metadata.list_mpu_overviews(bucket, 1).await?.is_empty() {
        return Err(S3Error::MpuInProgress {
            bucket: bucket.to_string(),
        });
    }

    // Stage 3: mark.  A crash from here on leaves the bucket for the
    // sweeper.
    info.transient = false;
    info.deleted = true;
    state.metadata.put_bucket(info.clone()).await?;

    // Stages 4-5 are shared with the sweeper.
    invisible_delete(&state, &info).await?;

    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Final stages of bucket deletion: detach from the owner's bucket
/// index and drop the metadata and SSE master key.
///
/// Invoked by the deletion pipeline and replayed by the sweeper for
/// buckets previously marked `deleted`; every step tolerates "not
/// found".
pub async fn invisible_delete(state: &AppState, info: &BucketInfo) -> Result<(), S3Error> {
    state
        .metadata
        .remove_user_bucket(&info.owner_canonical_id, &info.name)
        .await?;
    state.metadata.delete_bucket(&info.name).await?;

    if let Some(ref sse) = info.sse {
        if let Err(e) = state.data.kms().destroy_bucket_key(&sse.master_key_id).await {
            warn!(bucket = %info.name, "failed to destroy bucket master key: {e}");
        }
    }

    info!(bucket = %info.name, "bucket removed");
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_name_validation() {
        assert!(validate_bucket_name("valid-bucket-1").is_ok());
        assert!(validate_bucket_name("a.b.c").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("UPPER").is_err());
        assert!(validate_bucket_name("-leading").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
    }

    #[test]
    fn test_parse_location_constraint() {
        assert_eq!(parse_location_constraint(b"").unwrap(), None);

        let body = br#"<CreateBucketConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
            <LocationConstraint>aws-east</LocationConstraint>
        </CreateBucketConfiguration>"#;
        assert_eq!(
            parse_location_constraint(body).unwrap().as_deref(),
            Some("aws-east")
        );

        assert!(parse_location_constraint(b"not xml <<<").is_err());
    }
}
