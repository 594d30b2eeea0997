//! S3 request handlers.
//!
//! Handlers receive the shared [`crate::AppState`], already-parsed path
//! and query pieces, and the authenticated principal; they return
//! `Result<Response, S3Error>` so errors render as S3 XML uniformly.

use axum::http::HeaderMap;
use std::collections::HashMap;

use crate::errors::S3Error;
use crate::metadata::store::BucketInfo;
use crate::AppState;

pub mod bucket;
pub mod multipart;
pub mod object;

/// Current time as an ISO-8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Parse a stored ISO-8601 timestamp back to `SystemTime` for
/// conditional-request comparisons.
pub fn parse_iso8601(iso: &str) -> Option<std::time::SystemTime> {
    chrono::DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(std::time::SystemTime::from)
}

/// Extract `x-amz-meta-*` headers (lowercased full names).
pub fn extract_user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_lowercase();
        if name_str.starts_with("x-amz-meta-") {
            if let Ok(val) = value.to_str() {
                meta.insert(name_str, val.to_string());
            }
        }
    }
    meta
}

/// Strip surrounding quotes from an ETag value.
pub fn strip_etag_quotes(etag: &str) -> &str {
    if etag.len() >= 2 && etag.starts_with('"') && etag.ends_with('"') {
        &etag[1..etag.len() - 1]
    } else {
        etag
    }
}

/// Remove the `aws-chunked` transport artifact from a `Content-Encoding`
/// value on the way out: `"base64,aws-chunked"` becomes `"base64,"`.
pub fn strip_aws_chunked(encoding: &str) -> String {
    encoding.replace("aws-chunked", "")
}

/// Parse a `Range: bytes=a-b` header against an object of `size` bytes.
///
/// Returns the inclusive byte range, `None` when no header is present,
/// or `InvalidRange` when the range cannot be satisfied.
pub fn parse_range(headers: &HeaderMap, size: u64) -> Result<Option<(u64, u64)>, S3Error> {
    let Some(value) = headers.get("range").and_then(|v| v.to_str().ok()) else {
        return Ok(None);
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        // Unknown units are ignored, per HTTP semantics.
        return Ok(None);
    };
    let Some((first_str, last_str)) = spec.split_once('-') else {
        return Err(S3Error::InvalidRange);
    };

    let range = if first_str.is_empty() {
        // Suffix form: last N bytes.
        let n: u64 = last_str.parse().map_err(|_| S3Error::InvalidRange)?;
        if n == 0 || size == 0 {
            return Err(S3Error::InvalidRange);
        }
        (size.saturating_sub(n), size - 1)
    } else {
        let first: u64 = first_str.parse().map_err(|_| S3Error::InvalidRange)?;
        if first >= size {
            return Err(S3Error::InvalidRange);
        }
        let last = if last_str.is_empty() {
            size - 1
        } else {
            let last: u64 = last_str.parse().map_err(|_| S3Error::InvalidRange)?;
            if last < first {
                return Err(S3Error::InvalidRange);
            }
            last.min(size - 1)
        };
        (first, last)
    };
    Ok(Some(range))
}

/// Load bucket metadata or fail with `NoSuchBucket`.  Buckets marked
/// `deleted` are invisible to the data plane.
pub async fn fetch_bucket(state: &AppState, name: &str) -> Result<BucketInfo, S3Error> {
    match state.metadata.get_bucket(name).await? {
        Some(info) if !info.deleted => Ok(info),
        _ => Err(S3Error::NoSuchBucket {
            bucket: name.to_string(),
        }),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_iso8601_roundtrip() {
        let now = now_iso8601();
        assert!(parse_iso8601(&now).is_some());
        assert!(now.ends_with('Z'));
    }

    #[test]
    fn test_strip_aws_chunked_keeps_separator() {
        assert_eq!(strip_aws_chunked("base64,aws-chunked"), "base64,");
        assert_eq!(strip_aws_chunked("aws-chunked"), "");
        assert_eq!(strip_aws_chunked("gzip"), "gzip");
    }

    #[test]
    fn test_strip_etag_quotes() {
        assert_eq!(strip_etag_quotes("\"abc\""), "abc");
        assert_eq!(strip_etag_quotes("abc"), "abc");
        assert_eq!(strip_etag_quotes("*"), "*");
    }

    fn headers_with_range(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("range", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range(&headers_with_range("bytes=0-4"), 10).unwrap(),
            Some((0, 4))
        );
        // Open-ended.
        assert_eq!(
            parse_range(&headers_with_range("bytes=3-"), 10).unwrap(),
            Some((3, 9))
        );
        // Suffix.
        assert_eq!(
            parse_range(&headers_with_range("bytes=-4"), 10).unwrap(),
            Some((6, 9))
        );
        // Last byte clamped to the object size.
        assert_eq!(
            parse_range(&headers_with_range("bytes=5-100"), 10).unwrap(),
            Some((5, 9))
        );
        // No header.
        assert_eq!(parse_range(&HeaderMap::new(), 10).unwrap(), None);
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert!(parse_range(&headers_with_range("bytes=10-12"), 10).is_err());
        assert!(parse_range(&headers_with_range("bytes=5-2"), 10).is_err());
        assert!(parse_range(&headers_with_range("bytes=-0"), 10).is_err());
    }

    #[test]
    fn test_user_metadata_extraction_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Amz-Meta-Color", HeaderValue::from_static("blue"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let meta = extract_user_metadata(&headers);
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.get("x-amz-meta-color").map(String::as_str), Some("blue"));
    }
}
