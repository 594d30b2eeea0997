//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code (plus the two
//! service-specific codes `MPUinProgress` and `ObjNotFound`).  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(S3Error::NoSuchBucket { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The specified key does not exist")]
    NoSuchKey { key: String },

    /// The specified version does not exist.
    #[error("The specified version does not exist")]
    NoSuchVersion { version_id: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A bucket with the requested name already exists.
    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    /// You already own this bucket.
    #[error("Your previous request to create the named bucket succeeded and you already own it.")]
    BucketAlreadyOwnedByYou { bucket: String },

    /// The bucket you tried to delete is not empty.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// The bucket still has in-flight multipart uploads.  Deliberately a
    /// distinct code from `BucketNotEmpty` so operators can tell the two
    /// situations apart.
    #[error("The bucket you tried to delete has an ongoing multipart upload")]
    MpuInProgress { bucket: String },

    /// Access denied.
    #[error("Access Denied")]
    AccessDenied { message: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The request is semantically invalid.
    #[error("{message}")]
    InvalidRequest { message: String },

    /// The website redirect location target is invalid.
    #[error("The website redirect location must have a prefix of 'http://', 'https://' or '/'")]
    InvalidRedirectLocation,

    /// The request is not valid for the current state of the bucket.
    #[error("The request is not valid with the current state of the bucket")]
    InvalidBucketState { message: String },

    /// A request precondition did not hold.
    #[error("At least one of the pre-conditions you specified did not hold")]
    PreconditionFailed,

    /// The Content-MD5 you specified did not match what we received.
    #[error("The Content-MD5 you specified did not match what we received")]
    BadDigest,

    /// The Content-MD5 you specified is not valid.
    #[error("The Content-MD5 you specified is not valid")]
    InvalidDigest,

    /// Invalid part in multipart upload.
    #[error("{message}")]
    InvalidPart { message: String },

    /// Invalid part order in CompleteMultipartUpload.
    #[error("The list of parts was not in ascending order. Parts must be ordered by part number.")]
    InvalidPartOrder,

    /// Malformed XML in request body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// Malformed POST body (internal surfaces).
    #[error("The body of your POST request is not well-formed multipart/form-data.")]
    MalformedPOSTRequest,

    /// Internal-surface code for a missing target object.
    #[error("The object was not found")]
    ObjNotFound,

    /// Feature not implemented.
    #[error("{message}")]
    NotImplemented { message: String },

    /// HTTP method not allowed for this resource.
    #[error("The specified method is not allowed against this resource.")]
    MethodNotAllowed,

    /// Invalid range request.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// Not modified (304 response for conditional requests).
    #[error("Not Modified")]
    NotModified,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Wrap a backend failure as `InternalError`, interpolating the backend
    /// message into the cause text.  The original error is logged, never
    /// exposed in the response body.
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        S3Error::InternalError(anyhow::anyhow!("{context}: {err}"))
    }

    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchVersion { .. } => "NoSuchVersion",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            S3Error::BucketAlreadyOwnedByYou { .. } => "BucketAlreadyOwnedByYou",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::MpuInProgress { .. } => "MPUinProgress",
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::InvalidRequest { .. } => "InvalidRequest",
            S3Error::InvalidRedirectLocation => "InvalidRedirectLocation",
            S3Error::InvalidBucketState { .. } => "InvalidBucketState",
            S3Error::PreconditionFailed => "PreconditionFailed",
            S3Error::BadDigest => "BadDigest",
            S3Error::InvalidDigest => "InvalidDigest",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::MalformedPOSTRequest => "MalformedPOSTRequest",
            S3Error::ObjNotFound => "ObjNotFound",
            S3Error::NotImplemented { .. } => "NotImplemented",
            S3Error::MethodNotAllowed => "MethodNotAllowed",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::NotModified => "NotModified",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchKey { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchVersion { .. } => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::BucketAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::BucketAlreadyOwnedByYou { .. } => StatusCode::CONFLICT,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::MpuInProgress { .. } => StatusCode::CONFLICT,
            S3Error::AccessDenied { .. } => StatusCode::FORBIDDEN,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidRedirectLocation => StatusCode::BAD_REQUEST,
            S3Error::InvalidBucketState { .. } => StatusCode::CONFLICT,
            S3Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3Error::BadDigest => StatusCode::BAD_REQUEST,
            S3Error::InvalidDigest => StatusCode::BAD_REQUEST,
            S3Error::InvalidPart { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidPartOrder => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::MalformedPOSTRequest => StatusCode::BAD_REQUEST,
            S3Error::ObjNotFound => StatusCode::NOT_FOUND,
            S3Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            S3Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::NotModified => StatusCode::NOT_MODIFIED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        if let S3Error::InternalError(ref cause) = self {
            tracing::error!("internal error: {cause:#}");
        }

        // 304 Not Modified responses must not have a body.
        if matches!(self, S3Error::NotModified) {
            return (
                status,
                [
                    ("x-amz-request-id", request_id),
                    ("date", date),
                    ("server", "SpanStore".to_string()),
                ],
            )
                .into_response();
        }

        let body = render_error(self.code(), &self.to_string(), "", &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "SpanStore".to_string()),
            ],
            body,
        )
            .into_response()
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable_strings() {
        assert_eq!(
            S3Error::NoSuchBucket {
                bucket: "b".to_string()
            }
            .code(),
            "NoSuchBucket"
        );
        assert_eq!(
            S3Error::MpuInProgress {
                bucket: "b".to_string()
            }
            .code(),
            "MPUinProgress"
        );
        assert_eq!(S3Error::ObjNotFound.code(), "ObjNotFound");
        assert_eq!(S3Error::BadDigest.code(), "BadDigest");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            S3Error::MpuInProgress {
                bucket: "b".to_string()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            S3Error::InvalidBucketState {
                message: String::new()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            S3Error::PreconditionFailed.status_code(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            S3Error::NotImplemented {
                message: String::new()
            }
            .status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
    }

    #[test]
    fn test_internal_wraps_cause() {
        let err = S3Error::internal("AWS put_object", "connection reset");
        match err {
            S3Error::InternalError(cause) => {
                assert!(cause.to_string().contains("connection reset"));
            }
            other => panic!("expected InternalError, got {other:?}"),
        }
    }
}
