//! Axum router construction and S3 route mapping.
//!
//! S3 distinguishes operations by query parameters, not just
//! path+method; a single handler per method+path dispatches internally.
//! The internal backbeat surface is mounted under `/_/backbeat/` and the
//! deep backend healthcheck under `/_/healthcheck`.

use axum::{
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, head, post, put},
    Extension, Json, Router,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{generate_request_id, S3Error};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::{AppState, AuthContext};

/// Build the axum [`Router`] with all routes wired.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;
    let health_check_enabled = state.config.observability.health_check;

    let mut stateful = Router::new();

    if metrics_enabled {
        stateful = stateful.route("/metrics", get(metrics_handler));
    }
    if health_check_enabled {
        stateful = stateful
            .route("/healthz", get(healthz_handler))
            .route("/readyz", get(readyz_handler))
            .route("/_/healthcheck", get(deep_healthcheck_handler));
    }

    stateful = stateful
        // Internal replication surface.
        .route("/_/backbeat/data/:bucket/*key", put(handle_backbeat_data))
        .route(
            "/_/backbeat/metadata/:bucket/*key",
            put(handle_backbeat_metadata),
        )
        .route(
            "/_/backbeat/multiplebackenddata/:bucket/*key",
            put(handle_backbeat_multiple)
                .post(handle_backbeat_multiple)
                .delete(handle_backbeat_multiple),
        )
        // Bucket-level routes.
        .route("/:bucket", put(handle_put_bucket))
        .route("/:bucket", delete(handle_delete_bucket))
        .route("/:bucket", head(handle_head_bucket))
        .route("/:bucket", get(handle_get_bucket))
        .route("/:bucket", post(handle_post_bucket))
        // Object-level routes (wildcard key captures slashes).
        .route("/:bucket/*key", get(handle_get_object))
        .route("/:bucket/*key", put(handle_put_object))
        .route("/:bucket/*key", delete(handle_delete_object))
        .route("/:bucket/*key", head(handle_head_object))
        .route("/:bucket/*key", post(handle_post_object));

    let mut router = stateful
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    if metrics_enabled {
        router = router.layer(middleware::from_fn(metrics_middleware));
    }

    // S3 objects can be large; drop the default body cap.
    router.layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Adds the standard S3 response headers to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-amz-request-id") {
        let request_id = generate_request_id();
        headers.insert(
            "x-amz-request-id",
            HeaderValue::from_str(&request_id).expect("valid request id"),
        );
    }
    if !headers.contains_key("x-amz-id-2") {
        let random_bytes: [u8; 24] = rand::random();
        let id2 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, random_bytes);
        headers.insert("x-amz-id-2", HeaderValue::from_str(&id2).expect("valid id"));
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    headers.insert("date", HeaderValue::from_str(&date).expect("valid date"));
    headers.insert("server", HeaderValue::from_static("SpanStore"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass principal resolution.
const AUTH_SKIP_PATHS: &[&str] = &["/healthz", "/readyz", "/metrics", "/_/healthcheck"];

/// Pull the access key id out of an `Authorization` header: either the
/// SigV4 `Credential=AKID/...` form or the v2 `AWS AKID:sig` form.
fn extract_access_key(auth_header: &str) -> Option<String> {
    if let Some(idx) = auth_header.find("Credential=") {
        let rest = &auth_header[idx + "Credential=".len()..];
        let akid = rest.split('/').next()?;
        return Some(akid.to_string());
    }
    if let Some(rest) = auth_header.strip_prefix("AWS ") {
        let akid = rest.split(':').next()?;
        return Some(akid.to_string());
    }
    None
}

/// Resolve the request's principal from its access key.
///
/// Signature verification is an upstream concern; here the key only
/// selects the account, which downstream handlers use for ownership and
/// capability checks.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let path = req.uri().path();
    if AUTH_SKIP_PATHS.contains(&path) {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let Some(auth_header) = auth_header else {
        return Err(S3Error::AccessDenied {
            message: "No authentication information provided".to_string(),
        });
    };
    let Some(access_key) = extract_access_key(&auth_header) else {
        return Err(S3Error::AccessDenied {
            message: "Malformed authorization header".to_string(),
        });
    };

    let Some(account) = state
        .config
        .accounts
        .iter()
        .find(|a| a.access_key == access_key)
    else {
        debug!(access_key, "unknown access key");
        return Err(S3Error::AccessDenied {
            message: "Unknown access key".to_string(),
        });
    };

    req.extensions_mut().insert(AuthContext {
        access_key: account.access_key.clone(),
        canonical_id: account.canonical_id.clone(),
        display_name: account.display_name.clone(),
    });
    Ok(next.run(req).await)
}

// -- Health endpoints ---------------------------------------------------------

/// `GET /healthz` -- liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// `GET /readyz` -- readiness probe against the metadata plane.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.metadata.get_bucket("__readiness_probe__").await.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// `GET /_/healthcheck` -- aggregated backend healthcheck.
///
/// scality locations are probed individually; one random location per
/// cloud type (`aws_s3`, `azure`) is probed and reported under the
/// probed name; internal backends are synthesized OK.  503 when any
/// reported location is failing.
async fn deep_healthcheck_handler(State(state): State<Arc<AppState>>) -> Response {
    let results = state.data.gateway().healthcheck().await;
    let any_failing = results.values().any(|h| h.error.is_some());
    let status = if any_failing {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(serde_json::json!(results))).into_response()
}

// -- Query parsing ------------------------------------------------------------

/// Parse a raw query string into a map; bare parameters (`?acl`) map to
/// empty strings.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

// -- Backbeat dispatch ---------------------------------------------------------

async fn handle_backbeat_data(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    crate::backbeat::put_data(state, &bucket, &key, &headers, body, &auth).await
}

async fn handle_backbeat_metadata(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    crate::backbeat::put_metadata(state, &bucket, &key, &headers, &body, &auth).await
}

async fn handle_backbeat_multiple(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    method: Method,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    crate::backbeat::dispatch_multiple_backend(
        state, &method, &bucket, &key, &query, &headers, body, &auth,
    )
    .await
}

// -- Bucket-level dispatch ---------------------------------------------------

/// `PUT /:bucket` -- `?versioning` -> PutBucketVersioning, else
/// CreateBucket.
async fn handle_put_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("versioning") {
        crate::handlers::bucket::put_bucket_versioning(state, &bucket, &body, &auth).await
    } else {
        crate::handlers::bucket::create_bucket(state, &bucket, &headers, &body, &auth).await
    }
}

/// `GET /:bucket` -- `?versioning` -> GetBucketVersioning; listing is
/// served by the metadata plane, not this gateway.
async fn handle_get_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("versioning") {
        crate::handlers::bucket::get_bucket_versioning(state, &bucket).await
    } else {
        Err(S3Error::NotImplemented {
            message: "bucket listing is not served by this gateway".to_string(),
        })
    }
}

async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, S3Error> {
    crate::handlers::bucket::delete_bucket(state, &bucket, &auth).await
}

async fn handle_head_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    crate::handlers::bucket::head_bucket(state, &bucket).await
}

/// `POST /:bucket` -- `?delete` -> multi-object delete.
async fn handle_post_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("delete") {
        crate::handlers::object::delete_objects(state, &bucket, &body, &auth).await
    } else {
        Err(S3Error::NotImplemented {
            message: "unsupported bucket POST".to_string(),
        })
    }
}

// -- Object-level dispatch ---------------------------------------------------

/// `GET /:bucket/*key` -- `?tagging` -> GetObjectTagging, `?uploadId` ->
/// ListParts, else GetObject.
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("tagging") {
        crate::handlers::object::get_object_tagging(state, &bucket, &key, &query).await
    } else if query.contains_key("uploadId") {
        crate::handlers::multipart::list_parts(state, &bucket, &key, &query).await
    } else {
        crate::handlers::object::get_object(state, &bucket, &key, &query, &headers, &auth).await
    }
}

/// `PUT /:bucket/*key` -- dispatches on query params and the
/// copy-source header.
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("tagging") {
        crate::handlers::object::put_object_tagging(state, &bucket, &key, &query, &body).await
    } else if query.contains_key("partNumber") && query.contains_key("uploadId") {
        if headers.contains_key("x-amz-copy-source") {
            crate::handlers::multipart::upload_part_copy(
                state, &bucket, &key, &query, &headers, &auth,
            )
            .await
        } else {
            crate::handlers::multipart::upload_part(state, &bucket, &key, &query, body).await
        }
    } else if headers.contains_key("x-amz-copy-source") {
        crate::handlers::object::copy_object(state, &bucket, &key, &headers, &auth).await
    } else {
        crate::handlers::object::put_object(state, &bucket, &key, &headers, body, &auth).await
    }
}

/// `DELETE /:bucket/*key` -- `?tagging` -> DeleteObjectTagging,
/// `?uploadId` -> AbortMultipartUpload, else DeleteObject.
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("tagging") {
        crate::handlers::object::delete_object_tagging(state, &bucket, &key, &query).await
    } else if query.contains_key("uploadId") {
        crate::handlers::multipart::abort_multipart_upload(state, &bucket, &key, &query).await
    } else {
        crate::handlers::object::delete_object(state, &bucket, &key, &query, &auth).await
    }
}

async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    crate::handlers::object::head_object(state, &bucket, &key, &query, &headers, &auth).await
}

/// `POST /:bucket/*key` -- `?uploads` -> CreateMultipartUpload,
/// `?uploadId` -> CompleteMultipartUpload.
async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("uploads") {
        crate::handlers::multipart::create_multipart_upload(state, &bucket, &key, &headers, &auth)
            .await
    } else if query.contains_key("uploadId") {
        crate::handlers::multipart::complete_multipart_upload(
            state, &bucket, &key, &query, &body, &auth,
        )
        .await
    } else {
        Err(S3Error::NotImplemented {
            message: "unsupported object POST".to_string(),
        })
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_access_key_forms() {
        assert_eq!(
            extract_access_key(
                "AWS4-HMAC-SHA256 Credential=AKID123/20260101/us-east-1/s3/aws4_request, \
                 SignedHeaders=host, Signature=abc"
            )
            .as_deref(),
            Some("AKID123")
        );
        assert_eq!(
            extract_access_key("AWS AKID123:signature").as_deref(),
            Some("AKID123")
        );
        assert!(extract_access_key("Bearer token").is_none());
    }

    #[test]
    fn test_parse_query_bare_and_valued() {
        let map = parse_query(Some("versioning&uploadId=abc&partNumber=2".to_string()));
        assert_eq!(map.get("versioning").map(String::as_str), Some(""));
        assert_eq!(map.get("uploadId").map(String::as_str), Some("abc"));
        assert_eq!(map.get("partNumber").map(String::as_str), Some("2"));
    }
}
