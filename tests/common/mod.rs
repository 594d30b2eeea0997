//! Shared helpers for the integration tests: a fully wired in-memory
//! gateway plus request plumbing through the axum router.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use std::sync::Arc;
use tower::ServiceExt;

use spanstore::config::Config;
use spanstore::data::DataWrapper;
use spanstore::gateway::MultiBackendGateway;
use spanstore::kms::MemoryKeyManager;
use spanstore::location::LocationRegistry;
use spanstore::metadata::memory::MemoryMetadataStore;
use spanstore::AppState;

pub const ALICE_KEY: &str = "AKIDALICE";
pub const BOB_KEY: &str = "AKIDBOB";
pub const REPL_KEY: &str = "AKIDREPL";

pub const ALICE_ID: &str = "alice-canonical-id";

const CONFIG_YAML: &str = r#"
server:
  host: 127.0.0.1
  port: 8000
accounts:
  - access_key: AKIDALICE
    canonical_id: alice-canonical-id
    display_name: alice
  - access_key: AKIDBOB
    canonical_id: bob-canonical-id
    display_name: bob
  - access_key: AKIDREPL
    canonical_id: replication-canonical-id
    display_name: replication
replication:
  service_access_key: AKIDREPL
backends:
  data: multiple
  default_location: mem-main
location_constraints:
  mem-main:
    type: mem
  mem-extra:
    type: mem
  replica-target:
    type: mem
    details:
      bucket_name: replica-bucket
  azure-repl:
    type: azure
    details:
      bucket_name: replica-bucket
      azure_storage_account_name: devacct
      azure_storage_access_key: MDEyMzQ1Njc4OWFiY2RlZg==
logging:
  level: error
"#;

/// Build a fresh, fully wired application state over in-memory stores.
pub async fn test_state() -> Arc<AppState> {
    let config: Config = serde_yaml::from_str(CONFIG_YAML).expect("test config parses");
    let registry = LocationRegistry::from_config(&config)
        .await
        .expect("registry builds");
    let gateway = Arc::new(MultiBackendGateway::new(Arc::new(registry)));
    let kms = Arc::new(MemoryKeyManager::new());
    let data = Arc::new(DataWrapper::new(gateway, kms));
    let metadata = Arc::new(MemoryMetadataStore::new());

    Arc::new(AppState {
        config,
        metadata,
        data,
    })
}

/// Fresh router over a fresh state.
pub async fn test_app() -> Router {
    spanstore::server::app(test_state().await)
}

/// An Authorization header for `access_key` (signature checking is
/// upstream; only the credential matters here).
pub fn auth_header(access_key: &str) -> String {
    format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/20260801/us-east-1/s3/aws4_request, \
         SignedHeaders=host, Signature=fixture"
    )
}

/// Send one request through the router, returning status, headers, and
/// body.
pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    access_key: &str,
    headers: &[(&str, &str)],
    body: impl Into<Bytes>,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", auth_header(access_key));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Body::from(body.into()))
        .expect("request builds");

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request completes");
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    (status, headers, body)
}

/// Create a bucket owned by `access_key`.
pub async fn create_bucket(app: &Router, bucket: &str, access_key: &str) {
    let (status, _, _) = send(app, "PUT", &format!("/{bucket}"), access_key, &[], "").await;
    assert_eq!(status, StatusCode::OK, "bucket create failed");
}

/// Enable or suspend versioning.
pub async fn set_versioning(app: &Router, bucket: &str, access_key: &str, status_str: &str) {
    let body = format!(
        "<VersioningConfiguration><Status>{status_str}</Status></VersioningConfiguration>"
    );
    let (status, _, _) = send(
        app,
        "PUT",
        &format!("/{bucket}?versioning"),
        access_key,
        &[],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "versioning update failed");
}

/// Extract the `<Code>` of an S3 error body.
pub fn error_code(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.split("<Code>")
        .nth(1)
        .and_then(|s| s.split("</Code>").next())
        .unwrap_or_default()
        .to_string()
}
