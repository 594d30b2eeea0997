//! The backbeat replication surface end to end: header contract,
//! location coherence, full and metadata-only replica writes, and the
//! multipart fragment operations.

mod common;

use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use common::*;
use md5::{Digest, Md5};

use spanstore::backend::DataLocation;
use spanstore::config::BackendType;
use spanstore::metadata::store::ObjectMetadata;

fn content_md5(body: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(body);
    BASE64_STANDARD.encode(hasher.finalize())
}

fn replica_metadata(bucket: &str, key: &str, version_id: &str, locations: Vec<DataLocation>) -> ObjectMetadata {
    ObjectMetadata {
        bucket: bucket.to_string(),
        key: key.to_string(),
        version_id: Some(version_id.to_string()),
        is_delete_marker: false,
        size: locations.iter().map(|l| l.size).sum(),
        etag: "\"0123456789abcdef0123456789abcdef\"".to_string(),
        content_type: "application/octet-stream".to_string(),
        content_encoding: None,
        cache_control: None,
        content_disposition: None,
        expires: None,
        website_redirect_location: None,
        user_metadata: Default::default(),
        tags: Vec::new(),
        owner_canonical_id: ALICE_ID.to_string(),
        acl: "private".to_string(),
        last_modified: "2026-08-01T00:00:00.000Z".to_string(),
        locations,
        replication_status: None,
    }
}

// ── multiplebackenddata: header contract & coherence ────────────────

#[tokio::test]
async fn test_putobject_replica_returns_supplied_version_id() {
    let app = test_app().await;
    let body = b"replica bytes";

    let md5 = content_md5(body);
    let (status, _, response) = send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/replica-bucket/doc?operation=putobject",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
            ("x-scal-version-id", "source-v42"),
            ("x-scal-canonical-id", ALICE_ID),
            ("content-md5", md5.as_str()),
        ],
        &body[..],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(json["versionId"], "source-v42");
}

#[tokio::test]
async fn test_putobject_requires_version_and_digest_headers() {
    let app = test_app().await;
    let md5 = content_md5(b"x");

    // Missing x-scal-version-id.
    let (status, _, body) = send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/replica-bucket/doc?operation=putobject",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
            ("x-scal-canonical-id", ALICE_ID),
            ("content-md5", md5.as_str()),
        ],
        "x",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidRequest");

    // Missing content-md5.
    let (status, _, body) = send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/replica-bucket/doc?operation=putobject",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
            ("x-scal-version-id", "v1"),
            ("x-scal-canonical-id", ALICE_ID),
        ],
        "x",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidRequest");
}

#[tokio::test]
async fn test_mismatched_storage_type_is_invalid_request() {
    let app = test_app().await;

    // azure-repl is an azure location; advertising aws_s3 must be pinned
    // down before any data moves.
    let (status, _, body) = send(
        &app,
        "POST",
        "/_/backbeat/multiplebackenddata/replica-bucket/doc?operation=initiatempu",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "aws_s3"),
            ("x-scal-storage-class", "azure-repl"),
            ("x-scal-version-id", "v1"),
        ],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidRequest");
}

#[tokio::test]
async fn test_bucket_mismatch_is_invalid_request() {
    let app = test_app().await;
    let md5 = content_md5(b"x");

    // replica-target is pinned to replica-bucket.
    let (status, _, body) = send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/other-bucket/doc?operation=putobject",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
            ("x-scal-version-id", "v1"),
            ("x-scal-canonical-id", ALICE_ID),
            ("content-md5", md5.as_str()),
        ],
        "x",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidRequest");
}

#[tokio::test]
async fn test_backbeat_requires_replication_principal() {
    let app = test_app().await;
    let md5 = content_md5(b"x");

    let (status, _, body) = send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/replica-bucket/doc?operation=putobject",
        ALICE_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
            ("x-scal-version-id", "v1"),
            ("x-scal-canonical-id", ALICE_ID),
            ("content-md5", md5.as_str()),
        ],
        "x",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "AccessDenied");
}

// ── Internal data / metadata routes ─────────────────────────────────

#[tokio::test]
async fn test_data_route_requires_versioned_bucket() {
    let app = test_app().await;
    create_bucket(&app, "flat", ALICE_KEY).await;

    let body = b"data";
    let md5 = content_md5(body);
    let (status, _, response) = send(
        &app,
        "PUT",
        "/_/backbeat/data/flat/doc",
        REPL_KEY,
        &[("content-md5", md5.as_str())],
        &body[..],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_code(&response), "InvalidBucketState");
}

#[tokio::test]
async fn test_full_replica_flow_preserves_source_version_id() {
    let app = test_app().await;
    create_bucket(&app, "dst", ALICE_KEY).await;
    set_versioning(&app, "dst", ALICE_KEY, "Enabled").await;

    // Step 1: raw data through the data route.
    let body = b"replicated content";
    let md5 = content_md5(body);
    let (status, _, response) = send(
        &app,
        "PUT",
        "/_/backbeat/data/dst/doc",
        REPL_KEY,
        &[("content-md5", md5.as_str())],
        &body[..],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let locations_json: serde_json::Value = serde_json::from_slice(&response).unwrap();
    let key = locations_json[0]["key"].as_str().unwrap().to_string();
    let data_store_name = locations_json[0]["dataStoreName"].as_str().unwrap().to_string();
    assert_eq!(data_store_name, "mem-main");

    // Step 2: object metadata carrying the source version id.
    let mut location = DataLocation::new(key, &data_store_name, BackendType::Mem, body.len() as u64);
    location.data_store_etag = Some("\"ignored\"".to_string());
    let metadata = replica_metadata("dst", "doc", "source-v7", vec![location]);
    let (status, _, response) = send(
        &app,
        "PUT",
        "/_/backbeat/metadata/dst/doc",
        REPL_KEY,
        &[],
        serde_json::to_vec(&metadata).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(json["versionId"], "source-v7");

    // The replica is externally visible under the supplied version id,
    // marked REPLICA.
    let (status, headers, content) = send(&app, "GET", "/dst/doc", ALICE_KEY, &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&content[..], body);
    assert_eq!(headers.get("x-amz-version-id").unwrap(), "source-v7");
    assert_eq!(headers.get("x-amz-replication-status").unwrap(), "REPLICA");
}

#[tokio::test]
async fn test_metadata_only_requires_existing_target() {
    let app = test_app().await;
    create_bucket(&app, "dst2", ALICE_KEY).await;
    set_versioning(&app, "dst2", ALICE_KEY, "Enabled").await;

    let metadata = replica_metadata("dst2", "ghost", "v-missing", Vec::new());
    let (status, _, body) = send(
        &app,
        "PUT",
        "/_/backbeat/metadata/dst2/ghost",
        REPL_KEY,
        &[("x-scal-replication-content", "METADATA")],
        serde_json::to_vec(&metadata).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "ObjNotFound");
}

#[tokio::test]
async fn test_metadata_only_preserves_location_records() {
    let app = test_app().await;
    create_bucket(&app, "dst3", ALICE_KEY).await;
    set_versioning(&app, "dst3", ALICE_KEY, "Enabled").await;

    // Seed a full replica.
    let body = b"original bytes";
    let md5 = content_md5(body);
    let (_, _, response) = send(
        &app,
        "PUT",
        "/_/backbeat/data/dst3/doc",
        REPL_KEY,
        &[("content-md5", md5.as_str())],
        &body[..],
    )
    .await;
    let locations_json: serde_json::Value = serde_json::from_slice(&response).unwrap();
    let location = DataLocation::new(
        locations_json[0]["key"].as_str().unwrap().to_string(),
        locations_json[0]["dataStoreName"].as_str().unwrap(),
        BackendType::Mem,
        body.len() as u64,
    );
    let seed = replica_metadata("dst3", "doc", "v-1", vec![location]);
    send(
        &app,
        "PUT",
        "/_/backbeat/metadata/dst3/doc",
        REPL_KEY,
        &[],
        serde_json::to_vec(&seed).unwrap(),
    )
    .await;

    // Metadata-only update names a bogus location; the physical record
    // must be preserved from the existing version.
    let mut update = replica_metadata(
        "dst3",
        "doc",
        "v-1",
        vec![DataLocation::new(
            "bogus-key".to_string(),
            "mem-main",
            BackendType::Mem,
            0,
        )],
    );
    update
        .user_metadata
        .insert("x-amz-meta-note".to_string(), "updated".to_string());
    let (status, _, _) = send(
        &app,
        "PUT",
        "/_/backbeat/metadata/dst3/doc",
        REPL_KEY,
        &[("x-scal-replication-content", "METADATA")],
        serde_json::to_vec(&update).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Everything except the location record was overwritten.
    let (status, headers, content) = send(&app, "GET", "/dst3/doc", ALICE_KEY, &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&content[..], body);
    assert_eq!(headers.get("x-amz-meta-note").unwrap(), "updated");
}

// ── Replica MPU fragments ───────────────────────────────────────────

#[tokio::test]
async fn test_replica_mpu_fragment_flow() {
    let app = test_app().await;
    let coherence = [
        ("x-scal-storage-type", "mem"),
        ("x-scal-storage-class", "replica-target"),
    ];

    // initiatempu
    let (status, _, body) = send(
        &app,
        "POST",
        "/_/backbeat/multiplebackenddata/replica-bucket/big?operation=initiatempu",
        REPL_KEY,
        &[coherence[0], coherence[1], ("x-scal-version-id", "v-mpu")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let upload_id = json["uploadId"].as_str().unwrap().to_string();
    assert!(!upload_id.is_empty());

    // putpart x2
    let mut etags = Vec::new();
    for (n, chunk) in [(1u32, "first "), (2u32, "second")] {
        let part_number = n.to_string();
        let (status, _, body) = send(
            &app,
            "PUT",
            "/_/backbeat/multiplebackenddata/replica-bucket/big?operation=putpart",
            REPL_KEY,
            &[
                coherence[0],
                coherence[1],
                ("x-scal-part-number", part_number.as_str()),
                ("x-scal-upload-id", upload_id.as_str()),
            ],
            chunk,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["partNumber"], n);
        etags.push(json["ETag"].as_str().unwrap().to_string());
    }

    // completempu
    let parts = serde_json::json!([
        { "PartNumber": 1, "ETag": etags[0], "Size": 6 },
        { "PartNumber": 2, "ETag": etags[1], "Size": 6 },
    ]);
    let (status, _, body) = send(
        &app,
        "POST",
        "/_/backbeat/multiplebackenddata/replica-bucket/big?operation=completempu",
        REPL_KEY,
        &[
            coherence[0],
            coherence[1],
            ("x-scal-upload-id", upload_id.as_str()),
        ],
        serde_json::to_vec(&parts).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, serde_json::json!({}));

    // A malformed completion body is a POST-format error, not XML.
    let (status, _, body) = send(
        &app,
        "POST",
        "/_/backbeat/multiplebackenddata/replica-bucket/big?operation=completempu",
        REPL_KEY,
        &[
            coherence[0],
            coherence[1],
            ("x-scal-upload-id", upload_id.as_str()),
        ],
        "not json",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "MalformedPOSTRequest");
}

#[tokio::test]
async fn test_replica_delete_object() {
    let app = test_app().await;
    let body = b"short lived";
    let md5 = content_md5(body);

    send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/replica-bucket/victim?operation=putobject",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
            ("x-scal-version-id", "v1"),
            ("x-scal-canonical-id", ALICE_ID),
            ("content-md5", md5.as_str()),
        ],
        &body[..],
    )
    .await;

    let (status, _, response) = send(
        &app,
        "DELETE",
        "/_/backbeat/multiplebackenddata/replica-bucket/victim?operation=deleteobject",
        REPL_KEY,
        &[
            ("x-scal-storage-type", "mem"),
            ("x-scal-storage-class", "replica-target"),
        ],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&response).unwrap();
    assert_eq!(json, serde_json::json!({}));
}

#[tokio::test]
async fn test_unknown_operation_is_invalid_request() {
    let app = test_app().await;
    let (status, _, body) = send(
        &app,
        "PUT",
        "/_/backbeat/multiplebackenddata/replica-bucket/doc?operation=frobnicate",
        REPL_KEY,
        &[],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&body), "InvalidRequest");
}
