//! SpanStore library — S3-compatible multi-backend data gateway.
//!
//! This crate routes every object operation to a configured backend
//! location (in-memory, file tree, scality data daemon, AWS S3, Azure
//! Blob, GCP Cloud Storage) and exposes the internal "backbeat" surface
//! that replication workers use to write replicas out of band.

use std::sync::Arc;

pub mod backbeat;
pub mod backend;
pub mod config;
pub mod data;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod kms;
pub mod location;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod xml;

use crate::config::Config;
use crate::data::DataWrapper;
use crate::metadata::store::MetadataStore;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata-plane collaborator.
    pub metadata: Arc<dyn MetadataStore>,
    /// Top-level data dispatcher (gateway + cipher pipe + retries).
    pub data: Arc<DataWrapper>,
}

/// The authenticated principal attached to each request.
///
/// Signature verification happens upstream; the access key only selects
/// the canonical owner id here.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub access_key: String,
    pub canonical_id: String,
    pub display_name: String,
}

impl AuthContext {
    /// Whether this principal is the configured replication service
    /// account (the `objectReplicate` capability).
    pub fn can_replicate(&self, config: &Config) -> bool {
        self.access_key == config.replication.service_access_key
    }
}
