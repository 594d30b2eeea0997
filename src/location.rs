//! Location registry and constraint resolution.
//!
//! At process start the `location_constraints` config table is turned
//! into one backend client per location.  The registry is built once;
//! there is no runtime mutation.
//!
//! A pseudo-entry named `legacy` serves data records that predate
//! `dataStoreName`: bare backend keys with no location attached.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::backend::aws::AwsBackend;
use crate::backend::azure::AzureBackend;
use crate::backend::file::FileBackend;
use crate::backend::gcp::GcpBackend;
use crate::backend::memory::MemoryBackend;
use crate::backend::scality::ScalityBackend;
use crate::backend::{BackendClient, BackendType};
use crate::config::{Config, LocationConfig};
use crate::errors::S3Error;

/// Name of the pseudo-location serving pre-`dataStoreName` records.
pub const LEGACY_LOCATION: &str = "legacy";

/// Header that overrides the bucket's location constraint per request.
pub const LOCATION_HEADER: &str = "x-amz-meta-scal-location-constraint";

/// One backend client per configured location.
pub struct LocationRegistry {
    clients: HashMap<String, Arc<dyn BackendClient>>,
    configs: HashMap<String, LocationConfig>,
    default_location: String,
}

impl LocationRegistry {
    /// Instantiate every configured location's client.
    ///
    /// With `backends.data` set to `mem` or `file`, a single location is
    /// synthesized under the default name; `multiple` reads the whole
    /// constraint table.  A `cdmi` entry is recognised as a type tag but
    /// has no client variant, so configuring one fails here.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut clients: HashMap<String, Arc<dyn BackendClient>> = HashMap::new();
        let mut configs: HashMap<String, LocationConfig> = HashMap::new();
        let default_location = config.backends.default_location.clone();

        match config.backends.data.as_str() {
            "mem" => {
                clients.insert(default_location.clone(), Arc::new(MemoryBackend::new()));
            }
            "file" => {
                let root = format!("./data/{default_location}");
                clients.insert(default_location.clone(), Arc::new(FileBackend::new(root)?));
            }
            "multiple" => {
                for (name, location) in &config.location_constraints {
                    let client: Arc<dyn BackendClient> = match location.backend_type {
                        BackendType::Mem => Arc::new(MemoryBackend::new()),
                        BackendType::File => {
                            let root = location
                                .details
                                .root_dir
                                .clone()
                                .unwrap_or_else(|| format!("./data/{name}"));
                            Arc::new(FileBackend::new(root)?)
                        }
                        BackendType::Scality => {
                            let endpoint = location.details.endpoint.clone().ok_or_else(|| {
                                anyhow::anyhow!("scality location {name} has no endpoint")
                            })?;
                            Arc::new(ScalityBackend::new(endpoint)?)
                        }
                        BackendType::AwsS3 => {
                            Arc::new(AwsBackend::new(name, &location.details).await?)
                        }
                        BackendType::Azure => Arc::new(AzureBackend::new(name, &location.details)?),
                        BackendType::Gcp => Arc::new(GcpBackend::new(name, &location.details)?),
                        BackendType::Cdmi => {
                            anyhow::bail!("location {name}: cdmi has no client variant")
                        }
                    };
                    clients.insert(name.clone(), client);
                    configs.insert(name.clone(), location.clone());
                }
            }
            other => anyhow::bail!("unknown backends.data mode: {other}"),
        }

        // Records that predate `dataStoreName` carry bare keys; route them
        // to the default location's client unless `legacy` is configured
        // explicitly.
        if !clients.contains_key(LEGACY_LOCATION) {
            if let Some(default_client) = clients.get(&default_location).cloned() {
                clients.insert(LEGACY_LOCATION.to_string(), default_client);
            } else {
                clients.insert(LEGACY_LOCATION.to_string(), Arc::new(MemoryBackend::new()));
            }
        }

        info!(
            locations = clients.len(),
            default = %default_location,
            "location registry built"
        );

        Ok(Self {
            clients,
            configs,
            default_location,
        })
    }

    /// Build a registry directly from instantiated clients (test seam).
    pub fn from_clients(
        clients: HashMap<String, Arc<dyn BackendClient>>,
        configs: HashMap<String, LocationConfig>,
        default_location: String,
    ) -> Self {
        Self {
            clients,
            configs,
            default_location,
        }
    }

    pub fn client(&self, name: &str) -> Option<Arc<dyn BackendClient>> {
        self.clients.get(name).cloned()
    }

    pub fn config(&self, name: &str) -> Option<&LocationConfig> {
        self.configs.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn default_location(&self) -> &str {
        &self.default_location
    }

    /// All registered location names with their clients.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn BackendClient>)> {
        self.clients.iter()
    }
}

/// Decide the controlling location constraint for a request.
///
/// The per-request header override wins when present *and* registered;
/// otherwise the bucket's configured location; otherwise the global
/// default.  An unregistered finally-selected constraint fails with
/// `InvalidArgument`.
pub fn resolve_location(
    header_override: Option<&str>,
    bucket_location: Option<&str>,
    registry: &LocationRegistry,
) -> Result<String, S3Error> {
    let chosen = header_override
        .filter(|name| registry.is_registered(name))
        .or(bucket_location)
        .unwrap_or(registry.default_location());

    if !registry.is_registered(chosen) {
        return Err(S3Error::InvalidArgument {
            message: format!("unknown location constraint: {chosen}"),
        });
    }
    Ok(chosen.to_string())
}

// ── Tests ───────────────────────────────────────────────────────────
