//! Configuration loading and types for SpanStore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The heart of it is the `location_constraints`
//! table: one entry per data backend, each naming a backend type and the
//! backend-specific connection details.  Per-location credentials can be
//! overridden through environment variables so that secrets stay out of
//! the config file.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Backend type tags, one per backend-client variant.
///
/// `Cdmi` is a recognised tag for pre-existing data records but has no
/// client variant; configuring a location with it fails at registry build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    Mem,
    File,
    Scality,
    AwsS3,
    Azure,
    Gcp,
    Cdmi,
}

impl BackendType {
    /// The wire tag stored in data-retrieval records (`dataStoreType`).
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Mem => "mem",
            BackendType::File => "file",
            BackendType::Scality => "scality",
            BackendType::AwsS3 => "aws_s3",
            BackendType::Azure => "azure",
            BackendType::Gcp => "gcp",
            BackendType::Cdmi => "cdmi",
        }
    }

    /// Parse a wire tag back into a type.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mem" => Some(BackendType::Mem),
            "file" => Some(BackendType::File),
            "scality" => Some(BackendType::Scality),
            "aws_s3" => Some(BackendType::AwsS3),
            "azure" => Some(BackendType::Azure),
            "gcp" => Some(BackendType::Gcp),
            "cdmi" => Some(BackendType::Cdmi),
            _ => None,
        }
    }

    /// Whether data for this type lives outside the process/deployment and
    /// the remote store overwrites keys in place.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            BackendType::AwsS3 | BackendType::Azure | BackendType::Gcp
        )
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Principal resolution (access key -> canonical id).
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Replication service-account settings for the backbeat surface.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Which data placement mode the process runs in.
    #[serde(default)]
    pub backends: BackendsConfig,

    /// The location-constraint table: name -> backend description.
    #[serde(default)]
    pub location_constraints: BTreeMap<String, LocationConfig>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// AWS region to present (e.g. `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// One account the gateway can attribute requests to.
///
/// Signature verification happens upstream; here the access key only
/// selects the canonical owner id.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub access_key: String,
    pub canonical_id: String,
    #[serde(default)]
    pub display_name: String,
}

/// Replication service-account settings.
///
/// Only the named access key may call the internal backbeat routes (the
/// `objectReplicate` capability).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_access_key")]
    pub service_access_key: String,
}

/// Data placement mode.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    /// `mem`, `file`, or `multiple`.
    #[serde(default = "default_data_backend")]
    pub data: String,

    /// Fallback location when a request resolves to none.
    #[serde(default = "default_location_name")]
    pub default_location: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            data: default_data_backend(),
            default_location: default_location_name(),
        }
    }
}

/// One configured location constraint.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    /// Backend type for this location.
    #[serde(rename = "type")]
    pub backend_type: BackendType,

    /// Backend-specific connection details.
    #[serde(default)]
    pub details: LocationDetails,
}

/// Backend-specific connection details for a location.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocationDetails {
    /// Remote bucket / container name (cloud backends).
    #[serde(default)]
    pub bucket_name: String,

    /// One-to-one (`true`) vs. many-to-one (`false`) mapping between S3
    /// buckets and the remote bucket.  Fixed for the life of a location.
    #[serde(default)]
    pub bucket_match: bool,

    /// Remote region (aws_s3).
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint: S3-compatible endpoint, Azure blob endpoint, or
    /// the scality data-daemon base URL.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Force path-style addressing (aws_s3).
    #[serde(default)]
    pub path_style: bool,

    /// Explicit credentials (aws_s3); fall back to env / credential chain.
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Azure storage account name.
    #[serde(default)]
    pub azure_storage_account_name: Option<String>,
    /// Azure storage account key (base64).
    #[serde(default)]
    pub azure_storage_access_key: Option<String>,

    /// Path to a GCP credential JSON file.
    #[serde(default)]
    pub gcp_credentials_file: Option<String>,

    /// Root directory for `file` locations.
    #[serde(default)]
    pub root_dir: Option<String>,
}

impl LocationDetails {
    /// Apply per-location environment overrides.
    ///
    /// `{LOCATION}_AZURE_STORAGE_ACCOUNT_NAME`, `{LOCATION}_AZURE_STORAGE_ACCESS_KEY`,
    /// `{LOCATION}_AWS_ACCESS_KEY_ID`, `{LOCATION}_AWS_SECRET_ACCESS_KEY`, and the
    /// global `GCP_CRED` take precedence over config-file values.  The location
    /// name is uppercased and dashes become underscores.
    pub fn apply_env_overrides(&mut self, location: &str) {
        let prefix = location.to_uppercase().replace('-', "_");

        if let Ok(v) = std::env::var(format!("{prefix}_AZURE_STORAGE_ACCOUNT_NAME")) {
            self.azure_storage_account_name = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AZURE_STORAGE_ACCESS_KEY")) {
            self.azure_storage_access_key = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AWS_ACCESS_KEY_ID")) {
            self.access_key = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_AWS_SECRET_ACCESS_KEY")) {
            self.secret_key = Some(v);
        }
        if let Ok(v) = std::env::var("GCP_CRED") {
            self.gcp_credentials_file = Some(v);
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable `/healthz`, `/readyz`, and the deep backend healthcheck.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_data_backend() -> String {
    "multiple".to_string()
}

fn default_location_name() -> String {
    "us-east-1".to_string()
}

fn default_replication_access_key() -> String {
    "replication-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`, then apply
/// per-location environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config: Config = serde_yaml::from_str(&contents)?;
    for (name, location) in config.location_constraints.iter_mut() {
        location.details.apply_env_overrides(name);
    }
    Ok(config)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_config() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.backends.data, "multiple");
        assert_eq!(config.backends.default_location, "us-east-1");
        assert!(config.location_constraints.is_empty());
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_location_constraints_parse() {
        let yaml = r#"
location_constraints:
  us-east-1:
    type: file
    details:
      root_dir: /tmp/data
  aws-east:
    type: aws_s3
    details:
      bucket_name: remote-bucket
      bucket_match: true
      region: us-east-1
  azure-west:
    type: azure
    details:
      bucket_name: remote-container
      azure_storage_account_name: myaccount
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.location_constraints.len(), 3);

        let aws = &config.location_constraints["aws-east"];
        assert_eq!(aws.backend_type, BackendType::AwsS3);
        assert!(aws.details.bucket_match);
        assert_eq!(aws.details.bucket_name, "remote-bucket");

        let azure = &config.location_constraints["azure-west"];
        assert_eq!(azure.backend_type, BackendType::Azure);
        assert!(!azure.details.bucket_match);
    }

    #[test]
    fn test_backend_type_wire_tags() {
        assert_eq!(BackendType::AwsS3.as_str(), "aws_s3");
        assert_eq!(BackendType::parse("azure"), Some(BackendType::Azure));
        assert_eq!(BackendType::parse("bogus"), None);
        assert!(BackendType::Gcp.is_external());
        assert!(!BackendType::File.is_external());
        assert!(!BackendType::Scality.is_external());
    }

    #[test]
    fn test_env_override_applies() {
        std::env::set_var("AZ_TEST_LOC_AZURE_STORAGE_ACCOUNT_NAME", "envaccount");
        let mut details = LocationDetails::default();
        details.apply_env_overrides("az-test-loc");
        assert_eq!(
            details.azure_storage_account_name.as_deref(),
            Some("envaccount")
        );
        std::env::remove_var("AZ_TEST_LOC_AZURE_STORAGE_ACCOUNT_NAME");
    }
}
