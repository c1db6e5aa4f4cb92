//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FloodgateError, Result};
use crate::intercept::PolicySet;

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `FLOODGATE__STORE__URL`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Subsystem switches and key namespaces
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Shared store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-operation policies
    #[serde(default)]
    pub policies: PolicySet,
}

/// Admission subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Master switch; when off every call is admitted without a store call
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Namespace for rate-limit keys
    #[serde(default = "default_rate_limit_prefix")]
    pub rate_limit_prefix: String,

    /// Namespace for duplicate-submission locks
    #[serde(default = "default_duplicate_prefix")]
    pub duplicate_prefix: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            rate_limit_prefix: default_rate_limit_prefix(),
            duplicate_prefix: default_duplicate_prefix(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rate_limit_prefix() -> String {
    "rate:limit:".to_string()
}

fn default_duplicate_prefix() -> String {
    "duplicate:submit:".to_string()
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is not shared between instances
    #[default]
    Memory,
    /// Redis protocol (Redis, Dragonfly, KeyDB)
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Upper bound on a single store round trip, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

/// The `policies` section of a config file, with key case preserved.
fn policies_from_yaml(yaml: &str) -> Result<PolicySet> {
    #[derive(Deserialize)]
    struct Section {
        policies: Option<PolicySet>,
    }

    let section: Option<Section> = serde_yaml::from_str(yaml)
        .map_err(|e| FloodgateError::Config(format!("Failed to parse policies: {}", e)))?;
    Ok(section.and_then(|s| s.policies).unwrap_or_default())
}

impl FloodgateConfig {
    /// Load configuration from a YAML file, overridden by `FLOODGATE__*`
    /// environment variables.
    ///
    /// Policies are read from the file alone. The layered builder lowercases
    /// map keys, and operation names are matched case-sensitively.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission configuration");
        let raw = std::fs::read_to_string(path)?;

        let mut config = config::Config::builder()
            .add_source(config::File::from_str(&raw, config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<FloodgateConfig>()?;
        config.policies = policies_from_yaml(&raw)?;
        debug!(
            rate_limits = config.policies.rate_limits.len(),
            duplicates = config.policies.duplicates.len(),
            "Loaded admission policies"
        );

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every check misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.admission.rate_limit_prefix.is_empty() || self.admission.duplicate_prefix.is_empty() {
            return Err(FloodgateError::Config(
                "key prefixes must not be empty".to_string(),
            ));
        }
        if self.admission.rate_limit_prefix == self.admission.duplicate_prefix {
            return Err(FloodgateError::Config(
                "rate limit and duplicate prefixes must differ".to_string(),
            ));
        }
        if self.store.timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store.timeout_ms must be > 0".to_string(),
            ));
        }
        self.policies.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, Scope};

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert!(config.admission.enabled);
        assert_eq!(config.admission.rate_limit_prefix, "rate:limit:");
        assert_eq!(config.admission.duplicate_prefix, "duplicate:submit:");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
admission:
  enabled: true
  rate_limit_prefix: "rl:"
store:
  backend: redis
  url: redis://cache:6379
  timeout_ms: 100
policies:
  rate_limits:
    OrderController.create:
      algorithm: token_bucket
      scope: user
      capacity: 5
      refill_rate: 1.0
  duplicates:
    OrderController.create:
      lock_secs: 3
      include_args: true
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.admission.rate_limit_prefix, "rl:");
        assert_eq!(config.admission.duplicate_prefix, "duplicate:submit:");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.timeout_ms, 100);

        let policy = config.policies.rate_limit("OrderController.create").unwrap();
        assert_eq!(policy.algorithm, Some(Algorithm::TokenBucket));
        assert_eq!(policy.scope, Scope::User);
        assert_eq!(policy.capacity, 5);

        let lock = config.policies.duplicate("OrderController.create").unwrap();
        assert_eq!(lock.lock_secs, 3);
        assert!(lock.include_args);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let yaml = "store:\n  timeout_ms: 0\n";
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_policy() {
        let yaml = r#"
policies:
  rate_limits:
    Api.search:
      limit: 0
"#;
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_keeps_operation_case() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
        let yaml = r#"
admission:
  rate_limit_prefix: "rl:"
store:
  timeout_ms: 100
policies:
  rate_limits:
    OrderController.create:
      limit: 2
  duplicates:
    OrderController.create:
      lock_secs: 3
"#;
        std::fs::write(&path, yaml).unwrap();
        let loaded = FloodgateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.admission.rate_limit_prefix, "rl:");
        assert_eq!(config.store.timeout_ms, 100);
        assert_eq!(
            config.policies.rate_limit("OrderController.create").map(|p| p.limit),
            Some(2)
        );
        assert_eq!(
            config.policies.duplicate("OrderController.create").map(|p| p.lock_secs),
            Some(3)
        );
        assert!(config.policies.rate_limit("ordercontroller.create").is_none());
    }

    #[test]
    fn test_from_file_without_policies() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "store:\n  backend: redis\n").unwrap();
        let loaded = FloodgateConfig::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_from_file_missing_path_is_error() {
        assert!(FloodgateConfig::from_file("/nonexistent/floodgate.yaml").is_err());
    }
}
