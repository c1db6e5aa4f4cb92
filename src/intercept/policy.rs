//! Declarative admission policies.
//!
//! Policies are keyed by operation name (`Declaring.method`) and loaded from
//! YAML, either standalone or as the `policies` section of the main config:
//!
//! ```yaml
//! rate_limits:
//!   OrderController.create:
//!     algorithm: token_bucket
//!     scope: user
//!     capacity: 5
//!     refill_rate: 1.0
//! duplicates:
//!   OrderController.create:
//!     lock_secs: 3
//!     include_args: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{AdmissionContext, Algorithm, Scope};

/// A rate limit attached to one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Unset selects the default (sliding window)
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// Rendered against the call's arguments and appended to the key
    #[serde(default)]
    pub key_template: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_message")]
    pub message: String,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            algorithm: None,
            scope: Scope::default(),
            window_secs: default_window_secs(),
            limit: default_limit(),
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            key_template: None,
            enabled: default_enabled(),
            message: default_rate_limit_message(),
        }
    }
}

impl RateLimitPolicy {
    /// The admission context for one check against `key` at `now`.
    pub fn context(&self, key: String, now: u64) -> AdmissionContext {
        AdmissionContext {
            key,
            algorithm: self.algorithm.unwrap_or_default(),
            scope: self.scope,
            window_secs: self.window_secs,
            limit: self.limit,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            message: self.message.clone(),
            now,
        }
    }
}

/// A duplicate-submission lock attached to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatePolicy {
    #[serde(default)]
    pub key_template: Option<String>,
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,
    /// Fold a digest of the argument values into the key
    #[serde(default)]
    pub include_args: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_duplicate_message")]
    pub message: String,
    /// Drop the lock when the guarded call fails so a retry is not rejected
    #[serde(default = "default_enabled")]
    pub release_on_failure: bool,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            key_template: None,
            lock_secs: default_lock_secs(),
            include_args: false,
            enabled: default_enabled(),
            message: default_duplicate_message(),
            release_on_failure: default_enabled(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_limit() -> u64 {
    100
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_rate() -> f64 {
    10.0
}

fn default_lock_secs() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

fn default_rate_limit_message() -> String {
    "Too many requests, please try again later".to_string()
}

fn default_duplicate_message() -> String {
    "Duplicate submission, please do not resubmit".to_string()
}

/// All policies, by operation name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitPolicy>,
    #[serde(default)]
    pub duplicates: HashMap<String, DuplicatePolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policies: PolicySet = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse policies: {}", e)))?;
        policies.validate()?;
        Ok(policies)
    }

    pub fn with_rate_limit(mut self, operation: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.rate_limits.insert(operation.into(), policy);
        self
    }

    pub fn with_duplicate(mut self, operation: impl Into<String>, policy: DuplicatePolicy) -> Self {
        self.duplicates.insert(operation.into(), policy);
        self
    }

    pub fn rate_limit(&self, operation: &str) -> Option<&RateLimitPolicy> {
        self.rate_limits.get(operation)
    }

    pub fn duplicate(&self, operation: &str) -> Option<&DuplicatePolicy> {
        self.duplicates.get(operation)
    }

    pub fn is_empty(&self) -> bool {
        self.rate_limits.is_empty() && self.duplicates.is_empty()
    }

    /// Reject policies that could never be checked.
    pub fn validate(&self) -> Result<()> {
        for (operation, policy) in &self.rate_limits {
            policy.context(operation.clone(), 0).validate()?;
        }
        for (operation, policy) in &self.duplicates {
            if policy.lock_secs == 0 {
                return Err(FloodgateError::Config(format!(
                    "duplicate policy for '{}': lock_secs must be > 0",
                    operation
                )));
            }
        }
        Ok(())
    }
}
