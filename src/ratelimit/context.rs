//! Admission context and result value objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::token_bucket::MAX_STATE_TTL_SECS;
use crate::error::{FloodgateError, Result};

/// Admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    #[default]
    SlidingWindow,
    TokenBucket,
}

impl Algorithm {
    pub const ALL: [Algorithm; 3] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Algorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == normalized)
            .ok_or_else(|| FloodgateError::Config(format!("unknown algorithm '{}'", s)))
    }
}

/// The dimension a limit's key is partitioned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Shared by all callers of one operation
    #[default]
    Api,
    /// Per resolved caller identity
    User,
    /// Per client address
    Ip,
    /// One key for everything under the policy
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Api => "api",
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::Global => "global",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a single admission check.
///
/// Built fresh per check and never mutated. `now` is captured from the
/// caller's clock when the context is created.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionContext {
    pub key: String,
    pub algorithm: Algorithm,
    pub scope: Scope,
    /// Window length in seconds (fixed and sliding window)
    pub window_secs: u64,
    /// Permits per window (fixed and sliding window)
    pub limit: u64,
    /// Bucket size (token bucket)
    pub capacity: u64,
    /// Tokens added per second (token bucket)
    pub refill_rate: f64,
    pub message: String,
    pub now: u64,
}

impl AdmissionContext {
    /// Check the parameters the selected algorithm depends on.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(FloodgateError::Config("admission key must not be empty".to_string()));
        }
        match self.algorithm {
            Algorithm::FixedWindow | Algorithm::SlidingWindow => {
                if self.window_secs == 0 {
                    return Err(self.invalid("window_secs must be > 0"));
                }
                if self.limit == 0 {
                    return Err(self.invalid("limit must be > 0"));
                }
            }
            Algorithm::TokenBucket => {
                if self.capacity == 0 {
                    return Err(self.invalid("capacity must be > 0"));
                }
                if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
                    return Err(self.invalid("refill_rate must be a positive number"));
                }
                if 2.0 * self.capacity as f64 / self.refill_rate > MAX_STATE_TTL_SECS as f64 {
                    return Err(self.invalid("refill_rate is too slow to refill the bucket"));
                }
            }
        }
        Ok(())
    }

    /// The permit ceiling reported in results.
    pub fn permits(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.capacity,
            _ => self.limit,
        }
    }

    fn invalid(&self, reason: &str) -> FloodgateError {
        FloodgateError::Config(format!("{} policy for '{}': {}", self.algorithm, self.key, reason))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionResult {
    pub allowed: bool,
    /// Seconds until a permit may be available; only set when denied
    pub retry_after: Option<u64>,
    pub current_count: Option<u64>,
    pub limit_count: Option<u64>,
    pub key: String,
}

impl AdmissionResult {
    pub fn allowed(key: &str, current_count: u64, limit_count: u64) -> Self {
        Self {
            allowed: true,
            retry_after: None,
            current_count: Some(current_count),
            limit_count: Some(limit_count),
            key: key.to_string(),
        }
    }

    pub fn denied(key: &str, retry_after: u64, current_count: u64, limit_count: u64) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            current_count: Some(current_count),
            limit_count: Some(limit_count),
            key: key.to_string(),
        }
    }

    /// An allow issued because the store could not be consulted.
    pub fn fail_open(key: &str) -> Self {
        Self {
            allowed: true,
            retry_after: None,
            current_count: None,
            limit_count: None,
            key: key.to_string(),
        }
    }
}
