//! Read-only status report for operators.

use serde::Serialize;
use tracing::warn;

use crate::config::FloodgateConfig;
use crate::store::{bounded, AdmissionStore};

/// Live key count for one namespace, or why it could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCount {
    Live(u64),
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceStatus {
    pub prefix: String,
    pub keys: KeyCount,
}

/// Snapshot of the admission subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsystemStatus {
    pub enabled: bool,
    pub backend: String,
    pub rate_limits: NamespaceStatus,
    pub duplicates: NamespaceStatus,
    pub rate_limit_policies: usize,
    pub duplicate_policies: usize,
}

/// Gather a status report. Store failures are reported, never raised.
pub async fn status(config: &FloodgateConfig, store: &dyn AdmissionStore) -> SubsystemStatus {
    let timeout = config.store.timeout();
    let count = move |prefix: String| async move {
        let keys = match bounded(timeout, store.count_keys(&prefix)).await {
            Ok(n) => KeyCount::Live(n),
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Could not count admission keys");
                KeyCount::Unavailable(e.to_string())
            }
        };
        NamespaceStatus { prefix, keys }
    };

    SubsystemStatus {
        enabled: config.admission.enabled,
        backend: store.backend().to_string(),
        rate_limits: count(config.admission.rate_limit_prefix.clone()).await,
        duplicates: count(config.admission.duplicate_prefix.clone()).await,
        rate_limit_policies: config.policies.rate_limits.len(),
        duplicate_policies: config.policies.duplicates.len(),
    }
}
