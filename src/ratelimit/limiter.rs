//! Rate limiter engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::context::{AdmissionContext, AdmissionResult};
use super::registry::StrategyRegistry;
use crate::error::Result;
use crate::store::{bounded, AdmissionStore};

/// Default bound on a single store round trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// The rate limiter engine.
///
/// Holds no mutable state of its own and can be shared freely across tasks
/// and instances; every decision is one atomic script in the shared store.
///
/// Misconfigured contexts fail closed with [`FloodgateError::Config`]. Store
/// failures and timeouts fail open: the request is allowed and a warning is
/// logged.
///
/// [`FloodgateError::Config`]: crate::error::FloodgateError::Config
pub struct RateLimiter {
    store: Arc<dyn AdmissionStore>,
    registry: Arc<StrategyRegistry>,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a rate limiter with the standard strategies and default timeout.
    pub fn new(store: Arc<dyn AdmissionStore>) -> Self {
        Self::with_registry(store, Arc::new(StrategyRegistry::standard()), DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_registry(
        store: Arc<dyn AdmissionStore>,
        registry: Arc<StrategyRegistry>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            store_timeout,
        }
    }

    /// Check and consume a permit for `ctx`.
    pub async fn check(&self, ctx: &AdmissionContext) -> Result<AdmissionResult> {
        ctx.validate()?;
        let strategy = self.registry.resolve(Some(ctx.algorithm))?;

        trace!(
            key = %ctx.key,
            algorithm = %ctx.algorithm,
            scope = %ctx.scope,
            now = ctx.now,
            "Checking rate limit"
        );

        match bounded(self.store_timeout, strategy.execute(self.store.as_ref(), ctx)).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(
                    key = %ctx.key,
                    algorithm = %ctx.algorithm,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                Ok(AdmissionResult::fail_open(&ctx.key))
            }
        }
    }

    /// Convenience wrapper around [`check`](Self::check).
    pub async fn is_allowed(&self, ctx: &AdmissionContext) -> Result<bool> {
        Ok(self.check(ctx).await?.allowed)
    }

    /// Delete the state behind `key`. Clearing an absent key is a no-op.
    pub async fn clear(&self, key: &str) -> Result<()> {
        let removed = bounded(self.store_timeout, self.store.delete(key)).await?;
        debug!(key = %key, removed = removed, "Cleared rate limit state");
        Ok(())
    }

    /// Approximate permits left for `ctx`. Does not consume anything.
    ///
    /// Falls back to the full allowance when the store cannot be read.
    pub async fn remaining(&self, ctx: &AdmissionContext) -> Result<u64> {
        ctx.validate()?;
        let strategy = self.registry.resolve(Some(ctx.algorithm))?;

        match bounded(self.store_timeout, strategy.remaining(self.store.as_ref(), ctx)).await {
            Ok(remaining) => Ok(remaining),
            Err(e) => {
                warn!(key = %ctx.key, error = %e, "Could not read remaining quota");
                Ok(ctx.permits())
            }
        }
    }

    /// Seconds until `key` expires, derived from its TTL.
    ///
    /// `None` when the key is absent, has no expiry, or the store is unreachable.
    pub async fn reset_time(&self, key: &str) -> Option<u64> {
        match bounded(self.store_timeout, self.store.ttl(key)).await {
            Ok(ttl) => ttl,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not read rate limit reset time");
                None
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn AdmissionStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.registry
    }
}
