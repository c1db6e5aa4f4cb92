//! Call interception.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::policy::{DuplicatePolicy, PolicySet, RateLimitPolicy};
use crate::clock::Clock;
use crate::config::FloodgateConfig;
use crate::duplicate::DuplicateGuard;
use crate::error::{FloodgateError, Result};
use crate::keys::{CallIdentity, KeyBuilder};
use crate::ratelimit::{AdmissionResult, RateLimiter, StrategyRegistry};
use crate::store::AdmissionStore;

/// What [`Interceptor::admit`] did for a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Outcome of the rate limit, when one applied
    pub rate_limit: Option<AdmissionResult>,
    /// Duplicate lock taken for the call, if any
    pub lock_key: Option<String>,
    release_on_failure: bool,
}

/// Applies the configured policies to guarded calls.
///
/// Denials surface as [`FloodgateError::Denied`]. Store trouble never blocks
/// a call; see [`RateLimiter`] and [`DuplicateGuard`].
pub struct Interceptor {
    limiter: RateLimiter,
    guard: DuplicateGuard,
    keys: KeyBuilder,
    clock: Arc<dyn Clock>,
    enabled: bool,
    policies: RwLock<Arc<PolicySet>>,
}

impl Interceptor {
    pub fn new(config: &FloodgateConfig, store: Arc<dyn AdmissionStore>, clock: Arc<dyn Clock>) -> Self {
        let timeout = config.store.timeout();
        info!(
            enabled = config.admission.enabled,
            backend = store.backend(),
            rate_limits = config.policies.rate_limits.len(),
            duplicates = config.policies.duplicates.len(),
            "Admission interceptor initialized"
        );
        Self {
            limiter: RateLimiter::with_registry(store.clone(), Arc::new(StrategyRegistry::standard()), timeout),
            guard: DuplicateGuard::new(store, timeout),
            keys: KeyBuilder::from_config(&config.admission),
            clock,
            enabled: config.admission.enabled,
            policies: RwLock::new(Arc::new(config.policies.clone())),
        }
    }

    /// Replace the active policies. In-flight calls keep the set they started with.
    pub fn set_policies(&self, policies: PolicySet) -> Result<()> {
        policies.validate()?;
        info!(
            rate_limits = policies.rate_limits.len(),
            duplicates = policies.duplicates.len(),
            "Admission policies replaced"
        );
        *self.policies.write() = Arc::new(policies);
        Ok(())
    }

    pub fn policies(&self) -> Arc<PolicySet> {
        self.policies.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn guard(&self) -> &DuplicateGuard {
        &self.guard
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Apply `policy` to `call`. `Ok(None)` when the check was skipped.
    pub async fn check_rate_limit(
        &self,
        call: &CallIdentity,
        policy: &RateLimitPolicy,
    ) -> Result<Option<AdmissionResult>> {
        if !self.enabled || !policy.enabled {
            trace!(operation = %call, "Rate limit skipped");
            return Ok(None);
        }

        let key = self
            .keys
            .rate_limit_key(call, policy.scope, policy.key_template.as_deref());
        let ctx = policy.context(key, self.clock.now_secs());
        let result = self.limiter.check(&ctx).await?;

        if result.allowed {
            Ok(Some(result))
        } else {
            debug!(
                operation = %call,
                key = %result.key,
                retry_after = ?result.retry_after,
                "Call rejected by rate limit"
            );
            Err(FloodgateError::Denied {
                message: policy.message.clone(),
                retry_after: result.retry_after,
            })
        }
    }

    /// Take the duplicate lock for `call`. Returns the lock key, or `None`
    /// when the check was skipped.
    pub async fn check_duplicate(&self, call: &CallIdentity, policy: &DuplicatePolicy) -> Result<Option<String>> {
        if !self.enabled || !policy.enabled {
            trace!(operation = %call, "Duplicate check skipped");
            return Ok(None);
        }

        let key = self
            .keys
            .duplicate_key(call, policy.key_template.as_deref(), policy.include_args);
        if self.guard.check_and_lock(&key, policy.lock_secs).await? {
            Ok(Some(key))
        } else {
            debug!(operation = %call, key = %key, "Call rejected as duplicate");
            Err(FloodgateError::Denied {
                message: policy.message.clone(),
                retry_after: None,
            })
        }
    }

    /// Apply every policy declared for `call`'s operation.
    ///
    /// The rate limit runs first so a throttled call never takes a lock.
    pub async fn admit(&self, call: &CallIdentity) -> Result<Admission> {
        let mut admission = Admission::default();
        if !self.enabled {
            return Ok(admission);
        }

        let policies = self.policies();
        let operation = call.operation();

        if let Some(policy) = policies.rate_limit(&operation) {
            admission.rate_limit = self.check_rate_limit(call, policy).await?;
        }
        if let Some(policy) = policies.duplicate(&operation) {
            admission.lock_key = self.check_duplicate(call, policy).await?;
            admission.release_on_failure = policy.release_on_failure;
        }
        Ok(admission)
    }

    /// Admit `call`, then run `f`.
    ///
    /// If `f` fails and the duplicate policy asks for it, the lock is dropped
    /// so the caller can retry straight away.
    pub async fn invoke<T, E, F>(&self, call: &CallIdentity, f: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<FloodgateError>,
    {
        let admission = self.admit(call).await?;
        let outcome = f.await;

        if outcome.is_err() && admission.release_on_failure {
            if let Some(key) = &admission.lock_key {
                debug!(operation = %call, key = %key, "Guarded call failed, releasing lock");
                self.guard.release(key).await;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::ClientInfo;
    use crate::ratelimit::{Algorithm, Scope};
    use crate::store::testing::FailingStore;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn create_test_policies() -> PolicySet {
        PolicySet::new()
            .with_rate_limit(
                "OrderController.create",
                RateLimitPolicy {
                    algorithm: Some(Algorithm::FixedWindow),
                    scope: Scope::User,
                    window_secs: 10,
                    limit: 2,
                    ..RateLimitPolicy::default()
                },
            )
            .with_duplicate(
                "OrderController.create",
                DuplicatePolicy {
                    lock_secs: 5,
                    include_args: true,
                    ..DuplicatePolicy::default()
                },
            )
    }

    fn create_test_interceptor() -> (Arc<ManualClock>, Interceptor) {
        let clock = Arc::new(ManualClock::new(1_000));
        let config = FloodgateConfig {
            policies: create_test_policies(),
            ..FloodgateConfig::default()
        };
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let interceptor = Interceptor::new(&config, store, clock.clone());
        (clock, interceptor)
    }

    fn order(user: &str, id: u64) -> CallIdentity {
        CallIdentity::new("OrderController", "create")
            .with_principal(user)
            .with_arg("order", json!({ "id": id }))
    }

    #[tokio::test]
    async fn test_admit_applies_both_policies() {
        let (_clock, interceptor) = create_test_interceptor();

        let admission = interceptor.admit(&order("alice", 1)).await.unwrap();
        assert!(admission.rate_limit.as_ref().unwrap().allowed);
        let lock_key = admission.lock_key.unwrap();
        assert!(lock_key.starts_with("duplicate:submit:alice:OrderController.create:"));

        let err = interceptor.admit(&order("alice", 1)).await.unwrap_err();
        assert!(err.is_denied());
        assert_eq!(err.to_string(), "Admission denied: Duplicate submission, please do not resubmit");
    }

    #[tokio::test]
    async fn test_rate_limit_denial_carries_retry_hint() {
        let (clock, interceptor) = create_test_interceptor();

        interceptor.admit(&order("alice", 1)).await.unwrap();
        interceptor.admit(&order("alice", 2)).await.unwrap();

        clock.advance(3);
        let err = interceptor.admit(&order("alice", 3)).await.unwrap_err();
        assert!(err.is_denied());
        assert_eq!(err.retry_after(), Some(7));

        // Other users have their own budget.
        assert!(interceptor.admit(&order("bob", 3)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unguarded_operation_passes() {
        let (_clock, interceptor) = create_test_interceptor();
        let call = CallIdentity::new("Health", "ping");

        for _ in 0..10 {
            let admission = interceptor.admit(&call).await.unwrap();
            assert_eq!(admission, Admission::default());
        }
    }

    #[tokio::test]
    async fn test_disabled_subsystem_skips_store() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(FailingStore::default());
        let mut config = FloodgateConfig {
            policies: create_test_policies(),
            ..FloodgateConfig::default()
        };
        config.admission.enabled = false;
        let interceptor = Interceptor::new(&config, store.clone(), clock);

        interceptor.admit(&order("alice", 1)).await.unwrap();
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_policy_is_skipped() {
        let (_clock, interceptor) = create_test_interceptor();
        let policy = RateLimitPolicy {
            limit: 1,
            enabled: false,
            ..RateLimitPolicy::default()
        };
        let call = order("alice", 1);

        for _ in 0..3 {
            assert_eq!(interceptor.check_rate_limit(&call, &policy).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_ip_scope_uses_forwarded_address() {
        let (_clock, interceptor) = create_test_interceptor();
        let policy = RateLimitPolicy {
            scope: Scope::Ip,
            limit: 1,
            ..RateLimitPolicy::default()
        };
        let from = |ip: &str| {
            CallIdentity::new("Search", "query")
                .with_client(ClientInfo::default().with_header("X-Forwarded-For", ip))
        };

        let result = interceptor
            .check_rate_limit(&from("203.0.113.1"), &policy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.key, "rate:limit:ip:203.0.113.1:Search.query");
        assert!(interceptor.check_rate_limit(&from("203.0.113.1"), &policy).await.is_err());
        assert!(interceptor.check_rate_limit(&from("203.0.113.2"), &policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_invoke_releases_lock_on_failure() {
        let (_clock, interceptor) = create_test_interceptor();
        let mut policies = create_test_policies();
        policies.rate_limits.clear();
        interceptor.set_policies(policies).unwrap();
        let call = order("carol", 9);

        let failed: std::result::Result<(), FloodgateError> = interceptor
            .invoke(&call, async { Err(FloodgateError::Config("downstream".to_string())) })
            .await;
        assert!(matches!(failed, Err(FloodgateError::Config(_))));

        // The lock was dropped, so an immediate retry is admitted.
        let value = interceptor.invoke(&call, async { Ok::<_, FloodgateError>(7) }).await;
        assert_eq!(value.unwrap(), 7);

        // A successful call keeps its lock.
        let again = interceptor.invoke(&call, async { Ok::<_, FloodgateError>(8) }).await;
        assert_eq!(
            again.unwrap_err().to_string(),
            "Admission denied: Duplicate submission, please do not resubmit"
        );
    }

    #[tokio::test]
    async fn test_invoke_keeps_lock_when_release_disabled() {
        let (_clock, interceptor) = create_test_interceptor();
        let mut policies = create_test_policies();
        policies
            .duplicates
            .get_mut("OrderController.create")
            .unwrap()
            .release_on_failure = false;
        interceptor.set_policies(policies).unwrap();

        let call = order("dave", 1);
        let _ = interceptor
            .invoke(&call, async { Err::<(), _>(FloodgateError::Config("boom".to_string())) })
            .await;
        let retry = interceptor.invoke(&call, async { Ok::<_, FloodgateError>(()) }).await;
        assert!(retry.unwrap_err().is_denied());
    }

    #[tokio::test]
    async fn test_set_policies_swaps_and_validates() {
        let (_clock, interceptor) = create_test_interceptor();

        interceptor.set_policies(PolicySet::new()).unwrap();
        assert!(interceptor.policies().is_empty());
        for id in 0..5 {
            assert!(interceptor.admit(&order("alice", id)).await.is_ok());
        }

        let invalid = PolicySet::new().with_rate_limit(
            "Search.query",
            RateLimitPolicy {
                window_secs: 0,
                ..RateLimitPolicy::default()
            },
        );
        assert!(matches!(interceptor.set_policies(invalid), Err(FloodgateError::Config(_))));
        assert!(interceptor.policies().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_admits_calls() {
        let clock = Arc::new(ManualClock::new(0));
        let config = FloodgateConfig {
            policies: create_test_policies(),
            ..FloodgateConfig::default()
        };
        let interceptor = Interceptor::new(&config, Arc::new(FailingStore::default()), clock);

        for _ in 0..5 {
            let admission = interceptor.admit(&order("alice", 1)).await.unwrap();
            assert!(admission.lock_key.is_some());
        }
    }
}
