//! Lock-with-expiry guard against repeated submissions.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FloodgateError, Result, StoreResult};
use crate::store::script::reply_at;
use crate::store::{bounded, AdmissionStore, Script, ScriptArgs, Slot};

const LOCK_LUA: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
  return {1}
end
return {0}
"#;

/// Value stored under a held lock.
const LOCK_SENTINEL: &str = "1";

/// ARGV: value, seconds. Reply: acquired.
fn lock(slot: &mut Slot<'_>, args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    let value = args.text(0)?;
    let secs = args.int(1)?.max(1) as u64;
    Ok(vec![slot.set_if_absent(value, secs) as i64])
}

static LOCK: Script = Script::new("duplicate_lock", LOCK_LUA, lock);

#[cfg(test)]
pub(crate) fn scripts() -> [&'static Script; 1] {
    [&LOCK]
}

/// Acquires short-lived locks so an identical submission is rejected while
/// the first one is still in its lock window.
///
/// The lock and its TTL are created in one atomic step, so a lock can never
/// be left behind without an expiry.
pub struct DuplicateGuard {
    store: Arc<dyn AdmissionStore>,
    store_timeout: Duration,
}

impl DuplicateGuard {
    pub fn new(store: Arc<dyn AdmissionStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Try to take the lock at `key` for `lock_secs`.
    ///
    /// Returns `true` when the lock was acquired and `false` when it is
    /// already held. If the store cannot be reached the call is let through.
    pub async fn check_and_lock(&self, key: &str, lock_secs: u64) -> Result<bool> {
        if key.is_empty() {
            return Err(FloodgateError::Config("lock key must not be empty".to_string()));
        }
        if lock_secs == 0 {
            return Err(FloodgateError::Config(format!(
                "lock duration for '{}' must be > 0",
                key
            )));
        }

        let args = [LOCK_SENTINEL.to_string(), lock_secs.to_string()];
        let acquired = bounded(self.store_timeout, async {
            let reply = self.store.eval(&LOCK, key, &args).await?;
            reply_at(&LOCK, &reply, 0)
        })
        .await;

        match acquired {
            Ok(1) => {
                debug!(key = %key, lock_secs = lock_secs, "Submission lock acquired");
                Ok(true)
            }
            Ok(_) => {
                debug!(key = %key, "Duplicate submission rejected");
                Ok(false)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lock store unavailable, allowing submission");
                Ok(true)
            }
        }
    }

    /// Drop the lock at `key`, e.g. after the guarded call failed.
    pub async fn release(&self, key: &str) {
        match bounded(self.store_timeout, self.store.delete(key)).await {
            Ok(removed) => debug!(key = %key, removed = removed, "Submission lock released"),
            Err(e) => warn!(key = %key, error = %e, "Failed to release submission lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::{FailingStore, HangingStore};
    use crate::store::MemoryStore;
    use futures::future::join_all;

    const KEY: &str = "duplicate:submit:alice:Orders.create";

    fn create_test_guard() -> (Arc<ManualClock>, Arc<MemoryStore>, DuplicateGuard) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let guard = DuplicateGuard::new(store.clone(), Duration::from_millis(250));
        (clock, store, guard)
    }

    #[tokio::test]
    async fn test_lock_once_per_window() {
        let (clock, store, guard) = create_test_guard();

        assert!(guard.check_and_lock(KEY, 5).await.unwrap());
        assert_eq!(store.ttl(KEY).await.unwrap(), Some(5));

        clock.advance(4);
        assert!(!guard.check_and_lock(KEY, 5).await.unwrap());
        // A rejected attempt does not extend the lock.
        assert_eq!(store.ttl(KEY).await.unwrap(), Some(1));

        clock.advance(1);
        assert!(guard.check_and_lock(KEY, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_lock() {
        let (_clock, _store, guard) = create_test_guard();

        assert!(guard.check_and_lock(KEY, 60).await.unwrap());
        guard.release(KEY).await;
        assert!(guard.check_and_lock(KEY, 60).await.unwrap());

        // Releasing an absent lock is harmless.
        guard.release("duplicate:submit:nobody:Orders.create").await;
    }

    #[tokio::test]
    async fn test_concurrent_racers_get_one_lock() {
        let (_clock, _store, guard) = create_test_guard();
        let guard = Arc::new(guard);

        let racers = (0..16).map(|_| {
            let guard = guard.clone();
            tokio::spawn(async move { guard.check_and_lock(KEY, 5).await.unwrap() })
        });
        let winners = join_all(racers)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_config_errors() {
        let (_clock, _store, guard) = create_test_guard();

        assert!(matches!(
            guard.check_and_lock(KEY, 0).await,
            Err(FloodgateError::Config(_))
        ));
        assert!(matches!(
            guard.check_and_lock("", 5).await,
            Err(FloodgateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let failing = DuplicateGuard::new(Arc::new(FailingStore::default()), Duration::from_millis(250));
        assert!(failing.check_and_lock(KEY, 5).await.unwrap());
        assert!(failing.check_and_lock(KEY, 5).await.unwrap());
        failing.release(KEY).await;

        let hanging = DuplicateGuard::new(Arc::new(HangingStore), Duration::from_millis(30));
        assert!(hanging.check_and_lock(KEY, 5).await.unwrap());
        hanging.release(KEY).await;
    }
}
