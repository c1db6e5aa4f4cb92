//! Shared key-value store contract.
//!
//! All admission state lives in the store and is addressed only by key. The
//! engine never keeps counters of its own; correctness rests on each
//! [`Script`] running atomically against a single key.

mod memory;
mod redis_store;
pub mod script;
#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

pub use memory::{MemoryStore, Slot};
pub use redis_store::RedisStore;
pub use script::{Script, ScriptArgs};

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, StoreError, StoreResult};

/// Trait for shared store implementations.
///
/// This trait abstracts over the in-process [`MemoryStore`] and the networked
/// [`RedisStore`] so strategies and the duplicate guard work with either.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Run `script` atomically against `key` and return its integer reply.
    async fn eval(&self, script: &Script, key: &str, args: &[String]) -> StoreResult<Vec<i64>>;

    /// Delete `key`. Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remaining TTL of `key` in seconds; `None` when absent or persistent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Number of live keys starting with `prefix`. Best effort.
    async fn count_keys(&self, prefix: &str) -> StoreResult<u64>;

    /// Short backend name for diagnostics.
    fn backend(&self) -> &'static str;
}

/// Await a store call for at most `limit`; a timeout becomes [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(StoreError::Timeout(limit.as_millis() as u64)))
}

/// Build the store selected by `config`.
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn AdmissionStore>> {
    let store: Arc<dyn AdmissionStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(clock)),
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.url).await?),
    };
    info!(backend = store.backend(), "Admission store ready");
    Ok(store)
}
