//! Store doubles for failure-injection tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{AdmissionStore, Script};
use crate::error::{StoreError, StoreResult};

/// Fails every call as if the connection had dropped.
#[derive(Default)]
pub struct FailingStore {
    pub calls: AtomicUsize,
}

impl FailingStore {
    fn fail<T>(&self, what: &'static str) -> StoreResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Script {
            script: what,
            reason: "connection reset by peer".to_string(),
        })
    }
}

#[async_trait]
impl AdmissionStore for FailingStore {
    async fn eval(&self, script: &Script, _key: &str, _args: &[String]) -> StoreResult<Vec<i64>> {
        self.fail(script.name())
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        self.fail("delete")
    }

    async fn ttl(&self, _key: &str) -> StoreResult<Option<u64>> {
        self.fail("ttl")
    }

    async fn count_keys(&self, _prefix: &str) -> StoreResult<u64> {
        self.fail("count_keys")
    }

    fn backend(&self) -> &'static str {
        "failing"
    }
}

/// Never answers.
pub struct HangingStore;

#[async_trait]
impl AdmissionStore for HangingStore {
    async fn eval(&self, _script: &Script, _key: &str, _args: &[String]) -> StoreResult<Vec<i64>> {
        futures::future::pending().await
    }

    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        futures::future::pending().await
    }

    async fn ttl(&self, _key: &str) -> StoreResult<Option<u64>> {
        futures::future::pending().await
    }

    async fn count_keys(&self, _prefix: &str) -> StoreResult<u64> {
        futures::future::pending().await
    }

    fn backend(&self) -> &'static str {
        "hanging"
    }
}
