//! Redis-compatible store backend (Redis, Dragonfly, KeyDB).
//!
//! Scripts run server-side through `EVALSHA`, falling back to `EVAL` the
//! first time a script is unknown to the server, so every admission check is
//! a single atomic round trip.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::{debug, trace, warn};

use super::script::Script;
use super::AdmissionStore;
use crate::error::StoreResult;

/// Keys fetched per `SCAN` page when counting a namespace.
const SCAN_PAGE_SIZE: usize = 500;

/// Shared-store backend speaking the Redis protocol.
pub struct RedisStore {
    connection_manager: ConnectionManager,
    scripts: DashMap<&'static str, Arc<redis::Script>>,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client for admission control");
            e
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            e
        })?;

        let mut conn = connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        debug!(url = %url, "Connected to shared store");

        Ok(Self {
            connection_manager,
            scripts: DashMap::new(),
        })
    }

    fn prepared(&self, script: &Script) -> Arc<redis::Script> {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| Arc::new(redis::Script::new(script.lua())))
            .clone()
    }
}

#[async_trait]
impl AdmissionStore for RedisStore {
    async fn eval(&self, script: &Script, key: &str, args: &[String]) -> StoreResult<Vec<i64>> {
        let prepared = self.prepared(script);
        let mut invocation = prepared.key(key);
        for arg in args {
            invocation.arg(arg);
        }

        trace!(script = script.name(), key = %key, "Invoking store script");

        let mut conn = self.connection_manager.clone();
        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        Ok(reply)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection_manager.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut conn = self.connection_manager.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        // -2: no such key, -1: no expiry
        Ok((ttl >= 0).then_some(ttl as u64))
    }

    async fn count_keys(&self, prefix: &str) -> StoreResult<u64> {
        let mut conn = self.connection_manager.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut total: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE_SIZE)
                .query_async(&mut conn)
                .await?;
            total += keys.len() as u64;
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(total)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
