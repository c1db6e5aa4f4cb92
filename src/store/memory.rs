//! In-process store for development, tests and single-instance deployments.
//!
//! Keys live in a [`DashMap`]; a script runs while holding the key's shard
//! lock, so scripts on the same key are serialised exactly like server-side
//! scripts on Redis. Expiry is lazy and driven by the injected [`Clock`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::script::Script;
use super::AdmissionStore;
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

/// A stored value.
#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Text(String),
    /// Members ordered by `(score, member)`.
    SortedSet(Vec<(f64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// A locked view of one key, handed to native scripts.
///
/// Operations mirror the Redis commands the Lua renditions use. Removing the
/// last member of a sorted set deletes the key, as Redis does.
pub struct Slot<'a> {
    key: &'a str,
    entry: &'a mut Option<Entry>,
    now: u64,
}

impl<'a> Slot<'a> {
    /// Current store time in seconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn exists(&self) -> bool {
        self.entry.is_some()
    }

    /// Remaining TTL in seconds, or `None` when absent or persistent.
    pub fn ttl(&self) -> Option<u64> {
        self.entry
            .as_ref()
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_sub(self.now))
    }

    /// Set a TTL on the key. No-op when the key is absent.
    pub fn expire(&mut self, secs: u64) {
        let now = self.now;
        if let Some(entry) = self.entry.as_mut() {
            entry.expires_at = Some(now + secs);
        }
    }

    pub fn delete(&mut self) {
        *self.entry = None;
    }

    /// `GET` for integer counters.
    pub fn counter(&self) -> StoreResult<Option<i64>> {
        match self.entry.as_ref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Counter(n)) => Ok(Some(*n)),
            Some(Value::Text(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| self.wrong_type()),
            Some(_) => Err(self.wrong_type()),
        }
    }

    /// `INCR`. Creates the counter at 1 without a TTL when absent.
    pub fn incr(&mut self) -> StoreResult<i64> {
        let next = self.counter()?.unwrap_or(0) + 1;
        match self.entry.as_mut() {
            Some(entry) => entry.value = Value::Counter(next),
            None => *self.entry = Some(Entry::new(Value::Counter(next))),
        }
        Ok(next)
    }

    /// `SET key value NX EX secs`. Returns `true` when the key was created.
    pub fn set_if_absent(&mut self, value: &str, secs: u64) -> bool {
        if self.entry.is_some() {
            return false;
        }
        *self.entry = Some(Entry {
            value: Value::Text(value.to_string()),
            expires_at: Some(self.now + secs),
        });
        true
    }

    /// `ZREMRANGEBYSCORE key -inf max`. Returns the number removed.
    pub fn zremrange_upto(&mut self, max: f64) -> StoreResult<usize> {
        let removed = match self.zset_mut_existing()? {
            Some(set) => {
                let before = set.len();
                set.retain(|(score, _)| *score > max);
                before - set.len()
            }
            None => 0,
        };
        if self.zcard()? == 0 {
            self.delete();
        }
        Ok(removed)
    }

    /// `ZCARD`.
    pub fn zcard(&self) -> StoreResult<usize> {
        Ok(self.zset()?.map_or(0, |set| set.len()))
    }

    /// `ZCOUNT key (min +inf`.
    pub fn zcount_above(&self, min: f64) -> StoreResult<usize> {
        Ok(self
            .zset()?
            .map_or(0, |set| set.iter().filter(|(score, _)| *score > min).count()))
    }

    /// `ZADD key score member`, creating the set when absent.
    pub fn zadd(&mut self, score: f64, member: String) -> StoreResult<()> {
        if self.entry.is_none() {
            *self.entry = Some(Entry::new(Value::SortedSet(Vec::new())));
        }
        let key = self.key;
        let set = self
            .zset_mut_existing()?
            .ok_or_else(|| StoreError::WrongType(key.to_string()))?;
        set.retain(|(_, m)| *m != member);
        let at = set
            .iter()
            .position(|(s, m)| (*s, m.as_str()) > (score, member.as_str()))
            .unwrap_or(set.len());
        set.insert(at, (score, member));
        Ok(())
    }

    /// Score of the lowest-ranked member (`ZRANGE key 0 0 WITHSCORES`).
    pub fn zfirst_score(&self) -> StoreResult<Option<f64>> {
        Ok(self.zset()?.and_then(|set| set.first().map(|(s, _)| *s)))
    }

    /// `HGET`.
    pub fn hget(&self, field: &str) -> StoreResult<Option<&str>> {
        match self.entry.as_ref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(map.get(field).map(String::as_str)),
            Some(_) => Err(self.wrong_type()),
        }
    }

    /// `HSET`, creating the hash when absent.
    pub fn hset(&mut self, field: &str, value: String) -> StoreResult<()> {
        if self.entry.is_none() {
            *self.entry = Some(Entry::new(Value::Hash(HashMap::new())));
        }
        let key = self.key;
        match self.entry.as_mut().map(|e| &mut e.value) {
            Some(Value::Hash(map)) => {
                map.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn zset(&self) -> StoreResult<Option<&Vec<(f64, String)>>> {
        match self.entry.as_ref().map(|e| &e.value) {
            None => Ok(None),
            Some(Value::SortedSet(set)) => Ok(Some(set)),
            Some(_) => Err(self.wrong_type()),
        }
    }

    fn zset_mut_existing(&mut self) -> StoreResult<Option<&mut Vec<(f64, String)>>> {
        let key = self.key;
        match self.entry.as_mut().map(|e| &mut e.value) {
            None => Ok(None),
            Some(Value::SortedSet(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn wrong_type(&self) -> StoreError {
        StoreError::WrongType(self.key.to_string())
    }
}

/// In-memory [`AdmissionStore`].
pub struct MemoryStore {
    entries: DashMap<String, Option<Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired key. Expiry is otherwise lazy.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.as_ref().is_some_and(|e| !e.is_expired(now)));
        let purged = before.saturating_sub(self.entries.len());
        debug!(purged = purged, "Purged expired admission keys");
        purged
    }

    fn live<'e>(entry: &'e Option<Entry>, now: u64) -> Option<&'e Entry> {
        entry.as_ref().filter(|e| !e.is_expired(now))
    }
}

#[async_trait]
impl AdmissionStore for MemoryStore {
    async fn eval(&self, script: &Script, key: &str, args: &[String]) -> StoreResult<Vec<i64>> {
        let now = self.clock.now_secs();
        trace!(script = script.name(), key = %key, "Running native script");

        let reply = {
            let mut guard = self.entries.entry(key.to_string()).or_insert(None);
            let entry: &mut Option<Entry> = &mut guard;
            if entry.as_ref().is_some_and(|e| e.is_expired(now)) {
                *entry = None;
            }
            let mut slot = Slot { key, entry, now };
            script.run_native(&mut slot, args)
        };

        self.entries.remove_if(key, |_, entry| entry.is_none());
        reply
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now_secs();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| Self::live(&entry, now).is_some()))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = self.clock.now_secs();
        Ok(self.entries.get(key).and_then(|entry| {
            Self::live(entry.value(), now)
                .and_then(|e| e.expires_at)
                .map(|at| at - now)
        }))
    }

    async fn count_keys(&self, prefix: &str) -> StoreResult<u64> {
        let now = self.clock.now_secs();
        let count = self
            .entries
            .iter()
            .filter(|item| item.key().starts_with(prefix))
            .filter(|item| Self::live(item.value(), now).is_some())
            .count();
        Ok(count as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
