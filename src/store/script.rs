//! Atomic store scripts.
//!
//! A [`Script`] is one read-modify-write transform over a single key. It
//! carries two renditions of the same logic: Lua source for stores with
//! server-side scripting (Redis, Dragonfly, KeyDB), and a native function the
//! in-process [`MemoryStore`](super::MemoryStore) runs while holding the key's
//! lock. Both renditions must agree on arguments and reply layout; replies are
//! always a flat list of integers.

use std::fmt;
use std::str::FromStr;

use super::memory::Slot;
use crate::error::{StoreError, StoreResult};

/// Native rendition of a script.
pub type NativeScript = fn(&mut Slot<'_>, &ScriptArgs<'_>) -> StoreResult<Vec<i64>>;

/// A single-key atomic transform.
pub struct Script {
    name: &'static str,
    lua: &'static str,
    native: NativeScript,
}

impl Script {
    pub const fn new(name: &'static str, lua: &'static str, native: NativeScript) -> Self {
        Self { name, lua, native }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lua(&self) -> &'static str {
        self.lua
    }

    /// Run the native rendition against a locked slot.
    pub fn run_native(&self, slot: &mut Slot<'_>, args: &[String]) -> StoreResult<Vec<i64>> {
        let args = ScriptArgs {
            script: self.name,
            values: args,
        };
        (self.native)(slot, &args)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script").field("name", &self.name).finish()
    }
}

/// Positional script arguments (`ARGV` in Lua terms), zero-indexed here.
pub struct ScriptArgs<'a> {
    script: &'static str,
    values: &'a [String],
}

impl<'a> ScriptArgs<'a> {
    pub fn int(&self, index: usize) -> StoreResult<i64> {
        self.parse(index)
    }

    pub fn float(&self, index: usize) -> StoreResult<f64> {
        self.parse(index)
    }

    pub fn text(&self, index: usize) -> StoreResult<&'a str> {
        self.values
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| self.missing(index))
    }

    fn parse<T: FromStr>(&self, index: usize) -> StoreResult<T> {
        let raw = self.text(index)?;
        raw.parse().map_err(|_| StoreError::Script {
            script: self.script,
            reason: format!("argument {} ('{}') is not a number", index + 1, raw),
        })
    }

    fn missing(&self, index: usize) -> StoreError {
        StoreError::Script {
            script: self.script,
            reason: format!("missing argument {}", index + 1),
        }
    }
}

/// Read reply element `index`, failing with a script error if the reply is short.
pub fn reply_at(script: &Script, reply: &[i64], index: usize) -> StoreResult<i64> {
    reply.get(index).copied().ok_or_else(|| StoreError::Script {
        script: script.name(),
        reason: format!("reply has {} elements, expected more than {}", reply.len(), index),
    })
}
