//! Fixed window counter.
//!
//! One integer counter per key, expiring `window` seconds after the first
//! request of the window. Callers can burst up to twice the limit across a
//! window boundary; that is inherent to the algorithm.

use async_trait::async_trait;
use tracing::{debug, trace};

use super::context::{AdmissionContext, AdmissionResult, Algorithm};
use super::strategy::RateLimitStrategy;
use crate::error::StoreResult;
use crate::store::script::reply_at;
use crate::store::{AdmissionStore, Script, ScriptArgs, Slot};

const ADMIT_LUA: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= limit then
  local ttl = redis.call('TTL', KEYS[1])
  if ttl < 0 then
    redis.call('EXPIRE', KEYS[1], window)
    ttl = window
  end
  return {0, current, ttl}
end
current = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], window)
end
return {1, current, redis.call('TTL', KEYS[1])}
"#;

const PEEK_LUA: &str = r#"
return {tonumber(redis.call('GET', KEYS[1]) or '0')}
"#;

/// ARGV: limit, window. Reply: allowed, count, ttl.
fn admit(slot: &mut Slot<'_>, args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    let limit = args.int(0)?;
    let window = args.int(1)?.max(1) as u64;

    let current = slot.counter()?.unwrap_or(0);
    if current >= limit {
        if slot.ttl().is_none() {
            slot.expire(window);
        }
        return Ok(vec![0, current, slot.ttl().unwrap_or(window) as i64]);
    }

    let count = slot.incr()?;
    if slot.ttl().is_none() {
        slot.expire(window);
    }
    Ok(vec![1, count, slot.ttl().unwrap_or(window) as i64])
}

/// Reply: count.
fn peek(slot: &mut Slot<'_>, _args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    Ok(vec![slot.counter()?.unwrap_or(0)])
}

static ADMIT: Script = Script::new("fixed_window", ADMIT_LUA, admit);
static PEEK: Script = Script::new("fixed_window_peek", PEEK_LUA, peek);

#[cfg(test)]
pub(super) fn scripts() -> [&'static Script; 2] {
    [&ADMIT, &PEEK]
}

/// Fixed window strategy.
#[derive(Debug, Default)]
pub struct FixedWindow;

#[async_trait]
impl RateLimitStrategy for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn execute(
        &self,
        store: &dyn AdmissionStore,
        ctx: &AdmissionContext,
    ) -> StoreResult<AdmissionResult> {
        let args = [ctx.limit.to_string(), ctx.window_secs.to_string()];
        let reply = store.eval(&ADMIT, &ctx.key, &args).await?;

        let allowed = reply_at(&ADMIT, &reply, 0)? == 1;
        let count = reply_at(&ADMIT, &reply, 1)?.max(0) as u64;
        let ttl = reply_at(&ADMIT, &reply, 2)?.max(1) as u64;

        trace!(key = %ctx.key, count = count, limit = ctx.limit, "Fixed window checked");

        if allowed {
            Ok(AdmissionResult::allowed(&ctx.key, count, ctx.limit))
        } else {
            debug!(key = %ctx.key, retry_after = ttl, "Fixed window limit exceeded");
            Ok(AdmissionResult::denied(&ctx.key, ttl, count, ctx.limit))
        }
    }

    async fn remaining(&self, store: &dyn AdmissionStore, ctx: &AdmissionContext) -> StoreResult<u64> {
        let reply = store.eval(&PEEK, &ctx.key, &[]).await?;
        let count = reply_at(&PEEK, &reply, 0)?.max(0) as u64;
        Ok(ctx.limit.saturating_sub(count))
    }
}
