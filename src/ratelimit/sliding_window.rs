//! Sliding window log.
//!
//! Each admitted request is recorded in a sorted set scored by its
//! timestamp. Entries at or before `now - window` are purged on every check,
//! so the set always holds exactly the requests of the trailing window.

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use super::context::{AdmissionContext, AdmissionResult, Algorithm};
use super::strategy::RateLimitStrategy;
use crate::error::StoreResult;
use crate::store::script::reply_at;
use crate::store::{AdmissionStore, Script, ScriptArgs, Slot};

const ADMIT_LUA: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('EXPIRE', KEYS[1], window)
  return {1, count + 1, 0}
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local retry = window
if oldest[2] then
  retry = window - (now - tonumber(oldest[2]))
end
if retry < 1 then
  retry = 1
end
return {0, count, retry}
"#;

const PEEK_LUA: &str = r#"
local floor = tonumber(ARGV[1]) - tonumber(ARGV[2])
return {redis.call('ZCOUNT', KEYS[1], '(' .. floor, '+inf')}
"#;

/// ARGV: now, window, limit, member. Reply: allowed, count, retry_after.
fn admit(slot: &mut Slot<'_>, args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    let now = args.int(0)?;
    let window = args.int(1)?;
    let limit = args.int(2)?;
    let member = args.text(3)?;

    slot.zremrange_upto((now - window) as f64)?;
    let count = slot.zcard()? as i64;
    if count < limit {
        slot.zadd(now as f64, member.to_string())?;
        slot.expire(window.max(1) as u64);
        return Ok(vec![1, count + 1, 0]);
    }

    let retry = match slot.zfirst_score()? {
        Some(oldest) => window - (now - oldest as i64),
        None => window,
    };
    Ok(vec![0, count, retry.max(1)])
}

/// ARGV: now, window. Reply: live entries.
fn peek(slot: &mut Slot<'_>, args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    let floor = args.int(0)? - args.int(1)?;
    Ok(vec![slot.zcount_above(floor as f64)? as i64])
}

static ADMIT: Script = Script::new("sliding_window", ADMIT_LUA, admit);
static PEEK: Script = Script::new("sliding_window_peek", PEEK_LUA, peek);

#[cfg(test)]
pub(super) fn scripts() -> [&'static Script; 2] {
    [&ADMIT, &PEEK]
}

/// Sliding window strategy; the default when no algorithm is requested.
#[derive(Debug, Default)]
pub struct SlidingWindow;

#[async_trait]
impl RateLimitStrategy for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn execute(
        &self,
        store: &dyn AdmissionStore,
        ctx: &AdmissionContext,
    ) -> StoreResult<AdmissionResult> {
        // Concurrent calls in the same second must not overwrite each other.
        let member = format!("{}-{}", ctx.now, Uuid::new_v4());
        let args = [
            ctx.now.to_string(),
            ctx.window_secs.to_string(),
            ctx.limit.to_string(),
            member,
        ];
        let reply = store.eval(&ADMIT, &ctx.key, &args).await?;

        let allowed = reply_at(&ADMIT, &reply, 0)? == 1;
        let count = reply_at(&ADMIT, &reply, 1)?.max(0) as u64;

        trace!(key = %ctx.key, count = count, limit = ctx.limit, "Sliding window checked");

        if allowed {
            Ok(AdmissionResult::allowed(&ctx.key, count, ctx.limit))
        } else {
            let retry_after = reply_at(&ADMIT, &reply, 2)?.max(1) as u64;
            debug!(key = %ctx.key, retry_after = retry_after, "Sliding window limit exceeded");
            Ok(AdmissionResult::denied(&ctx.key, retry_after, count, ctx.limit))
        }
    }

    async fn remaining(&self, store: &dyn AdmissionStore, ctx: &AdmissionContext) -> StoreResult<u64> {
        let args = [ctx.now.to_string(), ctx.window_secs.to_string()];
        let reply = store.eval(&PEEK, &ctx.key, &args).await?;
        let live = reply_at(&PEEK, &reply, 0)?.max(0) as u64;
        Ok(ctx.limit.saturating_sub(live))
    }
}
