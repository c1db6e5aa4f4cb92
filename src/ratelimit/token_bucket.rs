//! Token Bucket
//!
//! Tokens are added to the bucket at a constant rate, and each request
//! consumes one token. If the bucket is empty, the request is rejected.
//!
//! This allows for bursty traffic up to `capacity` while maintaining an
//! average rate of `refill_rate` requests per second. State is a hash of
//! `tokens` and `last_refill` stored under the admission key.

use async_trait::async_trait;
use tracing::{debug, trace};

use super::context::{AdmissionContext, AdmissionResult, Algorithm};
use super::strategy::RateLimitStrategy;
use crate::error::{StoreError, StoreResult};
use crate::store::script::reply_at;
use crate::store::{AdmissionStore, Script, ScriptArgs, Slot};

const ADMIT_LUA: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
local elapsed = now - last
if elapsed > 0 then
  local refill = math.floor(elapsed * rate)
  if refill > 0 then
    if tokens + refill >= capacity then
      tokens = capacity
      last = now
    else
      tokens = tokens + refill
      last = last + refill / rate
    end
  end
end
local allowed = 0
local retry = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
else
  retry = math.ceil((1 - tokens) / rate)
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill', last)
redis.call('EXPIRE', KEYS[1], ARGV[4])
return {allowed, math.floor(tokens), retry}
"#;

const PEEK_LUA: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  return {capacity}
end
if now > last then
  tokens = math.min(capacity, tokens + math.floor((now - last) * rate))
end
return {math.floor(tokens)}
"#;

/// Bucket state read from the store, or seeded full on first use.
struct Bucket {
    tokens: f64,
    last_refill: f64,
}

impl Bucket {
    fn load(slot: &Slot<'_>, script: &'static str, capacity: f64, now: f64) -> StoreResult<Self> {
        let parse = |raw: &str| {
            raw.parse::<f64>().map_err(|_| StoreError::Script {
                script,
                reason: format!("corrupt bucket field '{}'", raw),
            })
        };
        match (slot.hget("tokens")?, slot.hget("last_refill")?) {
            (Some(tokens), Some(last)) => Ok(Self {
                tokens: parse(tokens)?,
                last_refill: parse(last)?,
            }),
            _ => Ok(Self {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    /// Whole tokens earned since `last_refill`. Advances `last_refill` only
    /// by the time those tokens represent, so fractional progress carries over.
    fn refill(&mut self, now: f64, capacity: f64, rate: f64) {
        let elapsed = now - self.last_refill;
        if elapsed <= 0.0 {
            return;
        }
        let earned = (elapsed * rate).floor();
        if earned <= 0.0 {
            return;
        }
        if self.tokens + earned >= capacity {
            self.tokens = capacity;
            self.last_refill = now;
        } else {
            self.tokens += earned;
            self.last_refill += earned / rate;
        }
    }
}

/// ARGV: now, capacity, rate, ttl. Reply: allowed, tokens left, retry_after.
fn admit(slot: &mut Slot<'_>, args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    let now = args.float(0)?;
    let capacity = args.float(1)?;
    let rate = args.float(2)?;
    let ttl = args.int(3)?.max(1) as u64;

    let mut bucket = Bucket::load(slot, "token_bucket", capacity, now)?;
    bucket.refill(now, capacity, rate);

    let (allowed, retry) = if bucket.tokens >= 1.0 {
        bucket.tokens -= 1.0;
        (1, 0)
    } else {
        (0, ((1.0 - bucket.tokens) / rate).ceil() as i64)
    };

    slot.hset("tokens", bucket.tokens.to_string())?;
    slot.hset("last_refill", bucket.last_refill.to_string())?;
    slot.expire(ttl);

    Ok(vec![allowed, bucket.tokens.floor() as i64, retry])
}

/// ARGV: now, capacity, rate. Reply: tokens available.
fn peek(slot: &mut Slot<'_>, args: &ScriptArgs<'_>) -> StoreResult<Vec<i64>> {
    let now = args.float(0)?;
    let capacity = args.float(1)?;
    let rate = args.float(2)?;

    if !slot.exists() {
        return Ok(vec![capacity as i64]);
    }
    let bucket = Bucket::load(slot, "token_bucket_peek", capacity, now)?;
    let mut tokens = bucket.tokens;
    if now > bucket.last_refill {
        tokens = capacity.min(tokens + ((now - bucket.last_refill) * rate).floor());
    }
    Ok(vec![tokens.floor() as i64])
}

static ADMIT: Script = Script::new("token_bucket", ADMIT_LUA, admit);
static PEEK: Script = Script::new("token_bucket_peek", PEEK_LUA, peek);

#[cfg(test)]
pub(super) fn scripts() -> [&'static Script; 2] {
    [&ADMIT, &PEEK]
}

/// Ceiling on the bucket key TTL (ten years). Rates slow enough to need more
/// are rejected when the context is validated.
pub(super) const MAX_STATE_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Key TTL: twice the time an empty bucket takes to refill, so idle buckets
/// disappear once they would be full anyway.
pub(super) fn state_ttl(capacity: u64, refill_rate: f64) -> u64 {
    ((2.0 * capacity as f64) / refill_rate)
        .ceil()
        .clamp(1.0, MAX_STATE_TTL_SECS as f64) as u64
}

/// Token bucket strategy.
#[derive(Debug, Default)]
pub struct TokenBucket;

#[async_trait]
impl RateLimitStrategy for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn execute(
        &self,
        store: &dyn AdmissionStore,
        ctx: &AdmissionContext,
    ) -> StoreResult<AdmissionResult> {
        let args = [
            ctx.now.to_string(),
            ctx.capacity.to_string(),
            ctx.refill_rate.to_string(),
            state_ttl(ctx.capacity, ctx.refill_rate).to_string(),
        ];
        let reply = store.eval(&ADMIT, &ctx.key, &args).await?;

        let allowed = reply_at(&ADMIT, &reply, 0)? == 1;
        let tokens = reply_at(&ADMIT, &reply, 1)?.max(0) as u64;
        let used = ctx.capacity.saturating_sub(tokens);

        trace!(key = %ctx.key, tokens = tokens, capacity = ctx.capacity, "Token bucket checked");

        if allowed {
            Ok(AdmissionResult::allowed(&ctx.key, used, ctx.capacity))
        } else {
            let retry_after = reply_at(&ADMIT, &reply, 2)?.max(1) as u64;
            debug!(key = %ctx.key, retry_after = retry_after, "Token bucket empty");
            Ok(AdmissionResult::denied(&ctx.key, retry_after, used, ctx.capacity))
        }
    }

    async fn remaining(&self, store: &dyn AdmissionStore, ctx: &AdmissionContext) -> StoreResult<u64> {
        let args = [
            ctx.now.to_string(),
            ctx.capacity.to_string(),
            ctx.refill_rate.to_string(),
        ];
        let reply = store.eval(&PEEK, &ctx.key, &args).await?;
        Ok(reply_at(&PEEK, &reply, 0)?.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ratelimit::Scope;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn create_test_context(clock: &ManualClock, capacity: u64, refill_rate: f64) -> AdmissionContext {
        AdmissionContext {
            key: "rate:limit:ip:10.0.0.1:Files.upload".to_string(),
            algorithm: Algorithm::TokenBucket,
            scope: Scope::Ip,
            window_secs: 0,
            limit: 0,
            capacity,
            refill_rate,
            message: String::new(),
            now: clock.now_secs(),
        }
    }

    #[test]
    fn test_state_ttl() {
        assert_eq!(state_ttl(5, 1.0), 10);
        assert_eq!(state_ttl(10, 4.0), 5);
        assert_eq!(state_ttl(1, 100.0), 1);
        assert_eq!(state_ttl(5, 1e-18), MAX_STATE_TTL_SECS);
        assert_eq!(state_ttl(u64::MAX, 1.0), MAX_STATE_TTL_SECS);
    }

    #[tokio::test]
    async fn test_slow_bucket_ttl_fits_script_args() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());
        // One token every hundred million seconds.
        let ctx = create_test_context(&clock, 1, 1e-8);
        assert!(ctx.validate().is_ok());

        assert!(TokenBucket.execute(&store, &ctx).await.unwrap().allowed);
        let denied = TokenBucket.execute(&store, &ctx).await.unwrap();
        assert!(!denied.allowed);
        let ttl = store.ttl(&ctx.key).await.unwrap().unwrap();
        assert!(ttl >= 199_999_999 && ttl <= MAX_STATE_TTL_SECS);
    }

    #[tokio::test]
    async fn test_burst_then_refill() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());

        for _ in 0..5 {
            let result = TokenBucket
                .execute(&store, &create_test_context(&clock, 5, 1.0))
                .await
                .unwrap();
            assert!(result.allowed);
        }

        let result = TokenBucket
            .execute(&store, &create_test_context(&clock, 5, 1.0))
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(1));

        clock.advance(2);
        for _ in 0..2 {
            let result = TokenBucket
                .execute(&store, &create_test_context(&clock, 5, 1.0))
                .await
                .unwrap();
            assert!(result.allowed);
        }
        let result = TokenBucket
            .execute(&store, &create_test_context(&clock, 5, 1.0))
            .await
            .unwrap();
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn test_first_check_seeds_full_bucket() {
        let clock = Arc::new(ManualClock::new(50));
        let store = MemoryStore::new(clock.clone());
        let ctx = create_test_context(&clock, 5, 1.0);

        assert_eq!(TokenBucket.remaining(&store, &ctx).await.unwrap(), 5);
        let result = TokenBucket.execute(&store, &ctx).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.current_count, Some(1));
        assert_eq!(TokenBucket.remaining(&store, &ctx).await.unwrap(), 4);
        assert_eq!(store.ttl(&ctx.key).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_refill_never_exceeds_capacity() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());

        TokenBucket
            .execute(&store, &create_test_context(&clock, 3, 1.0))
            .await
            .unwrap();
        clock.advance(5);
        let ctx = create_test_context(&clock, 3, 1.0);
        assert_eq!(TokenBucket.remaining(&store, &ctx).await.unwrap(), 3);

        let result = TokenBucket.execute(&store, &ctx).await.unwrap();
        assert_eq!(result.current_count, Some(1));
    }

    #[tokio::test]
    async fn test_fractional_rate_keeps_progress() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());

        // Drain a one-token bucket refilling every two seconds.
        let result = TokenBucket
            .execute(&store, &create_test_context(&clock, 1, 0.5))
            .await
            .unwrap();
        assert!(result.allowed);

        let result = TokenBucket
            .execute(&store, &create_test_context(&clock, 1, 0.5))
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(2));

        // Checking every second must not starve the bucket.
        clock.advance(1);
        assert!(!TokenBucket
            .execute(&store, &create_test_context(&clock, 1, 0.5))
            .await
            .unwrap()
            .allowed);
        clock.advance(1);
        assert!(TokenBucket
            .execute(&store, &create_test_context(&clock, 1, 0.5))
            .await
            .unwrap()
            .allowed);
    }
}
