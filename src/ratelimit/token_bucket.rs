//! Token bucket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::clock::{after, Clock};
use super::context::Context;
use super::request::{Outcome, Request};
use super::strategy::Strategy;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// Optimistic refill attempts before giving up on a contended bucket.
const MAX_REFILL_ATTEMPTS: usize = 16;

/// Bucket shape, shared by every key a limiter serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketSettings {
    /// Bucket capacity; a new bucket starts full.
    pub max_tokens: u64,
    /// Time between refill events.
    pub refill_interval: Duration,
    /// Tokens added per elapsed interval, capped at `max_tokens`.
    pub refill_amount: u64,
}

impl Default for TokenBucketSettings {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_interval: Duration::from_secs(60),
            refill_amount: 5,
        }
    }
}

/// Allows bursts up to the bucket capacity while enforcing a long-run rate.
///
/// Per key the store holds `<key>:tokens` and `<key>:last_refill` (epoch
/// milliseconds), neither of which expires: a dormant client resumes with its
/// tokens caught up rather than reset. The bucket ignores the request's
/// `limit` and `duration`; its shape comes from [`TokenBucketSettings`].
///
/// Refills are claimed by compare-and-swap on the refill timestamp so only one
/// caller credits each elapsed interval. Tokens are taken with an atomic
/// decrement that is compensated when it would go below zero.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    clock: Clock,
    settings: TokenBucketSettings,
}

fn tokens_key(key: &str) -> String {
    format!("{}:tokens", key)
}

fn last_refill_key(key: &str) -> String {
    format!("{}:last_refill", key)
}

fn parse_i64(key: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| TurnstileError::malformed(key, raw))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl TokenBucketLimiter {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>, clock: Clock, settings: TokenBucketSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// The bucket shape.
    pub fn settings(&self) -> &TokenBucketSettings {
        &self.settings
    }

    fn interval_ms(&self) -> i64 {
        clamp_i64(self.settings.refill_interval.as_millis().min(u64::MAX as u128) as u64).max(1)
    }

    /// Create a full bucket for a first-time key, returning its refill time.
    async fn initialize(&self, ctx: &Context, tokens: &str, last: &str, now_ms: i64) -> Result<i64> {
        let capacity = self.settings.max_tokens.to_string();
        ctx.run(self.store.set_if_absent(tokens, &capacity)).await?;

        if ctx.run(self.store.set_if_absent(last, &now_ms.to_string())).await? {
            debug!(key = %tokens, capacity = self.settings.max_tokens, "Created token bucket");
            return Ok(now_ms);
        }

        // Another caller created it first.
        match ctx.run(self.store.get(last)).await? {
            Some(raw) => parse_i64(last, &raw),
            None => Ok(now_ms),
        }
    }

    /// Credit `added` tokens, capped at capacity.
    async fn refill(&self, ctx: &Context, tokens: &str, added: u64) -> Result<()> {
        let capacity = clamp_i64(self.settings.max_tokens);
        let added = clamp_i64(added);

        for _ in 0..MAX_REFILL_ATTEMPTS {
            match ctx.run(self.store.get(tokens)).await? {
                None => {
                    let value = added.min(capacity).to_string();
                    if ctx.run(self.store.set_if_absent(tokens, &value)).await? {
                        return Ok(());
                    }
                }
                Some(raw) => {
                    let current = parse_i64(tokens, &raw)?;
                    let next = current.saturating_add(added).min(capacity);
                    if next <= current {
                        return Ok(());
                    }
                    if ctx
                        .run(self.store.compare_and_swap(tokens, &raw, &next.to_string()))
                        .await?
                    {
                        return Ok(());
                    }
                }
            }
            trace!(key = %tokens, "Refill lost a race, retrying");
        }

        Err(TurnstileError::Contention {
            key: tokens.to_string(),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Strategy for TokenBucketLimiter {
    async fn execute(&self, ctx: &Context, request: &Request) -> Result<Outcome> {
        let tokens = tokens_key(&request.key);
        let last = last_refill_key(&request.key);
        let now = (self.clock)();
        let now_ms = now.timestamp_millis();
        let interval = self.settings.refill_interval;

        let (tokens_raw, last_raw) = futures::try_join!(
            ctx.run(self.store.get(&tokens)),
            ctx.run(self.store.get(&last))
        )?;
        if let Some(raw) = &tokens_raw {
            parse_i64(&tokens, raw)?;
        }

        let mut last_refill = match &last_raw {
            Some(raw) => parse_i64(&last, raw)?,
            None => self.initialize(ctx, &tokens, &last, now_ms).await?,
        };

        if tokens_raw.is_none() && last_raw.is_some() {
            // Token count lost on its own: a missing count means a full bucket.
            let capacity = self.settings.max_tokens.to_string();
            if ctx.run(self.store.set_if_absent(&tokens, &capacity)).await? {
                debug!(key = %request.key, "Restored missing token count");
            }
        }

        let elapsed = now_ms.saturating_sub(last_refill);
        let interval_ms = self.interval_ms();
        if let Some(expected) = last_raw.as_deref().filter(|_| elapsed >= interval_ms) {
            let intervals = (elapsed / interval_ms) as u64;
            let claimed = ctx
                .run(self.store.compare_and_swap(&last, expected, &now_ms.to_string()))
                .await?;
            if claimed {
                let added = intervals.saturating_mul(self.settings.refill_amount);
                self.refill(ctx, &tokens, added).await?;
                debug!(
                    key = %request.key,
                    intervals = intervals,
                    added = added,
                    "Refilled token bucket"
                );
            }
            last_refill = now_ms;
        }

        let remaining = ctx.run(self.store.increment(&tokens, -1)).await?;

        trace!(
            key = %request.key,
            remaining = remaining,
            capacity = self.settings.max_tokens,
            "Checking token bucket"
        );

        if remaining >= 0 {
            return Ok(Outcome::allow(remaining as u64, after(now, interval)));
        }

        // Give back the token we could not take.
        ctx.run(self.store.increment(&tokens, 1)).await?;
        debug!(key = %request.key, "Token bucket empty");
        Ok(Outcome::deny(0, after(from_millis(last_refill), interval)))
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}
