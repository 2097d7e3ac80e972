//! Fixed-window counter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::clock::{after, Clock};
use super::context::Context;
use super::request::{Outcome, Request};
use super::strategy::Strategy;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// Counts units in non-overlapping windows of `duration`, one counter per key.
///
/// The window boundary is the counter's TTL: when the key expires the next
/// call starts a fresh window. Bursts of up to twice the limit can straddle
/// two adjacent windows.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Clock,
}

impl FixedWindowLimiter {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>, clock: Clock) -> Self {
        Self { store, clock }
    }
}

fn parse_count(key: &str, raw: Option<String>) -> Result<Option<u64>> {
    raw.map(|value| {
        value
            .trim()
            .parse::<u64>()
            .map_err(|_| TurnstileError::malformed(key, value))
    })
    .transpose()
}

#[async_trait]
impl Strategy for FixedWindowLimiter {
    async fn execute(&self, ctx: &Context, request: &Request) -> Result<Outcome> {
        let key = request.key.as_str();
        let now = (self.clock)();

        // Count and TTL go out together.
        let (count, ttl) = tokio::join!(
            ctx.run(self.store.get(key)),
            ctx.run(self.store.expiry(key))
        );
        let count = parse_count(key, count?)?;

        let ttl = match ttl {
            Ok(ttl) => ttl,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                // Treated as "no TTL": forces a fresh window rather than failing.
                warn!(key = %key, error = %e, "Failed to read window TTL, starting a new window");
                None
            }
        };

        let (ttl, fresh_counter) = match ttl {
            Some(ttl) => (ttl, false),
            None => {
                if count.is_some() {
                    // A live counter without TTL never resets on its own.
                    debug!(key = %key, "Counter has no TTL, starting window");
                    ctx.run(self.store.set_expiry(key, request.duration)).await?;
                }
                (request.duration, count.is_none())
            }
        };
        let reset_at = after(now, ttl);

        trace!(
            key = %key,
            count = count.unwrap_or(0),
            limit = request.limit,
            ttl_ms = ttl.as_millis() as u64,
            "Checking fixed window"
        );

        if let Some(count) = count {
            if count >= request.limit {
                debug!(key = %key, count = count, limit = request.limit, "Fixed window exhausted");
                return Ok(Outcome::deny(count, reset_at));
            }
        }

        let value = ctx.run(self.store.increment(key, 1)).await?;
        let current = u64::try_from(value).map_err(|_| TurnstileError::malformed(key, value.to_string()))?;

        if fresh_counter {
            // EXPIRE is a no-op until the increment has created the key.
            ctx.run(self.store.set_expiry(key, request.duration)).await?;
        }

        if current > request.limit {
            debug!(key = %key, count = current, limit = request.limit, "Fixed window exceeded");
            return Ok(Outcome::deny(current, reset_at));
        }

        Ok(Outcome::allow(current, reset_at))
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::request::Decision;
    use crate::store::{op, MemoryStore};
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 23, 10, 15, 30).unwrap()
    }

    fn setup() -> (FixedWindowLimiter, Arc<MemoryStore>, ManualClock) {
        let manual = ManualClock::new(start());
        let store = Arc::new(MemoryStore::new(manual.clock()));
        let limiter = FixedWindowLimiter::new(store.clone(), manual.clock());
        (limiter, store, manual)
    }

    #[tokio::test]
    async fn test_allows_with_increasing_count_until_limit() {
        let (limiter, _, _) = setup();
        let request = Request::new("some-user", 5, Duration::from_secs(60));
        let ctx = Context::background();

        for expected in 1..=5 {
            let outcome = limiter.execute(&ctx, &request).await.unwrap();
            assert_eq!(outcome.decision, Decision::Allow);
            assert_eq!(outcome.observed_count, expected);
            assert_eq!(outcome.reset_at, start() + chrono::Duration::seconds(60));
        }

        // The pre-check answers without incrementing.
        for _ in 0..3 {
            let outcome = limiter.execute(&ctx, &request).await.unwrap();
            assert_eq!(outcome.decision, Decision::Deny);
            assert_eq!(outcome.observed_count, 5);
        }
    }

    #[tokio::test]
    async fn test_first_request_sets_window_ttl() {
        let (limiter, store, _) = setup();
        let request = Request::new("k", 3, Duration::from_secs(60));

        limiter.execute(&Context::background(), &request).await.unwrap();
        assert_eq!(store.expiry("k").await.unwrap(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_reset_at_tracks_remaining_ttl() {
        let (limiter, _, clock) = setup();
        let request = Request::new("k", 3, Duration::from_secs(60));
        let ctx = Context::background();

        limiter.execute(&ctx, &request).await.unwrap();
        clock.advance(Duration::from_secs(20));
        let outcome = limiter.execute(&ctx, &request).await.unwrap();

        assert_eq!(outcome.reset_at, start() + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_window_resets_after_ttl() {
        let (limiter, _, clock) = setup();
        let request = Request::new("k", 2, Duration::from_secs(60));
        let ctx = Context::background();

        for _ in 0..3 {
            limiter.execute(&ctx, &request).await.unwrap();
        }
        assert_eq!(
            limiter.execute(&ctx, &request).await.unwrap().decision,
            Decision::Deny
        );

        clock.advance(Duration::from_secs(60));
        let outcome = limiter.execute(&ctx, &request).await.unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.observed_count, 1);
    }

    #[tokio::test]
    async fn test_untimed_counter_self_heals() {
        let (limiter, store, clock) = setup();
        let request = Request::new("k", 2, Duration::from_secs(60));

        // Counter left behind by a partial failure: at the limit and never expiring.
        store.increment("k", 2).await.unwrap();
        assert_eq!(store.expiry("k").await.unwrap(), None);

        let outcome = limiter.execute(&Context::background(), &request).await.unwrap();
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(store.expiry("k").await.unwrap(), Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(60));
        let outcome = limiter.execute(&Context::background(), &request).await.unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.observed_count, 1);
    }

    #[tokio::test]
    async fn test_failed_expiry_after_first_increment_heals_on_next_call() {
        let (limiter, store, _) = setup();
        let request = Request::new("k", 5, Duration::from_secs(60));

        store.fail_next(op::PEXPIRE, 1);
        let err = limiter.execute(&Context::background(), &request).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Store { op: "PEXPIRE", .. }));
        assert_eq!(store.get("k").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.expiry("k").await.unwrap(), None);

        let outcome = limiter.execute(&Context::background(), &request).await.unwrap();
        assert_eq!(outcome.observed_count, 2);
        assert_eq!(store.expiry("k").await.unwrap(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_ttl_read_failure_forces_fresh_window() {
        let (limiter, store, clock) = setup();
        let request = Request::new("k", 5, Duration::from_secs(60));
        let ctx = Context::background();

        limiter.execute(&ctx, &request).await.unwrap();
        clock.advance(Duration::from_secs(30));

        store.fail_next(op::PTTL, 1);
        let outcome = limiter.execute(&ctx, &request).await.unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.observed_count, 2);
        assert_eq!(outcome.reset_at, start() + chrono::Duration::seconds(90));
        assert_eq!(store.expiry("k").await.unwrap(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_get_failure_is_surfaced() {
        let (limiter, store, _) = setup();
        store.fail_next(op::GET, 1);

        let err = limiter
            .execute(&Context::background(), &Request::new("k", 5, Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Store { op: "GET", .. }));
    }

    #[tokio::test]
    async fn test_malformed_counter_is_surfaced() {
        let (limiter, store, _) = setup();
        store.set("k", "not-a-number").await.unwrap();

        let err = limiter
            .execute(&Context::background(), &Request::new("k", 5, Duration::from_secs(60)))
            .await
            .unwrap_err();
        match err {
            TurnstileError::MalformedValue { key, value } => {
                assert_eq!(key, "k");
                assert_eq!(value, "not-a-number");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (limiter, store, _) = setup();
        let ctx = Context::background();
        let a = Request::new("a", 1, Duration::from_secs(60));
        let b = Request::new("b", 1, Duration::from_secs(60));

        limiter.execute(&ctx, &a).await.unwrap();
        assert_eq!(limiter.execute(&ctx, &a).await.unwrap().decision, Decision::Deny);

        let outcome = limiter.execute(&ctx, &b).await.unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.observed_count, 1);
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_context_returns_error() {
        let (limiter, store, _) = setup();
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();

        let err = limiter
            .execute(&ctx, &Request::new("k", 5, Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::Cancelled));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_admit_exactly_limit() {
        let (limiter, _, _) = setup();
        let limiter = Arc::new(limiter);
        let request = Request::new("shared", 10, Duration::from_secs(60));

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    limiter.execute(&Context::background(), &request).await.unwrap()
                })
            })
            .collect();

        let outcomes = futures::future::join_all(handles).await;
        let allowed = outcomes
            .into_iter()
            .map(|o| o.unwrap())
            .filter(|o| o.is_allowed())
            .count();
        assert_eq!(allowed, 10);
    }
}
