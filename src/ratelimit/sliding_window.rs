//! Sliding-window log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use super::clock::{after, Clock};
use super::context::Context;
use super::request::{Outcome, Request};
use super::strategy::Strategy;
use crate::error::Result;
use crate::store::{CounterStore, ScoreBound};

/// Approximates a continuously sliding window with a log of timestamped entries.
///
/// Each key holds a scored set whose members are unique per attempt and whose
/// scores are arrival times in epoch milliseconds. An entry belongs to the
/// window while it is younger than `duration`.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Clock,
}

impl SlidingWindowLimiter {
    /// Create a limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>, clock: Clock) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Strategy for SlidingWindowLimiter {
    async fn execute(&self, ctx: &Context, request: &Request) -> Result<Outcome> {
        let key = request.key.as_str();
        let now = (self.clock)();
        let now_ms = now.timestamp_millis();
        let window_ms = i64::try_from(request.duration.as_millis()).unwrap_or(i64::MAX);
        let window_start = now_ms.saturating_sub(window_ms) as f64;
        // The moment the current instant itself leaves the window.
        let reset_at = after(now, request.duration);

        let current = ctx
            .run(self.store.range_count(key, ScoreBound::Exclusive(window_start), ScoreBound::PosInf))
            .await?;

        trace!(
            key = %key,
            count = current,
            limit = request.limit,
            "Checking sliding window"
        );

        // Saturated: answer from the read alone so the log stops growing.
        if current >= request.limit {
            debug!(key = %key, count = current, limit = request.limit, "Sliding window exhausted");
            return Ok(Outcome::deny(current, reset_at));
        }

        let member = Uuid::new_v4().to_string();
        let count = ctx
            .run(self.store.record_scored(
                key,
                ScoreBound::Inclusive(window_start),
                &member,
                now_ms as f64,
                request.duration,
            ))
            .await?;

        if count > request.limit {
            debug!(key = %key, count = count, limit = request.limit, "Sliding window exceeded");
            return Ok(Outcome::deny(count, reset_at));
        }

        Ok(Outcome::allow(count, reset_at))
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}
