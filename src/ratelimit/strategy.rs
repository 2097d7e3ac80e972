//! Strategy trait and construction of the configured variant.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::clock::Clock;
use super::context::Context;
use super::fixed_window::FixedWindowLimiter;
use super::request::{Outcome, Request};
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::{TokenBucketLimiter, TokenBucketSettings};
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// A rate limiting algorithm.
///
/// Implementations hold no per-key state in process; everything lives in the
/// shared [`CounterStore`], so any number of instances across any number of
/// processes may check the same key concurrently.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Decide whether `request` may proceed, recording it if it does.
    ///
    /// Not idempotent: a call that gets past the pre-check mutates store
    /// state even if the caller later abandons it.
    async fn execute(&self, ctx: &Context, request: &Request) -> Result<Outcome>;

    /// Stable name used in logs.
    fn name(&self) -> &'static str;
}

/// The available strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Discrete windows reset by key expiry
    FixedWindow,
    /// Timestamped request log
    SlidingWindow,
    /// Refilling token bucket
    TokenBucket,
}

impl StrategyKind {
    /// All variants, in a stable order.
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::FixedWindow,
        StrategyKind::SlidingWindow,
        StrategyKind::TokenBucket,
    ];

    /// Config/CLI spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::SlidingWindow => "sliding_window",
            StrategyKind::TokenBucket => "token_bucket",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" => Ok(StrategyKind::FixedWindow),
            "sliding_window" => Ok(StrategyKind::SlidingWindow),
            "token_bucket" => Ok(StrategyKind::TokenBucket),
            other => Err(TurnstileError::Config(format!(
                "unknown rate limiting strategy: {}",
                other
            ))),
        }
    }
}

/// Build the strategy for `kind` over a shared store and clock.
pub fn build_strategy(
    kind: StrategyKind,
    store: Arc<dyn CounterStore>,
    clock: Clock,
    bucket: &TokenBucketSettings,
) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::FixedWindow => Arc::new(FixedWindowLimiter::new(store, clock)),
        StrategyKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(store, clock)),
        StrategyKind::TokenBucket => Arc::new(TokenBucketLimiter::new(store, clock, bucket.clone())),
    }
}
