//! Shared counter store.
//!
//! Strategies keep all per-key state in a networked key-value store and
//! coordinate only through the atomic primitives it exposes. This module
//! defines that capability set and provides a Redis adapter plus an
//! in-process store used by tests and single-node deployments.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// One end of a score range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    /// Below every score.
    NegInf,
    /// Scores `>=` / `<=` this value.
    Inclusive(f64),
    /// Scores strictly beyond this value.
    Exclusive(f64),
    /// Above every score.
    PosInf,
}

impl ScoreBound {
    /// Whether `score` satisfies this bound used as a range minimum.
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInf => true,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
            ScoreBound::PosInf => false,
        }
    }

    /// Whether `score` satisfies this bound used as a range maximum.
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            ScoreBound::NegInf => false,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
            ScoreBound::PosInf => true,
        }
    }
}

/// Redis range syntax: `-inf`, `42`, `(42`, `+inf`.
impl fmt::Display for ScoreBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreBound::NegInf => f.write_str("-inf"),
            ScoreBound::Inclusive(v) => write!(f, "{}", v),
            ScoreBound::Exclusive(v) => write!(f, "({}", v),
            ScoreBound::PosInf => f.write_str("+inf"),
        }
    }
}

/// Operation names used in error context and fault injection.
pub mod op {
    pub const GET: &str = "GET";
    pub const SET: &str = "SET";
    pub const SET_NX: &str = "SETNX";
    pub const CAS: &str = "CAS";
    pub const INCRBY: &str = "INCRBY";
    pub const PEXPIRE: &str = "PEXPIRE";
    pub const PTTL: &str = "PTTL";
    pub const ZCOUNT: &str = "ZCOUNT";
    pub const ZREMRANGEBYSCORE: &str = "ZREMRANGEBYSCORE";
    pub const ZADD: &str = "ZADD";
    pub const RECORD: &str = "MULTI";
}

/// The atomic primitives strategies are allowed to rely on.
///
/// Each call is atomic on its own key. No cross-key transactions are offered;
/// multi-step sequences must tolerate interleaving with other callers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Raw scalar value, if present.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Replace the value only if it currently equals `expected`.
    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool>;

    /// Add `delta` atomically, creating the key at 0 first if absent.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Expire the key after `ttl`. No effect on an absent key.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remaining time to live; `None` if the key is absent or never expires.
    async fn expiry(&self, key: &str) -> Result<Option<Duration>>;

    /// Number of scored-set members within `[min, max]`.
    async fn range_count(&self, key: &str, min: ScoreBound, max: ScoreBound) -> Result<u64>;

    /// Remove scored-set members within `[min, max]`, returning how many.
    async fn range_remove(&self, key: &str, min: ScoreBound, max: ScoreBound) -> Result<u64>;

    /// Insert or rescore a scored-set member.
    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Atomically prune members scored at or below `prune_max`, insert
    /// `member`, expire the set after `ttl` and return its cardinality.
    async fn record_scored(
        &self,
        key: &str,
        prune_max: ScoreBound,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<u64>;
}
