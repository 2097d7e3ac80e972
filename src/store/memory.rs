//! In-process counter store.
//!
//! Mirrors the Redis semantics the strategies depend on (lazy key expiry,
//! INCRBY on absent keys, score-range queries) and reads time from an
//! injected [`Clock`], so tests can fast-forward key expiry together with the
//! strategy's own notion of "now".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use super::{op, CounterStore, ScoreBound};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::clock::{to_chrono, Clock};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Scored(HashMap<String, f64>),
}

/// One key's slot. A slot with no value behaves as an absent key.
#[derive(Debug, Default)]
struct Slot {
    value: Option<Value>,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn expire_if_due(&mut self, now: DateTime<Utc>) {
        if matches!(self.expires_at, Some(at) if at <= now) {
            self.value = None;
            self.expires_at = None;
        }
    }

    fn scalar(&self, key: &str) -> Result<Option<&String>> {
        match &self.value {
            None => Ok(None),
            Some(Value::Scalar(s)) => Ok(Some(s)),
            Some(Value::Scored(_)) => Err(TurnstileError::malformed(key, "<scored set>")),
        }
    }

    fn scored_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>> {
        match self
            .value
            .get_or_insert_with(|| Value::Scored(HashMap::new()))
        {
            Value::Scored(set) => Ok(set),
            Value::Scalar(s) => Err(TurnstileError::malformed(key, s.clone())),
        }
    }

    fn scored(&self, key: &str) -> Result<Option<&HashMap<String, f64>>> {
        match &self.value {
            None => Ok(None),
            Some(Value::Scored(set)) => Ok(Some(set)),
            Some(Value::Scalar(s)) => Err(TurnstileError::malformed(key, s.clone())),
        }
    }
}

fn in_range(score: f64, min: ScoreBound, max: ScoreBound) -> bool {
    min.admits_from_below(score) && max.admits_from_above(score)
}

/// A [`CounterStore`] held in process memory.
///
/// Each operation runs under the key's shard lock, which gives the same
/// per-key atomicity Redis provides for single commands and MULTI batches.
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
    clock: Clock,
    /// Remaining injected failures per operation name.
    faults: Mutex<HashMap<&'static str, u32>>,
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Clock) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `times` calls of `operation` fail as if the network dropped.
    ///
    /// `operation` is one of the names in [`op`].
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        self.faults.lock().insert(operation, times);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = (self.clock)();
        self.slots
            .iter_mut()
            .filter_map(|mut slot| {
                slot.expire_if_due(now);
                slot.value.as_ref().map(|_| ())
            })
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired and vacant slots.
    pub fn purge_expired(&self) {
        let now = (self.clock)();
        self.slots.retain(|_, slot| {
            slot.expire_if_due(now);
            slot.value.is_some()
        });
    }

    fn inject(&self, operation: &'static str, key: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                trace!(op = operation, key = %key, "Injected store failure");
                let source = redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "injected store failure",
                ));
                return Err(TurnstileError::store(operation, key, source));
            }
        }
        Ok(())
    }

    /// Run `f` against the live slot for `key` under its shard lock.
    fn with_slot<R>(
        &self,
        operation: &'static str,
        key: &str,
        f: impl FnOnce(&mut Slot, DateTime<Utc>) -> Result<R>,
    ) -> Result<R> {
        self.inject(operation, key)?;
        let now = (self.clock)();
        let (result, vacant) = {
            let mut slot = self.slots.entry(key.to_string()).or_default();
            slot.expire_if_due(now);
            let result = f(&mut *slot, now);
            (result, slot.value.is_none())
        };
        if vacant {
            self.slots.remove_if(key, |_, slot| slot.value.is_none());
        }
        result
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.slots.len())
            .finish()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_slot(op::GET, key, |slot, _| Ok(slot.scalar(key)?.cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_slot(op::SET, key, |slot, _| {
            slot.value = Some(Value::Scalar(value.to_string()));
            slot.expires_at = None;
            Ok(())
        })
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        self.with_slot(op::SET_NX, key, |slot, _| {
            if slot.value.is_some() {
                return Ok(false);
            }
            slot.value = Some(Value::Scalar(value.to_string()));
            slot.expires_at = None;
            Ok(true)
        })
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool> {
        self.with_slot(op::CAS, key, |slot, _| {
            let matches = slot.scalar(key)?.map(|current| current == expected).unwrap_or(false);
            if matches {
                slot.value = Some(Value::Scalar(new.to_string()));
            }
            Ok(matches)
        })
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_slot(op::INCRBY, key, |slot, _| {
            let current = match slot.scalar(key)? {
                Some(raw) => raw
                    .parse::<i64>()
                    .map_err(|_| TurnstileError::malformed(key, raw.clone()))?,
                None => 0,
            };
            let next = current
                .checked_add(delta)
                .ok_or_else(|| TurnstileError::malformed(key, current.to_string()))?;
            slot.value = Some(Value::Scalar(next.to_string()));
            Ok(next)
        })
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_slot(op::PEXPIRE, key, |slot, now| {
            if slot.value.is_none() {
                return Ok(());
            }
            if ttl.is_zero() {
                slot.value = None;
                slot.expires_at = None;
            } else {
                slot.expires_at = now.checked_add_signed(to_chrono(ttl));
            }
            Ok(())
        })
    }

    async fn expiry(&self, key: &str) -> Result<Option<Duration>> {
        self.with_slot(op::PTTL, key, |slot, now| {
            if slot.value.is_none() {
                return Ok(None);
            }
            Ok(slot
                .expires_at
                .and_then(|at| (at - now).to_std().ok()))
        })
    }

    async fn range_count(&self, key: &str, min: ScoreBound, max: ScoreBound) -> Result<u64> {
        self.with_slot(op::ZCOUNT, key, |slot, _| {
            Ok(slot
                .scored(key)?
                .map(|set| set.values().filter(|s| in_range(**s, min, max)).count() as u64)
                .unwrap_or(0))
        })
    }

    async fn range_remove(&self, key: &str, min: ScoreBound, max: ScoreBound) -> Result<u64> {
        self.with_slot(op::ZREMRANGEBYSCORE, key, |slot, _| {
            if slot.scored(key)?.is_none() {
                return Ok(0);
            }
            let set = slot.scored_mut(key)?;
            let before = set.len();
            set.retain(|_, score| !in_range(*score, min, max));
            let removed = (before - set.len()) as u64;
            if set.is_empty() {
                slot.value = None;
                slot.expires_at = None;
            }
            Ok(removed)
        })
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_slot(op::ZADD, key, |slot, _| {
            slot.scored_mut(key)?.insert(member.to_string(), score);
            Ok(())
        })
    }

    async fn record_scored(
        &self,
        key: &str,
        prune_max: ScoreBound,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<u64> {
        self.with_slot(op::RECORD, key, |slot, now| {
            let set = slot.scored_mut(key)?;
            set.retain(|_, s| !in_range(*s, ScoreBound::NegInf, prune_max));
            set.insert(member.to_string(), score);
            let count = set.len() as u64;
            if !ttl.is_zero() {
                slot.expires_at = now.checked_add_signed(to_chrono(ttl));
            }
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use chrono::TimeZone;

    fn store() -> (MemoryStore, ManualClock) {
        let manual = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 23, 10, 15, 30).unwrap());
        (MemoryStore::new(manual.clock()), manual)
    }

    #[tokio::test]
    async fn test_increment_creates_and_adds() {
        let (store, _) = store();
        assert_eq!(store.increment("k", 1).await.unwrap(), 1);
        assert_eq!(store.increment("k", 4).await.unwrap(), 5);
        assert_eq!(store.get("k").await.unwrap(), Some("5".to_string()));
    }

    #[tokio::test]
    async fn test_increment_rejects_non_numeric() {
        let (store, _) = store();
        store.set("k", "banana").await.unwrap();
        let err = store.increment("k", 1).await.unwrap_err();
        assert!(matches!(err, TurnstileError::MalformedValue { .. }));
    }

    #[tokio::test]
    async fn test_expiry_follows_injected_clock() {
        let (store, clock) = store();
        store.increment("k", 1).await.unwrap();
        assert_eq!(store.expiry("k").await.unwrap(), None);

        store.set_expiry("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.expiry("k").await.unwrap(), Some(Duration::from_secs(60)));

        clock.advance(Duration::from_secs(59));
        assert_eq!(store.expiry("k").await.unwrap(), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.expiry("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_expiry_on_absent_key_is_noop() {
        let (store, _) = store();
        store.set_expiry("missing", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.expiry("missing").await.unwrap(), None);
        assert_eq!(store.increment("missing", 1).await.unwrap(), 1);
        assert_eq!(store.expiry("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent_and_compare_and_swap() {
        let (store, _) = store();
        assert!(store.set_if_absent("k", "1").await.unwrap());
        assert!(!store.set_if_absent("k", "2").await.unwrap());

        assert!(!store.compare_and_swap("k", "2", "3").await.unwrap());
        assert!(store.compare_and_swap("k", "1", "3").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("3".to_string()));
        assert!(!store.compare_and_swap("absent", "1", "2").await.unwrap());
    }

    #[tokio::test]
    async fn test_scored_range_operations() {
        let (store, _) = store();
        for (member, score) in [("a", 100.0), ("b", 200.0), ("c", 300.0)] {
            store.add_scored("log", member, score).await.unwrap();
        }

        let count = store
            .range_count("log", ScoreBound::Exclusive(100.0), ScoreBound::PosInf)
            .await
            .unwrap();
        assert_eq!(count, 2);

        let removed = store
            .range_remove("log", ScoreBound::NegInf, ScoreBound::Inclusive(200.0))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let count = store
            .range_count("log", ScoreBound::NegInf, ScoreBound::PosInf)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_record_scored_prunes_inserts_and_expires() {
        let (store, clock) = store();
        store.add_scored("log", "old", 10.0).await.unwrap();
        store.add_scored("log", "edge", 20.0).await.unwrap();
        store.add_scored("log", "fresh", 30.0).await.unwrap();

        let count = store
            .record_scored("log", ScoreBound::Inclusive(20.0), "new", 40.0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.expiry("log").await.unwrap(), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_reported() {
        let (store, _) = store();
        store.add_scored("log", "a", 1.0).await.unwrap();
        assert!(store.get("log").await.is_err());
        assert!(store.increment("log", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_scored_write_on_scalar_keeps_scalar() {
        let (store, _) = store();
        store.set("n", "5").await.unwrap();

        let err = store.add_scored("n", "a", 1.0).await.unwrap_err();
        assert!(matches!(err, TurnstileError::MalformedValue { .. }));
        assert_eq!(store.get("n").await.unwrap(), Some("5".to_string()));

        store.add_scored("fresh", "a", 1.0).await.unwrap();
        assert_eq!(
            store.range_count("fresh", ScoreBound::NegInf, ScoreBound::PosInf).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let (store, _) = store();
        store.fail_next(op::INCRBY, 1);

        let err = store.increment("k", 1).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Store { op: "INCRBY", .. }));
        assert_eq!(store.increment("k", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_drops_stale_slots() {
        let (store, clock) = store();
        store.increment("a", 1).await.unwrap();
        store.increment("b", 1).await.unwrap();
        store.set_expiry("a", Duration::from_millis(500)).await.unwrap();

        clock.advance(Duration::from_secs(1));
        store.purge_expired();
        assert_eq!(store.len(), 1);
    }
}
