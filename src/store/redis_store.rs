//! Redis-backed counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError, Script};
use tracing::{debug, info};

use super::{op, CounterStore, ScoreBound};
use crate::config::RedisConfig;
use crate::error::{Result, TurnstileError};

/// Swap the value only when it still holds the expected content.
const COMPARE_AND_SWAP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
"#;

/// A [`CounterStore`] talking to Redis over a multiplexed, self-reconnecting
/// connection.
///
/// Single commands are atomic in Redis; `record_scored` runs as a
/// `MULTI`/`EXEC` transaction and compare-and-swap as a Lua script.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    cas: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect using the given configuration.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        info!(url = %config.url, key_prefix = %config.key_prefix, "Connecting to Redis");

        let client = Client::open(config.url.as_str())
            .map_err(|e| TurnstileError::Config(format!("invalid Redis URL: {}", e)))?;

        let connect = ConnectionManager::new(client);
        let conn = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                TurnstileError::store(
                    "CONNECT",
                    &config.url,
                    RedisError::from((ErrorKind::IoError, "connection timed out")),
                )
            })?
            .map_err(|e| TurnstileError::store("CONNECT", &config.url, e))?;

        info!("Connected to Redis");

        Ok(Self::from_connection(conn, config.key_prefix.clone()))
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, key_prefix: String) -> Self {
        Self {
            conn,
            key_prefix,
            cas: Script::new(COMPARE_AND_SWAP),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Map a client error, surfacing type errors as malformed state.
    fn error(op: &'static str, key: &str, e: RedisError) -> TurnstileError {
        if e.code() == Some("WRONGTYPE") {
            return TurnstileError::malformed(key, "<wrong type>");
        }
        if e.detail().map_or(false, |d| d.contains("not an integer")) {
            return TurnstileError::malformed(key, "<non-integer>");
        }
        debug!(op = op, key = %key, error = %e, "Redis command failed");
        TurnstileError::store(op, key, e)
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().min(u64::MAX as u128) as u64
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::GET, key, e))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::SET, key, e))?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::SET_NX, key, e))?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, new: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.cas.key(self.namespaced(key));
        invocation.arg(expected).arg(new);
        let swapped: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::CAS, key, e))?;
        Ok(swapped == 1)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(self.namespaced(key))
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::INCRBY, key, e))?;
        Ok(value)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(self.namespaced(key))
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::PEXPIRE, key, e))?;
        Ok(())
    }

    async fn expiry(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::PTTL, key, e))?;
        // -2: no such key, -1: no expiry.
        Ok(if ttl > 0 {
            Some(Duration::from_millis(ttl as u64))
        } else {
            None
        })
    }

    async fn range_count(&self, key: &str, min: ScoreBound, max: ScoreBound) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(self.namespaced(key))
            .arg(min.to_string())
            .arg(max.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::ZCOUNT, key, e))?;
        Ok(count)
    }

    async fn range_remove(&self, key: &str, min: ScoreBound, max: ScoreBound) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.namespaced(key))
            .arg(min.to_string())
            .arg(max.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::ZREMRANGEBYSCORE, key, e))?;
        Ok(removed)
    }

    async fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.namespaced(key))
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::ZADD, key, e))?;
        Ok(())
    }

    async fn record_scored(
        &self,
        key: &str,
        prune_max: ScoreBound,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<u64> {
        let mut conn = self.conn.clone();
        let namespaced = self.namespaced(key);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&namespaced)
            .arg(ScoreBound::NegInf.to_string())
            .arg(prune_max.to_string())
            .ignore()
            .cmd("ZADD")
            .arg(&namespaced)
            .arg(score)
            .arg(member)
            .ignore();
        if !ttl.is_zero() {
            pipe.cmd("PEXPIRE").arg(&namespaced).arg(millis(ttl)).ignore();
        }
        pipe.cmd("ZCARD").arg(&namespaced);

        let (count,): (u64,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::error(op::RECORD, key, e))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::system_clock;
    use crate::ratelimit::{Context, Decision, FixedWindowLimiter, Request, Strategy};
    use std::sync::Arc;

    /// Live-server tests: `TURNSTILE_TEST_REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    async fn live_store() -> RedisStore {
        let url = std::env::var("TURNSTILE_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let config = RedisConfig {
            url,
            key_prefix: format!("turnstile-test:{}:", uuid::Uuid::new_v4()),
            ..RedisConfig::default()
        };
        RedisStore::connect(&config).await.unwrap()
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let config = RedisConfig {
            url: "not-a-url".to_string(),
            ..RedisConfig::default()
        };
        let err = RedisStore::connect(&config).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_scalar_operations() {
        let store = live_store().await;

        assert_eq!(store.increment("n", 1).await.unwrap(), 1);
        assert_eq!(store.get("n").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.expiry("n").await.unwrap(), None);

        store.set_expiry("n", Duration::from_secs(30)).await.unwrap();
        assert!(store.expiry("n").await.unwrap().is_some());

        assert!(store.set_if_absent("s", "a").await.unwrap());
        assert!(!store.set_if_absent("s", "b").await.unwrap());
        assert!(store.compare_and_swap("s", "a", "c").await.unwrap());
        assert!(!store.compare_and_swap("s", "a", "d").await.unwrap());

        store.set("bad", "xyz").await.unwrap();
        let err = store.increment("bad", 1).await.unwrap_err();
        assert!(matches!(err, TurnstileError::MalformedValue { .. }));
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_scored_operations() {
        let store = live_store().await;

        store.add_scored("log", "a", 100.0).await.unwrap();
        store.add_scored("log", "b", 200.0).await.unwrap();
        let count = store
            .record_scored("log", ScoreBound::Inclusive(100.0), "c", 300.0, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            store
                .range_count("log", ScoreBound::Exclusive(200.0), ScoreBound::PosInf)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_live_fixed_window_concurrency() {
        let store: Arc<dyn CounterStore> = Arc::new(live_store().await);
        let limiter = Arc::new(FixedWindowLimiter::new(store, system_clock()));
        let request = Request::new("shared", 10, Duration::from_secs(60));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    limiter.execute(&Context::background(), &request).await.unwrap()
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().decision == Decision::Allow {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
