//! C1 — KV store adapter.
//!
//! Typed wrapper over a shared key/value store: hashes for account and
//! ApiKey records, sorted sets for concurrency leases/ledgers/logs, scalar
//! counters for cost, and a couple of atomic scripts for the operations
//! that must not interleave. Two backends share one surface, dispatched by
//! a plain enum rather than a boxed trait object — the same shape the donor
//! codebase uses for its provider handlers, and it sidesteps the
//! object-safety problems of `async fn` in traits.
//!
//! There is no in-process read cache here, so `forceRefresh` from the spec
//! has nothing to bypass: every read already goes straight to the backend.
//! Recorded as a decided Open Question in DESIGN.md rather than modeled as
//! a parameter that would always be `true`.

pub mod memory;
pub mod redis_backend;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::error::{RelayError, RelayResult};
use memory::MemoryBackend;
use redis_backend::RedisBackend;

#[derive(Clone)]
pub struct Kv {
    backend: std::sync::Arc<Backend>,
}

enum Backend {
    Redis(RedisBackend),
    Memory(MemoryBackend),
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Kv {
    pub async fn connect_redis(url: &str) -> RelayResult<Self> {
        let backend = RedisBackend::connect(url).await?;
        Ok(Self { backend: std::sync::Arc::new(Backend::Redis(backend)) })
    }

    pub fn in_memory() -> Self {
        Self { backend: std::sync::Arc::new(Backend::Memory(MemoryBackend::new())) }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.set(key, value, ttl).await,
            Backend::Memory(m) => {
                m.set(key, value, ttl).await;
                Ok(())
            }
        }
    }

    pub async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        match &*self.backend {
            Backend::Redis(r) => r.get(key).await,
            Backend::Memory(m) => Ok(m.get(key).await),
        }
    }

    pub async fn del(&self, key: &str) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.del(key).await,
            Backend::Memory(m) => {
                m.del(key).await;
                Ok(())
            }
        }
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.hset(key, field, value).await,
            Backend::Memory(m) => {
                m.hset(key, field, value).await;
                Ok(())
            }
        }
    }

    pub async fn hget(&self, key: &str, field: &str) -> RelayResult<Option<String>> {
        match &*self.backend {
            Backend::Redis(r) => r.hget(key, field).await,
            Backend::Memory(m) => Ok(m.hget(key, field).await),
        }
    }

    pub async fn hgetall(&self, key: &str) -> RelayResult<HashMap<String, String>> {
        match &*self.backend {
            Backend::Redis(r) => r.hgetall(key).await,
            Backend::Memory(m) => Ok(m.hgetall(key).await),
        }
    }

    pub async fn hdel(&self, key: &str, field: &str) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.hdel(key, field).await,
            Backend::Memory(m) => {
                m.hdel(key, field).await;
                Ok(())
            }
        }
    }

    /// Scans by prefix. Callers owning a prefix that also hosts auxiliary
    /// sub-keys (`:5xx_errors`, `:session_ids`, ...) must filter those back
    /// out themselves — see `accounts::list_accounts` for the one place
    /// that matters.
    pub async fn keys_with_prefix(&self, prefix: &str) -> RelayResult<Vec<String>> {
        match &*self.backend {
            Backend::Redis(r) => r.keys_with_prefix(prefix).await,
            Backend::Memory(m) => Ok(m.keys_with_prefix(prefix).await),
        }
    }

    pub async fn incrbyfloat(&self, key: &str, delta: f64) -> RelayResult<f64> {
        match &*self.backend {
            Backend::Redis(r) => r.incrbyfloat(key, delta).await,
            Backend::Memory(m) => Ok(m.incrbyfloat(key, delta).await),
        }
    }

    pub async fn set_expire(&self, key: &str, ttl: Duration) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.set_expire(key, ttl).await,
            Backend::Memory(m) => {
                m.set_expire(key, ttl).await;
                Ok(())
            }
        }
    }

    /// Remaining TTL on a string key, or `None` if it has none (or is
    /// missing/expired). Backs `session::extend_if_below`'s threshold check.
    pub async fn ttl_remaining(&self, key: &str) -> RelayResult<Option<Duration>> {
        match &*self.backend {
            Backend::Redis(r) => r.ttl_remaining(key).await,
            Backend::Memory(m) => Ok(m.ttl_remaining(key).await),
        }
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.zadd(key, member, score).await,
            Backend::Memory(m) => {
                m.zadd(key, member, score).await;
                Ok(())
            }
        }
    }

    pub async fn zrem(&self, key: &str, member: &str) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.zrem(key, member).await,
            Backend::Memory(m) => {
                m.zrem(key, member).await;
                Ok(())
            }
        }
    }

    pub async fn zremrangebyscore(&self, key: &str, max_exclusive_below: f64) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.zremrangebyscore(key, max_exclusive_below).await,
            Backend::Memory(m) => {
                m.zremrangebyscore(key, max_exclusive_below).await;
                Ok(())
            }
        }
    }

    pub async fn zcard(&self, key: &str) -> RelayResult<u64> {
        match &*self.backend {
            Backend::Redis(r) => r.zcard(key).await,
            Backend::Memory(m) => Ok(m.zcard(key).await),
        }
    }

    pub async fn zscore(&self, key: &str, member: &str) -> RelayResult<Option<f64>> {
        match &*self.backend {
            Backend::Redis(r) => r.zscore(key, member).await,
            Backend::Memory(m) => Ok(m.zscore(key, member).await),
        }
    }

    pub async fn zrevrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> RelayResult<Vec<(String, f64)>> {
        match &*self.backend {
            Backend::Redis(r) => r.zrevrangebyscore(key, min, max, limit).await,
            Backend::Memory(m) => Ok(m.zrevrangebyscore(key, min, max, limit).await),
        }
    }

    pub async fn zset_expire(&self, key: &str, ttl: Duration) -> RelayResult<()> {
        match &*self.backend {
            Backend::Redis(r) => r.zset_set_expire(key, ttl).await,
            Backend::Memory(m) => {
                m.zset_set_expire(key, ttl).await;
                Ok(())
            }
        }
    }

    pub async fn zset_keys_with_prefix(&self, prefix: &str) -> RelayResult<Vec<String>> {
        match &*self.backend {
            Backend::Redis(r) => r.keys_with_prefix(prefix).await,
            Backend::Memory(m) => Ok(m.zset_keys_with_prefix(prefix).await),
        }
    }

    /// C4 primitive: atomically trim expired members, add `member` with
    /// score `now_ms + lease_ms`, extend the key's own TTL, return the
    /// resulting cardinality.
    pub async fn lease_acquire(&self, key: &str, member: &str, lease_ms: i64, margin_ms: i64) -> RelayResult<u64> {
        let now = now_ms();
        let expire_at = now + lease_ms;
        match &*self.backend {
            Backend::Redis(r) => r.acquire(key, member, now, expire_at, lease_ms + margin_ms).await,
            Backend::Memory(m) => Ok(m.acquire(key, member, now, expire_at).await),
        }
    }

    pub async fn lease_release(&self, key: &str, member: &str) -> RelayResult<()> {
        let now = now_ms();
        match &*self.backend {
            Backend::Redis(r) => r.release(key, member, now).await,
            Backend::Memory(m) => {
                m.release(key, member, now).await;
                Ok(())
            }
        }
    }

    pub async fn lease_refresh(&self, key: &str, member: &str, lease_ms: i64) -> RelayResult<bool> {
        let expire_at = now_ms() + lease_ms;
        match &*self.backend {
            Backend::Redis(r) => r.refresh(key, member, expire_at).await,
            Backend::Memory(m) => Ok(m.refresh(key, member, expire_at).await),
        }
    }

    /// C4 `count`: trim expired, then report cardinality.
    pub async fn lease_count(&self, key: &str) -> RelayResult<u64> {
        self.zremrangebyscore(key, now_ms() as f64).await?;
        self.zcard(key).await
    }
}

// --- Key prefixes & builders (section 6 table) -----------------------------

pub fn api_key_key(id: &str) -> String {
    format!("api_key:{id}")
}

/// Opaque key material never doubles as the record's id — this maps the
/// material a caller actually presents back to the `ApiKey.id` used
/// everywhere else (cost counters, concurrency, transaction log).
pub fn api_key_lookup_key(key_material: &str) -> String {
    format!("api_key_lookup:{key_material}")
}

pub fn account_prefix(platform: &str) -> String {
    format!("account:{platform}:")
}

pub fn account_key(platform: &str, id: &str) -> String {
    format!("account:{platform}:{id}")
}

pub fn account_5xx_key(platform: &str, id: &str) -> String {
    format!("account:{platform}:{id}:5xx_errors")
}

pub fn account_stream_timeout_key(platform: &str, id: &str) -> String {
    format!("account:{platform}:{id}:stream_timeouts")
}

pub fn account_session_ids_key(platform: &str, id: &str) -> String {
    format!("account:{platform}:{id}:session_ids")
}

/// Auxiliary suffixes that share an account's hash-key prefix but are
/// actually separate sorted sets. `list_accounts`-style prefix scans must
/// exclude these — reading one as an account hash is the "known bug
/// category" the spec calls out.
pub const ACCOUNT_AUX_SUFFIXES: &[&str] = &[":5xx_errors", ":stream_timeouts", ":session_ids"];

pub fn concurrency_key(account_id: &str) -> String {
    format!("concurrency:console_account:{account_id}")
}

pub fn key_concurrency_key(api_key_id: &str) -> String {
    format!("concurrency:{api_key_id}")
}

pub fn session_mapping_key(fingerprint: &str) -> String {
    format!("unified_claude_session_mapping:{fingerprint}")
}

pub fn cost_total_key(api_key_id: &str) -> String {
    format!("usage:cost:total:{api_key_id}")
}

pub fn cost_daily_key(api_key_id: &str, yyyymmdd: &str) -> String {
    format!("usage:cost:daily:{api_key_id}:{yyyymmdd}")
}

pub fn cost_model_key(api_key_id: &str, model: &str) -> String {
    format!("usage:cost:model:{api_key_id}:{model}")
}

pub fn transaction_log_key(api_key_id: &str) -> String {
    format!("transaction_log:{api_key_id}")
}

pub fn response_cache_key(fingerprint: &str) -> String {
    format!("response_cache:{fingerprint}")
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        RelayError::Kv(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_acquire_release_roundtrip() {
        let kv = Kv::in_memory();
        let key = concurrency_key("acc-1");
        assert_eq!(kv.lease_acquire(&key, "req-1", 60_000, 5_000).await.unwrap(), 1);
        assert_eq!(kv.lease_acquire(&key, "req-2", 60_000, 5_000).await.unwrap(), 2);
        kv.lease_release(&key, "req-1").await.unwrap();
        assert_eq!(kv.lease_count(&key).await.unwrap(), 1);
        // second release of the same member is a no-op
        kv.lease_release(&key, "req-1").await.unwrap();
        assert_eq!(kv.lease_count(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ttl_remaining_reflects_set_expire() {
        let kv = Kv::in_memory();
        kv.set("k", "v", Some(Duration::from_secs(60))).await.unwrap();
        let remaining = kv.ttl_remaining("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(60) && remaining > Duration::from_secs(55));
        assert_eq!(kv.ttl_remaining("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cost_increment_and_read() {
        let kv = Kv::in_memory();
        let key = cost_total_key("key-1");
        kv.incrbyfloat(&key, 0.012).await.unwrap();
        kv.incrbyfloat(&key, 0.008).await.unwrap();
        let v: f64 = kv.get(&key).await.unwrap().unwrap().parse().unwrap();
        assert!((v - 0.02).abs() < 1e-9);
    }
}
