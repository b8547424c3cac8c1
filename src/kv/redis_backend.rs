//! Redis-backed KV adapter. Mirrors `memory::MemoryBackend`'s operation set;
//! atomic multi-step operations (concurrency acquire/release/refresh) are
//! single Lua scripts so they stay atomic across concurrent callers sharing
//! one Redis instance.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};

use crate::error::{RelayError, RelayResult};

static ACQUIRE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return redis.call('ZCARD', KEYS[1])
"#,
    )
});

static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
return 1
"#,
    )
});

static REFRESH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if score then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 1
else
  return 0
end
"#,
    )
});

pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> RelayResult<Self> {
        let client = redis::Client::open(url).map_err(|e| RelayError::Kv(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> RelayResult<()> {
        let mut conn = self.conn();
        let res: RedisResult<()> = match ttl {
            Some(d) => conn.set_ex(key, value, d.as_secs().max(1)).await,
            None => conn.set(key, value).await,
        };
        res.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn get(&self, key: &str) -> RelayResult<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn del(&self, key: &str) -> RelayResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.del(key).await.map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> RelayResult<()> {
        let mut conn = self.conn();
        conn.hset(key, field, value).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn hget(&self, key: &str, field: &str) -> RelayResult<Option<String>> {
        let mut conn = self.conn();
        conn.hget(key, field).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn hgetall(&self, key: &str) -> RelayResult<HashMap<String, String>> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn hdel(&self, key: &str, field: &str) -> RelayResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.hdel(key, field).await.map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let mut conn = self.conn();
        let pattern = format!("{prefix}*");
        conn.keys(pattern).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn incrbyfloat(&self, key: &str, delta: f64) -> RelayResult<f64> {
        let mut conn = self.conn();
        redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn set_expire(&self, key: &str, ttl: Duration) -> RelayResult<()> {
        let mut conn = self.conn();
        let _: bool = conn
            .expire(key, ttl.as_secs() as i64)
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(())
    }

    /// `PTTL`: `None` when the key has no TTL or doesn't exist (redis
    /// returns `-1`/`-2` respectively for those cases).
    pub async fn ttl_remaining(&self, key: &str) -> RelayResult<Option<Duration>> {
        let mut conn = self.conn();
        let ms: i64 = conn.pttl(key).await.map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(if ms < 0 { None } else { Some(Duration::from_millis(ms as u64)) })
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> RelayResult<()> {
        let mut conn = self.conn();
        conn.zadd(key, member, score).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn zrem(&self, key: &str, member: &str) -> RelayResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zrem(key, member).await.map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn zremrangebyscore(&self, key: &str, max_exclusive_below: f64) -> RelayResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn
            .zrembyscore(key, "-inf", format!("({max_exclusive_below}"))
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> RelayResult<u64> {
        let mut conn = self.conn();
        conn.zcard(key).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn zscore(&self, key: &str, member: &str) -> RelayResult<Option<f64>> {
        let mut conn = self.conn();
        conn.zscore(key, member).await.map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn zrevrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> RelayResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let items: Vec<(String, f64)> = match limit {
            Some(n) => {
                conn.zrevrangebyscore_limit_withscores(key, max, min, 0, n as isize)
                    .await
            }
            None => conn.zrevrangebyscore_withscores(key, max, min).await,
        }
        .map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(items)
    }

    pub async fn zset_set_expire(&self, key: &str, ttl: Duration) -> RelayResult<()> {
        self.set_expire(key, ttl).await
    }

    /// Atomic `ZREMRANGEBYSCORE(-inf, now)` + `ZADD(expire_at, member)` +
    /// `PEXPIRE(lease+margin)`, returning the resulting `ZCARD`.
    pub async fn acquire(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        expire_at_ms: i64,
        pexpire_ms: i64,
    ) -> RelayResult<u64> {
        let mut conn = self.conn();
        ACQUIRE_SCRIPT
            .key(key)
            .arg(now_ms)
            .arg(expire_at_ms)
            .arg(member)
            .arg(pexpire_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))
    }

    pub async fn release(&self, key: &str, member: &str, now_ms: i64) -> RelayResult<()> {
        let mut conn = self.conn();
        let _: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(member)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn refresh(&self, key: &str, member: &str, expire_at_ms: i64) -> RelayResult<bool> {
        let mut conn = self.conn();
        let updated: i64 = REFRESH_SCRIPT
            .key(key)
            .arg(member)
            .arg(expire_at_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RelayError::Kv(e.to_string()))?;
        Ok(updated == 1)
    }
}
