//! C13 — Auth / rate-limit gate. Resolves the caller's ApiKey, admits it
//! under the key's own concurrency limit (same sorted-set protocol as C4),
//! enforces cost and request-rate limits, and releases on completion.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::concurrency::ConcurrencyGuard;
use crate::cost;
use crate::error::{RelayError, RelayResult};
use crate::kv::{self, Kv};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key_material: String,
    pub name: String,
    pub enabled: bool,
    pub claude_account_id: Option<String>,
    pub total_cost_limit: f64,
    pub daily_cost_limit: f64,
    pub concurrency_limit: u32,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u32,
}

const RECORD_FIELD: &str = "record";

pub async fn create_api_key(kv: &Kv, key: &ApiKey) -> RelayResult<()> {
    let record = serde_json::to_string(key).map_err(|e| RelayError::Internal(e.to_string()))?;
    kv.hset(&kv::api_key_key(&key.id), RECORD_FIELD, &record).await?;
    kv.set(&kv::api_key_lookup_key(&key.key_material), &key.id, None).await
}

pub async fn get_api_key(kv: &Kv, id: &str) -> RelayResult<Option<ApiKey>> {
    let raw = kv.hget(&kv::api_key_key(id), RECORD_FIELD).await?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

/// Resolves opaque key material to a record; rejects missing/disabled
/// keys with the same error so callers can't distinguish "wrong key" from
/// "disabled key" by timing or shape.
pub async fn resolve(kv: &Kv, key_material: &str) -> RelayResult<ApiKey> {
    let id = kv
        .get(&kv::api_key_lookup_key(key_material))
        .await?
        .ok_or_else(|| RelayError::Auth("invalid api key".to_string()))?;
    let key = get_api_key(kv, &id).await?.ok_or_else(|| RelayError::Auth("invalid api key".to_string()))?;
    if !key.enabled {
        return Err(RelayError::Auth("api key disabled".to_string()));
    }
    Ok(key)
}

/// Admits the key under its own concurrency limit. The returned guard's
/// lease doubles as the "absolute timeout safety net" from section 4.13:
/// it expires after `request_timeout` regardless of whether any release
/// path ever runs, bounding leakage from a crashed event handler.
pub async fn admit_concurrency(kv: &Kv, key: &ApiKey, request_id: &str) -> RelayResult<ConcurrencyGuard> {
    let concurrency_key = kv::key_concurrency_key(&key.id);
    ConcurrencyGuard::acquire(kv, &concurrency_key, key.concurrency_limit, request_id).await
}

pub async fn enforce_cost_limits(kv: &Kv, key: &ApiKey) -> RelayResult<()> {
    let stats = cost::get_cost_stats(kv, &key.id, true).await?;
    if key.total_cost_limit > 0.0 && stats.total >= key.total_cost_limit {
        return Err(RelayError::Quota(format!(
            "total cost limit reached: {:.6}/{:.6}",
            stats.total, key.total_cost_limit
        )));
    }
    if key.daily_cost_limit > 0.0 && stats.daily >= key.daily_cost_limit {
        return Err(RelayError::Quota(format!(
            "daily cost limit reached: {:.6}/{:.6}",
            stats.daily, key.daily_cost_limit
        )));
    }
    Ok(())
}

fn rate_limit_key(key_id: &str) -> String {
    format!("rate_limit:{key_id}")
}

/// Sliding request-rate window via a sorted set: each request adds a
/// member timestamped `now`, trims anything outside the window, and
/// counts what's left.
pub async fn enforce_rate_limit(kv: &Kv, key: &ApiKey, request_id: &str) -> RelayResult<()> {
    if key.rate_limit_requests == 0 {
        return Ok(());
    }
    let rl_key = rate_limit_key(&key.id);
    let now = kv::now_ms();
    let window_ms = key.rate_limit_window_secs as i64 * 1000;
    kv.zremrangebyscore(&rl_key, (now - window_ms) as f64).await?;
    let count = kv.zcard(&rl_key).await?;
    if count >= key.rate_limit_requests as u64 {
        return Err(RelayError::RateLimit(format!(
            "rate limit exceeded: {}/{} per {}s",
            count, key.rate_limit_requests, key.rate_limit_window_secs
        )));
    }
    kv.zadd(&rl_key, request_id, now as f64).await?;
    kv.zset_expire(&rl_key, Duration::from_secs(key.rate_limit_window_secs as u64)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> ApiKey {
        ApiKey {
            id: "key-1".to_string(),
            key_material: "cr_abc123".to_string(),
            name: "test".to_string(),
            enabled: true,
            claude_account_id: None,
            total_cost_limit: 10.0,
            daily_cost_limit: 0.0,
            concurrency_limit: 1,
            rate_limit_requests: 2,
            rate_limit_window_secs: 60,
        }
    }

    #[tokio::test]
    async fn resolve_rejects_disabled_key() {
        let kv = Kv::in_memory();
        let mut key = sample_key();
        key.enabled = false;
        create_api_key(&kv, &key).await.unwrap();
        assert!(resolve(&kv, "cr_abc123").await.is_err());
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_material() {
        let kv = Kv::in_memory();
        assert!(resolve(&kv, "cr_nope").await.is_err());
    }

    #[tokio::test]
    async fn cost_limit_enforced_after_threshold() {
        let kv = Kv::in_memory();
        let key = sample_key();
        create_api_key(&kv, &key).await.unwrap();
        cost::increment_cost(&kv, &key.id, 10.0, "claude-sonnet-4-5-20250929").await.unwrap();
        assert!(enforce_cost_limits(&kv, &key).await.is_err());
    }

    #[tokio::test]
    async fn rate_limit_trips_after_window_fills() {
        let kv = Kv::in_memory();
        let key = sample_key();
        enforce_rate_limit(&kv, &key, "req-1").await.unwrap();
        enforce_rate_limit(&kv, &key, "req-2").await.unwrap();
        assert!(enforce_rate_limit(&kv, &key, "req-3").await.is_err());
    }
}
