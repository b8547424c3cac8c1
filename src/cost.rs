//! C2 — Cost accounting. Single source of truth for total/daily cost
//! counters and the per-key transaction log.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::RelayResult;
use crate::kv::{self, Kv};

/// Transaction-log entries older than this are dropped on each append.
const LOG_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct CostStats {
    pub total: f64,
    pub daily: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub timestamp: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost: f64,
    /// `None` means the key has no total cost limit (unlimited quota).
    /// `serde_json` serializes `f64::INFINITY` as `null`, which silently
    /// fails to deserialize back into a plain `f64` field — using `Option`
    /// instead makes "unlimited" a value this type can actually round-trip.
    pub remaining_quota: Option<f64>,
}

fn today_yyyymmdd() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

/// Atomically increments the total, daily, and per-model counters for
/// `key_id`. Returns nothing — callers that need the post-increment total
/// must follow with a `forceRefresh` read via `get_cost_stats`, per the
/// 2→3→4 ordering in the usage recorder.
pub async fn increment_cost(kv: &Kv, key_id: &str, usd: f64, model: &str) -> RelayResult<()> {
    let day = today_yyyymmdd();
    kv.incrbyfloat(&kv::cost_total_key(key_id), usd).await?;
    let daily_key = kv::cost_daily_key(key_id, &day);
    kv.incrbyfloat(&daily_key, usd).await?;
    kv.set_expire(&daily_key, std::time::Duration::from_secs(48 * 3600)).await?;
    kv.incrbyfloat(&kv::cost_model_key(key_id, model), usd).await?;
    Ok(())
}

/// The only sanctioned way to read cost for a quota decision is with
/// `forceRefresh=true`. Since there is no in-process cache (see `kv` module
/// doc), this parameter has nothing to bypass today — kept so callers
/// document intent and a future cache layer can't silently go stale under
/// them.
pub async fn get_cost_stats(kv: &Kv, key_id: &str, _force_refresh: bool) -> RelayResult<CostStats> {
    let total = kv
        .get(&kv::cost_total_key(key_id))
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    let daily = kv
        .get(&kv::cost_daily_key(key_id, &today_yyyymmdd()))
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);
    Ok(CostStats { total, daily })
}

pub async fn append_transaction_log(kv: &Kv, key_id: &str, entry: &TransactionLogEntry) -> RelayResult<()> {
    let key = kv::transaction_log_key(key_id);
    let member = serde_json::to_string(entry).map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;
    kv.zadd(&key, &member, entry.timestamp as f64).await?;
    kv.zremrangebyscore(&key, (kv::now_ms() - LOG_RETENTION_MS) as f64).await?;
    kv.zset_expire(&key, std::time::Duration::from_millis(LOG_RETENTION_MS as u64)).await?;
    Ok(())
}

pub async fn get_transaction_logs(
    kv: &Kv,
    key_id: &str,
    from: i64,
    to: i64,
    page: usize,
    page_size: usize,
) -> RelayResult<Vec<TransactionLogEntry>> {
    let key = kv::transaction_log_key(key_id);
    let limit = page.saturating_mul(page_size) + page_size;
    let raw = kv.zrevrangebyscore(&key, from as f64, to as f64, Some(limit)).await?;
    let skip = page.saturating_mul(page_size);
    let entries: Vec<TransactionLogEntry> = raw
        .into_iter()
        .skip(skip)
        .filter_map(|(member, _)| serde_json::from_str(&member).ok())
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increment_then_forced_read_sees_new_total() {
        let kv = Kv::in_memory();
        increment_cost(&kv, "key-1", 0.012, "claude-sonnet-4-5-20250929").await.unwrap();
        let stats = get_cost_stats(&kv, "key-1", true).await.unwrap();
        assert!((stats.total - 0.012).abs() < 1e-9);
        assert!((stats.daily - 0.012).abs() < 1e-9);
    }

    #[tokio::test]
    async fn transaction_log_round_trips_remaining_quota() {
        let kv = Kv::in_memory();
        increment_cost(&kv, "key-1", 0.012, "claude-sonnet-4-5-20250929").await.unwrap();
        let stats = get_cost_stats(&kv, "key-1", true).await.unwrap();
        let entry = TransactionLogEntry {
            timestamp: kv::now_ms(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            input_tokens: 100,
            output_tokens: 200,
            cache_create_tokens: 0,
            cache_read_tokens: 0,
            cost: 0.012,
            remaining_quota: Some(1000.0 - stats.total),
        };
        append_transaction_log(&kv, "key-1", &entry).await.unwrap();
        let logs = get_transaction_logs(&kv, "key-1", 0, kv::now_ms() + 1, 0, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!((logs[0].remaining_quota.unwrap() - (1000.0 - 0.012)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn transaction_log_round_trips_unlimited_quota() {
        let kv = Kv::in_memory();
        let entry = TransactionLogEntry {
            timestamp: kv::now_ms(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            input_tokens: 10,
            output_tokens: 10,
            cache_create_tokens: 0,
            cache_read_tokens: 0,
            cost: 0.001,
            remaining_quota: None,
        };
        append_transaction_log(&kv, "key-1", &entry).await.unwrap();
        let logs = get_transaction_logs(&kv, "key-1", 0, kv::now_ms() + 1, 0, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].remaining_quota, None);
    }
}
