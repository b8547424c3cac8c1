//! C4 — Concurrency admission. A sorted set per account (or per apiKey),
//! `score = expireAtMillis`, `member = requestId`. Every exit path releases
//! exactly once — `ConcurrencyGuard`'s `Drop` mirrors the donor app's
//! `LimitGuard`, spawning the release so it can run from a sync drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, RelayResult};
use crate::kv::Kv;

const DEFAULT_LEASE_MS: i64 = 10 * 60 * 1000;
const DEFAULT_MARGIN_MS: i64 = 30_000;
const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Acquires a slot under `key`; releases it on drop (at most once — a
/// second drop, or an explicit `release()` followed by a drop, is a no-op).
pub struct ConcurrencyGuard {
    kv: Kv,
    key: String,
    request_id: String,
    released: Arc<AtomicBool>,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

impl ConcurrencyGuard {
    /// Tries to acquire a slot. Returns `Err(ConcurrencyFull)` when the
    /// resulting count exceeds `max_concurrent`; the slot is released
    /// before returning, per the admission protocol's "immediately release
    /// and fail" rule.
    pub async fn acquire(kv: &Kv, key: &str, max_concurrent: u32, request_id: &str) -> RelayResult<Self> {
        if max_concurrent == 0 {
            return Ok(Self {
                kv: kv.clone(),
                key: key.to_string(),
                request_id: request_id.to_string(),
                released: Arc::new(AtomicBool::new(true)),
                refresher: None,
            });
        }
        let count = kv.lease_acquire(key, request_id, DEFAULT_LEASE_MS, DEFAULT_MARGIN_MS).await?;
        if count > max_concurrent as u64 {
            kv.lease_release(key, request_id).await?;
            return Err(RelayError::ConcurrencyFull(format!(
                "account at capacity: {count}/{max_concurrent}"
            )));
        }
        Ok(Self {
            kv: kv.clone(),
            key: key.to_string(),
            request_id: request_id.to_string(),
            released: Arc::new(AtomicBool::new(false)),
            refresher: None,
        })
    }

    /// Starts a background ticker that refreshes this lease every 5 min,
    /// for the lifetime of a streaming request.
    pub fn spawn_refresher(&mut self) {
        let kv = self.kv.clone();
        let key = self.key.clone();
        let request_id = self.request_id.clone();
        let released = Arc::clone(&self.released);
        self.refresher = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                if released.load(Ordering::SeqCst) {
                    break;
                }
                let _ = kv.lease_refresh(&key, &request_id, DEFAULT_LEASE_MS).await;
            }
        }));
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = &self.refresher {
            handle.abort();
        }
        let _ = self.kv.lease_release(&self.key, &self.request_id).await;
    }
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = &self.refresher {
            handle.abort();
        }
        let kv = self.kv.clone();
        let key = self.key.clone();
        let request_id = self.request_id.clone();
        tokio::spawn(async move {
            let _ = kv.lease_release(&key, &request_id).await;
        });
    }
}

pub async fn count(kv: &Kv, key: &str) -> RelayResult<u64> {
    kv.lease_count(key).await
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub key: String,
    pub removed: u64,
}

/// Sweeps every concurrency key under `prefix`, trimming expired members.
/// `removed` is approximate (cardinality before minus after); exact-count
/// isn't worth a second atomic script for a maintenance sweep.
pub async fn cleanup_all(kv: &Kv, prefix: &str) -> RelayResult<Vec<CleanupReport>> {
    let keys = kv.zset_keys_with_prefix(prefix).await?;
    let mut reports = Vec::with_capacity(keys.len());
    for key in keys {
        let before = kv.zcard(&key).await?;
        let after = kv.lease_count(&key).await?;
        reports.push(CleanupReport { key, removed: before.saturating_sub(after) });
    }
    Ok(reports)
}

#[derive(Debug, Clone)]
pub struct StaleRecord {
    pub key: String,
    pub member: String,
    pub age_minutes: f64,
}

/// Reports leases older than `max_age_minutes` that are still live —
/// surfaced by the health endpoint as a sign of a refresher that stopped
/// ticking (e.g. a crashed stream handler).
pub async fn get_stale_records(kv: &Kv, prefix: &str, max_age_minutes: f64) -> RelayResult<Vec<StaleRecord>> {
    let keys = kv.zset_keys_with_prefix(prefix).await?;
    let now = crate::kv::now_ms() as f64;
    let mut stale = Vec::new();
    for key in keys {
        let members = kv.zrevrangebyscore(&key, f64::MIN, f64::MAX, None).await?;
        for (member, expire_at) in members {
            let age_minutes = (now - (expire_at - DEFAULT_LEASE_MS as f64)) / 60_000.0;
            if age_minutes > max_age_minutes {
                stale.push(StaleRecord { key: key.clone(), member, age_minutes });
            }
        }
    }
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_over_limit_releases_and_fails() {
        let kv = Kv::in_memory();
        let key = crate::kv::concurrency_key("acc-1");
        let _g1 = ConcurrencyGuard::acquire(&kv, &key, 1, "req-1").await.unwrap();
        let err = ConcurrencyGuard::acquire(&kv, &key, 1, "req-2").await.unwrap_err();
        assert!(matches!(err, RelayError::ConcurrencyFull(_)));
        assert_eq!(count(&kv, &key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drop_releases_exactly_once() {
        let kv = Kv::in_memory();
        let key = crate::kv::concurrency_key("acc-2");
        {
            let guard = ConcurrencyGuard::acquire(&kv, &key, 2, "req-1").await.unwrap();
            guard.release().await;
            assert_eq!(count(&kv, &key).await.unwrap(), 0);
            // drop on an already-released guard must not re-release or panic
        }
        assert_eq!(count(&kv, &key).await.unwrap(), 0);
    }
}
