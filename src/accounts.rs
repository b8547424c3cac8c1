//! C3 — Account store. Per-account records backed by a hash, plus the
//! 5xx/stream-timeout/session-id ledgers that share the account's key
//! prefix as separate sorted sets.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ProxyPolicy;
use crate::error::RelayResult;
use crate::kv::{self, Kv, ACCOUNT_AUX_SUFFIXES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    Overloaded,
    TempError,
    Unauthorized,
    Blocked,
    QuotaExceeded,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::Overloaded => "overloaded",
            AccountStatus::TempError => "temp_error",
            AccountStatus::Unauthorized => "unauthorized",
            AccountStatus::Blocked => "blocked",
            AccountStatus::QuotaExceeded => "quota_exceeded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "rate_limited" => Some(AccountStatus::RateLimited),
            "overloaded" => Some(AccountStatus::Overloaded),
            "temp_error" => Some(AccountStatus::TempError),
            "unauthorized" => Some(AccountStatus::Unauthorized),
            "blocked" => Some(AccountStatus::Blocked),
            "quota_exceeded" => Some(AccountStatus::QuotaExceeded),
            _ => None,
        }
    }

    /// Only these are candidates for scheduling; `temp_error` and
    /// `rate_limited` recover on their own timer, `blocked`/`unauthorized`
    /// need manual recovery, and neither is ever schedulable directly.
    pub fn schedulable_default(&self) -> bool {
        matches!(self, AccountStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub platform: String,
    pub name: String,
    pub status: AccountStatus,
    pub schedulable: bool,
    pub priority: i64,
    pub last_used_at: i64,
    pub api_key: Option<String>,
    pub endpoints: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub session_id_limit_enabled: bool,
    pub session_id_max_count: u32,
    pub session_id_window_minutes: u32,
    pub proxy: Option<ProxyPolicy>,
    pub supported_models: Vec<String>,
    pub cost_multiplier: Option<f64>,
}

impl Account {
    /// Protects `api_key` (OAuth token / static credential) at rest via
    /// `config::protect` before serializing — a no-op identity transform off
    /// Windows, real DPAPI protection on it.
    fn to_hash_value(&self) -> RelayResult<String> {
        let mut stored = self.clone();
        stored.api_key = self.api_key.as_ref().map(|k| hex::encode(crate::config::protect(k.as_bytes())));
        serde_json::to_string(&stored).map_err(|e| crate::error::RelayError::Internal(e.to_string()))
    }

    fn from_hash_value(s: &str) -> Option<Self> {
        let mut account: Self = serde_json::from_str(s).ok()?;
        account.api_key = account.api_key.and_then(|stored| {
            let bytes = hex::decode(&stored).ok()?;
            String::from_utf8(crate::config::unprotect(&bytes)).ok()
        });
        Some(account)
    }
}

const RECORD_FIELD: &str = "record";

pub async fn create_account(kv: &Kv, account: &Account) -> RelayResult<()> {
    let key = kv::account_key(&account.platform, &account.id);
    kv.hset(&key, RECORD_FIELD, &account.to_hash_value()?).await
}

pub async fn update_account(kv: &Kv, account: &Account) -> RelayResult<()> {
    create_account(kv, account).await
}

pub async fn get_account(kv: &Kv, platform: &str, id: &str) -> RelayResult<Option<Account>> {
    let key = kv::account_key(platform, id);
    let raw = kv.hget(&key, RECORD_FIELD).await?;
    Ok(raw.and_then(|s| Account::from_hash_value(&s)))
}

/// Prefix-scans `account:{platform}:*`, filtering out the auxiliary ledger
/// keys that live under the same prefix — the "known bug category" the
/// account contract warns about.
pub async fn list_accounts(kv: &Kv, platform: &str) -> RelayResult<Vec<Account>> {
    let prefix = kv::account_prefix(platform);
    let keys = kv.keys_with_prefix(&prefix).await?;
    let mut out = Vec::new();
    for key in keys {
        if ACCOUNT_AUX_SUFFIXES.iter().any(|suf| key.ends_with(suf)) {
            continue;
        }
        if let Some(raw) = kv.hget(&key, RECORD_FIELD).await? {
            if let Some(acc) = Account::from_hash_value(&raw) {
                out.push(acc);
            }
        }
    }
    Ok(out)
}

/// Sets `status` and, for any non-active state, `schedulable=false`.
/// `ttl_seconds`, when given, marks a `:recover_at` key with that lifetime;
/// `sweep_recoveries` restores the account once that key has expired,
/// mirroring the spec's state machine where "any non-active --(timer)-->
/// active" is a background transition rather than something this call
/// schedules itself.
pub async fn mark_status(
    kv: &Kv,
    platform: &str,
    id: &str,
    status: AccountStatus,
    _reason_code: &str,
    ttl_seconds: Option<u64>,
) -> RelayResult<()> {
    if let Some(mut account) = get_account(kv, platform, id).await? {
        account.status = status;
        account.schedulable = status.schedulable_default();
        update_account(kv, &account).await?;
    }
    if let Some(ttl) = ttl_seconds {
        kv.set(&recover_at_key(platform, id), "1", Some(std::time::Duration::from_secs(ttl))).await?;
    }
    Ok(())
}

fn recover_at_key(platform: &str, id: &str) -> String {
    format!("{}:recover_at", kv::account_key(platform, id))
}

/// Restores any account whose `mark_status` cooldown has elapsed (the
/// `:recover_at` key expired) back to `active`/`schedulable`, clearing its
/// error ledgers. Accounts in `blocked`/`unauthorized`/`quota_exceeded` are
/// left alone — those states are never given a `recover_at` TTL and need
/// manual intervention instead.
pub async fn sweep_recoveries(kv: &Kv, platform: &str) -> RelayResult<usize> {
    let mut recovered = 0;
    for account in list_accounts(kv, platform).await? {
        if !matches!(account.status, AccountStatus::TempError | AccountStatus::RateLimited | AccountStatus::Overloaded) {
            continue;
        }
        if kv.get(&recover_at_key(platform, &account.id)).await?.is_some() {
            continue;
        }
        let mut account = account;
        account.status = AccountStatus::Active;
        account.schedulable = true;
        update_account(kv, &account).await?;
        clear_server_errors(kv, platform, &account.id).await?;
        clear_stream_timeouts(kv, platform, &account.id).await?;
        recovered += 1;
    }
    Ok(recovered)
}

const SERVER_ERROR_WINDOW_SECS: u64 = 5 * 60;
const STREAM_TIMEOUT_WINDOW_SECS: u64 = 60 * 60;

pub async fn record_server_error(kv: &Kv, platform: &str, id: &str, code: &str) -> RelayResult<()> {
    let key = kv::account_5xx_key(platform, id);
    let now = kv::now_ms();
    kv.zadd(&key, &format!("{now}:{code}"), now as f64).await?;
    kv.zremrangebyscore(&key, (now - SERVER_ERROR_WINDOW_SECS as i64 * 1000) as f64).await?;
    kv.zset_expire(&key, std::time::Duration::from_secs(SERVER_ERROR_WINDOW_SECS)).await?;
    Ok(())
}

pub async fn get_server_error_count(kv: &Kv, platform: &str, id: &str) -> RelayResult<u64> {
    let key = kv::account_5xx_key(platform, id);
    let now = kv::now_ms();
    kv.zremrangebyscore(&key, (now - SERVER_ERROR_WINDOW_SECS as i64 * 1000) as f64).await?;
    kv.zcard(&key).await
}

pub async fn clear_server_errors(kv: &Kv, platform: &str, id: &str) -> RelayResult<()> {
    kv.del(&kv::account_5xx_key(platform, id)).await
}

pub async fn record_stream_timeout(kv: &Kv, platform: &str, id: &str, reason: &str) -> RelayResult<()> {
    let key = kv::account_stream_timeout_key(platform, id);
    let now = kv::now_ms();
    kv.zadd(&key, &format!("{now}:{reason}"), now as f64).await?;
    kv.zremrangebyscore(&key, (now - STREAM_TIMEOUT_WINDOW_SECS as i64 * 1000) as f64).await?;
    kv.zset_expire(&key, std::time::Duration::from_secs(STREAM_TIMEOUT_WINDOW_SECS)).await?;
    Ok(())
}

pub async fn get_stream_timeout_count(kv: &Kv, platform: &str, id: &str) -> RelayResult<u64> {
    let key = kv::account_stream_timeout_key(platform, id);
    let now = kv::now_ms();
    kv.zremrangebyscore(&key, (now - STREAM_TIMEOUT_WINDOW_SECS as i64 * 1000) as f64).await?;
    kv.zcard(&key).await
}

pub async fn clear_stream_timeouts(kv: &Kv, platform: &str, id: &str) -> RelayResult<()> {
    kv.del(&kv::account_stream_timeout_key(platform, id)).await
}

pub async fn record_session_id(
    kv: &Kv,
    platform: &str,
    id: &str,
    session_id: &str,
    window_minutes: u32,
) -> RelayResult<()> {
    let key = kv::account_session_ids_key(platform, id);
    let now = kv::now_ms();
    kv.zadd(&key, session_id, now as f64).await?;
    let window_ms = window_minutes as i64 * 60 * 1000;
    kv.zremrangebyscore(&key, (now - window_ms) as f64).await?;
    kv.zset_expire(&key, std::time::Duration::from_secs(window_minutes as u64 * 60)).await?;
    Ok(())
}

pub async fn count_session_ids(kv: &Kv, platform: &str, id: &str, window_minutes: u32) -> RelayResult<u64> {
    let ids = get_session_ids(kv, platform, id, window_minutes).await?;
    Ok(ids.len() as u64)
}

pub async fn get_session_ids(kv: &Kv, platform: &str, id: &str, window_minutes: u32) -> RelayResult<Vec<String>> {
    let key = kv::account_session_ids_key(platform, id);
    let now = kv::now_ms();
    let window_ms = window_minutes as i64 * 60 * 1000;
    kv.zremrangebyscore(&key, (now - window_ms) as f64).await?;
    let raw = kv.zrevrangebyscore(&key, (now - window_ms) as f64, now as f64, None).await?;
    let mut seen = std::collections::HashSet::new();
    Ok(raw.into_iter().map(|(m, _)| m).filter(|m| seen.insert(m.clone())).collect())
}

pub fn now_epoch_secs() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            platform: "anthropic".to_string(),
            name: "test".to_string(),
            status: AccountStatus::Active,
            schedulable: true,
            priority: 0,
            last_used_at: 0,
            api_key: None,
            endpoints: vec![],
            max_concurrent_tasks: 5,
            session_id_limit_enabled: false,
            session_id_max_count: 0,
            session_id_window_minutes: 60,
            proxy: None,
            supported_models: vec!["claude-sonnet-4-5-20250929".to_string()],
            cost_multiplier: None,
        }
    }

    #[tokio::test]
    async fn api_key_round_trips_through_at_rest_protection() {
        let kv = Kv::in_memory();
        let mut acc = sample_account("acc-1");
        acc.api_key = Some("sk-test-credential".to_string());
        create_account(&kv, &acc).await.unwrap();

        let raw = kv.hget(&kv::account_key("anthropic", "acc-1"), RECORD_FIELD).await.unwrap().unwrap();
        assert!(!raw.contains("sk-test-credential"), "credential must not appear in plaintext in the stored record");

        let loaded = get_account(&kv, "anthropic", "acc-1").await.unwrap().unwrap();
        assert_eq!(loaded.api_key.as_deref(), Some("sk-test-credential"));
    }

    #[tokio::test]
    async fn create_and_list_excludes_aux_keys() {
        let kv = Kv::in_memory();
        create_account(&kv, &sample_account("acc-1")).await.unwrap();
        record_server_error(&kv, "anthropic", "acc-1", "502").await.unwrap();
        record_session_id(&kv, "anthropic", "acc-1", "sess-1", 60).await.unwrap();

        let accounts = list_accounts(&kv, "anthropic").await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].id, "acc-1");
    }

    #[tokio::test]
    async fn mark_status_clears_schedulable_on_non_active() {
        let kv = Kv::in_memory();
        create_account(&kv, &sample_account("acc-1")).await.unwrap();
        mark_status(&kv, "anthropic", "acc-1", AccountStatus::TempError, "5xx_threshold", None).await.unwrap();
        let acc = get_account(&kv, "anthropic", "acc-1").await.unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::TempError);
        assert!(!acc.schedulable);
    }

    #[tokio::test]
    async fn server_error_count_respects_window() {
        let kv = Kv::in_memory();
        record_server_error(&kv, "anthropic", "acc-1", "502").await.unwrap();
        record_server_error(&kv, "anthropic", "acc-1", "503").await.unwrap();
        assert_eq!(get_server_error_count(&kv, "anthropic", "acc-1").await.unwrap(), 2);
        clear_server_errors(&kv, "anthropic", "acc-1").await.unwrap();
        assert_eq!(get_server_error_count(&kv, "anthropic", "acc-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_timeout_count_respects_window() {
        let kv = Kv::in_memory();
        record_stream_timeout(&kv, "anthropic", "acc-1", "idle_timeout").await.unwrap();
        record_stream_timeout(&kv, "anthropic", "acc-1", "total_timeout").await.unwrap();
        assert_eq!(get_stream_timeout_count(&kv, "anthropic", "acc-1").await.unwrap(), 2);
        clear_stream_timeouts(&kv, "anthropic", "acc-1").await.unwrap();
        assert_eq!(get_stream_timeout_count(&kv, "anthropic", "acc-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_recoveries_restores_only_expired_cooldowns() {
        let kv = Kv::in_memory();
        create_account(&kv, &sample_account("acc-1")).await.unwrap();
        create_account(&kv, &sample_account("acc-2")).await.unwrap();

        // acc-1 cools down instantly (ttl=0, already expired by the time we sweep).
        mark_status(&kv, "anthropic", "acc-1", AccountStatus::TempError, "5xx_threshold", Some(0)).await.unwrap();
        // acc-2 has a long cooldown still in effect.
        mark_status(&kv, "anthropic", "acc-2", AccountStatus::Overloaded, "overload", Some(3600)).await.unwrap();
        record_server_error(&kv, "anthropic", "acc-1", "502").await.unwrap();

        let recovered = sweep_recoveries(&kv, "anthropic").await.unwrap();
        assert_eq!(recovered, 1);

        let acc1 = get_account(&kv, "anthropic", "acc-1").await.unwrap().unwrap();
        assert_eq!(acc1.status, AccountStatus::Active);
        assert!(acc1.schedulable);
        assert_eq!(get_server_error_count(&kv, "anthropic", "acc-1").await.unwrap(), 0);

        let acc2 = get_account(&kv, "anthropic", "acc-2").await.unwrap().unwrap();
        assert_eq!(acc2.status, AccountStatus::Overloaded);
        assert!(!acc2.schedulable);
    }

    #[tokio::test]
    async fn sweep_recoveries_leaves_blocked_accounts_alone() {
        let kv = Kv::in_memory();
        create_account(&kv, &sample_account("acc-1")).await.unwrap();
        mark_status(&kv, "anthropic", "acc-1", AccountStatus::Blocked, "manual", None).await.unwrap();

        let recovered = sweep_recoveries(&kv, "anthropic").await.unwrap();
        assert_eq!(recovered, 0);
        let acc = get_account(&kv, "anthropic", "acc-1").await.unwrap().unwrap();
        assert_eq!(acc.status, AccountStatus::Blocked);
    }
}
