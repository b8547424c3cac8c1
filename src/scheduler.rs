//! C6 — Scheduler. Picks an upstream account for a request: pinned account
//! first, then group, then a sticky session hit, then the open pool —
//! filtered by status/model/concurrency/session-id limit and ordered by
//! ascending priority then LRU `lastUsedAt`.
//!
//! The donor app's `routing.rs` sorts candidates by priority descending
//! ("highest wins"); this scheduler inverts that on purpose — the spec's
//! convention is "lower priority number is preferred".

use std::time::Duration;

use crate::accounts::{self, Account, AccountStatus};
use crate::concurrency;
use crate::error::{RelayError, RelayResult};
use crate::kv::{self, Kv};
use crate::session;

pub struct SchedulingInput<'a> {
    pub platform: &'a str,
    pub pinned_account_id: Option<&'a str>,
    pub pinned_group_id: Option<&'a str>,
    pub session_fingerprint: Option<&'a str>,
    pub requested_model: &'a str,
    pub excluded_accounts: &'a [String],
    pub current_session_id: Option<&'a str>,
    pub sticky_ttl: Duration,
    pub sticky_renewal_threshold: Duration,
    pub wait_enabled: bool,
    pub max_wait: Duration,
    pub poll_interval: Duration,
}

pub struct Selection {
    pub account: Account,
    pub fingerprint_recorded: bool,
}

fn supports_model(account: &Account, model: &str) -> bool {
    account.supported_models.is_empty()
        || account.supported_models.iter().any(|m| m == model)
        || is_main_model_match(account, model)
}

/// "Main model" rule: an account allow-listing a bare family name (e.g.
/// `claude-sonnet-4-5`) matches any dated variant of it.
fn is_main_model_match(account: &Account, model: &str) -> bool {
    account.supported_models.iter().any(|allowed| model.starts_with(allowed.as_str()))
}

fn is_eligible_status(status: AccountStatus) -> bool {
    matches!(status, AccountStatus::Active | AccountStatus::Unauthorized | AccountStatus::Overloaded)
}

async fn has_capacity(kv: &Kv, account: &Account) -> RelayResult<bool> {
    if account.max_concurrent_tasks == 0 {
        return Ok(true);
    }
    let key = crate::kv::concurrency_key(&account.id);
    let n = concurrency::count(kv, &key).await?;
    Ok(n < account.max_concurrent_tasks as u64)
}

async fn passes_session_id_limit(kv: &Kv, account: &Account, current_session_id: Option<&str>) -> RelayResult<bool> {
    if !account.session_id_limit_enabled {
        return Ok(true);
    }
    let Some(current) = current_session_id else {
        return Ok(true);
    };
    let known = accounts::get_session_ids(kv, &account.platform, &account.id, account.session_id_window_minutes).await?;
    if known.len() < account.session_id_max_count as usize || known.iter().any(|s| s == current) {
        Ok(true)
    } else {
        Ok(false)
    }
}

async fn filter_candidates(
    kv: &Kv,
    candidates: Vec<Account>,
    requested_model: &str,
    excluded: &[String],
    current_session_id: Option<&str>,
) -> RelayResult<Vec<Account>> {
    let mut out = Vec::with_capacity(candidates.len());
    for acc in candidates {
        if excluded.iter().any(|e| e == &acc.id) {
            continue;
        }
        if !acc.schedulable || !is_eligible_status(acc.status) {
            continue;
        }
        if !supports_model(&acc, requested_model) {
            continue;
        }
        if !has_capacity(kv, &acc).await? {
            continue;
        }
        if !passes_session_id_limit(kv, &acc, current_session_id).await? {
            continue;
        }
        out.push(acc);
    }
    out.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.last_used_at.cmp(&b.last_used_at)));
    Ok(out)
}

async fn touch_last_used(kv: &Kv, account: &mut Account) -> RelayResult<()> {
    account.last_used_at = crate::kv::now_ms();
    accounts::update_account(kv, account).await
}

pub async fn select(kv: &Kv, input: SchedulingInput<'_>) -> RelayResult<Selection> {
    if let Some(pinned_id) = input.pinned_account_id {
        let account = accounts::get_account(kv, input.platform, pinned_id)
            .await?
            .ok_or_else(|| RelayError::AccountNotFound(pinned_id.to_string()))?;
        if input.excluded_accounts.iter().any(|e| e == pinned_id)
            || !account.schedulable
            || !is_eligible_status(account.status)
        {
            return Err(RelayError::AccountNotFound("pinned account unavailable".to_string()));
        }
        let mut account = account;
        touch_last_used(kv, &mut account).await?;
        return Ok(Selection { account, fingerprint_recorded: false });
    }

    let candidates = if let Some(group_id) = input.pinned_group_id {
        accounts::list_accounts(kv, input.platform)
            .await?
            .into_iter()
            .filter(|a| a.name == group_id || a.id.starts_with(&format!("{group_id}:")))
            .collect()
    } else {
        accounts::list_accounts(kv, input.platform).await?
    };

    if input.pinned_group_id.is_none() {
        if let Some(fp) = input.session_fingerprint {
            if let Some(account_id) = session::get_mapping(kv, fp).await? {
                if let Some(account) = accounts::get_account(kv, input.platform, &account_id).await? {
                    let eligible = account.schedulable
                        && is_eligible_status(account.status)
                        && !input.excluded_accounts.iter().any(|e| e == &account.id);
                    if eligible {
                        let has_slot = has_capacity(kv, &account).await?;
                        let got_slot = if has_slot {
                            true
                        } else if input.wait_enabled {
                            session::wait_for_slot(input.max_wait, input.poll_interval, || {
                                let kv = kv.clone();
                                let account = account.clone();
                                async move { has_capacity(&kv, &account).await.unwrap_or(false) }
                            })
                            .await
                        } else {
                            false
                        };

                        if got_slot {
                            let mut account = account;
                            touch_last_used(kv, &mut account).await?;
                            let remaining =
                                kv.ttl_remaining(&kv::session_mapping_key(fp)).await?.unwrap_or(Duration::ZERO);
                            session::extend_if_below(
                                kv,
                                fp,
                                &account.id,
                                input.sticky_ttl,
                                input.sticky_renewal_threshold,
                                remaining,
                            )
                            .await?;
                            return Ok(Selection { account, fingerprint_recorded: true });
                        } else {
                            session::delete_mapping(kv, fp).await?;
                        }
                    } else {
                        session::delete_mapping(kv, fp).await?;
                    }
                }
            }
        }
    }

    let filtered = filter_candidates(
        kv,
        candidates,
        input.requested_model,
        input.excluded_accounts,
        input.current_session_id,
    )
    .await?;

    let mut account = filtered
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::AccountNotFound("no schedulable account for requested model".to_string()))?;

    touch_last_used(kv, &mut account).await?;

    let fingerprint_recorded = if let Some(fp) = input.session_fingerprint {
        if input.pinned_group_id.is_none() {
            session::put_mapping(kv, fp, &account.id, input.sticky_ttl).await?;
            true
        } else {
            false
        }
    } else {
        false
    };

    Ok(Selection { account, fingerprint_recorded })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: &str, priority: i64, last_used_at: i64) -> Account {
        Account {
            id: id.to_string(),
            platform: "anthropic".to_string(),
            name: "acc".to_string(),
            status: AccountStatus::Active,
            schedulable: true,
            priority,
            last_used_at,
            api_key: None,
            endpoints: vec![],
            max_concurrent_tasks: 5,
            session_id_limit_enabled: false,
            session_id_max_count: 0,
            session_id_window_minutes: 60,
            proxy: None,
            supported_models: vec!["claude-sonnet-4-5".to_string()],
            cost_multiplier: None,
        }
    }

    #[tokio::test]
    async fn pool_selection_orders_by_priority_then_lru() {
        let kv = Kv::in_memory();
        accounts::create_account(&kv, &account("a", 1, 100)).await.unwrap();
        accounts::create_account(&kv, &account("b", 0, 200)).await.unwrap();
        accounts::create_account(&kv, &account("c", 0, 50)).await.unwrap();

        let input = SchedulingInput {
            platform: "anthropic",
            pinned_account_id: None,
            pinned_group_id: None,
            session_fingerprint: None,
            requested_model: "claude-sonnet-4-5-20250929",
            excluded_accounts: &[],
            current_session_id: None,
            sticky_ttl: Duration::from_secs(3600),
            sticky_renewal_threshold: Duration::from_secs(600),
            wait_enabled: false,
            max_wait: Duration::from_millis(0),
            poll_interval: Duration::from_millis(10),
        };
        let selection = select(&kv, input).await.unwrap();
        assert_eq!(selection.account.id, "c");
    }

    #[tokio::test]
    async fn sticky_hit_refreshes_ttl_when_below_threshold() {
        let kv = Kv::in_memory();
        accounts::create_account(&kv, &account("a", 0, 0)).await.unwrap();
        session::put_mapping(&kv, "fp1", "a", Duration::from_millis(50)).await.unwrap();

        let input = SchedulingInput {
            platform: "anthropic",
            pinned_account_id: None,
            pinned_group_id: None,
            session_fingerprint: Some("fp1"),
            requested_model: "claude-sonnet-4-5-20250929",
            excluded_accounts: &[],
            current_session_id: None,
            sticky_ttl: Duration::from_secs(3600),
            sticky_renewal_threshold: Duration::from_secs(600),
            wait_enabled: false,
            max_wait: Duration::from_millis(0),
            poll_interval: Duration::from_millis(10),
        };
        let selection = select(&kv, input).await.unwrap();
        assert_eq!(selection.account.id, "a");
        assert!(selection.fingerprint_recorded);

        let remaining = kv.ttl_remaining(&kv::session_mapping_key("fp1")).await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(1), "ttl should have been refreshed to the full sticky_ttl");
    }

    #[tokio::test]
    async fn pinned_unavailable_account_errors() {
        let kv = Kv::in_memory();
        let mut acc = account("a", 0, 0);
        acc.status = AccountStatus::Blocked;
        acc.schedulable = false;
        accounts::create_account(&kv, &acc).await.unwrap();

        let input = SchedulingInput {
            platform: "anthropic",
            pinned_account_id: Some("a"),
            pinned_group_id: None,
            session_fingerprint: None,
            requested_model: "claude-sonnet-4-5-20250929",
            excluded_accounts: &[],
            current_session_id: None,
            sticky_ttl: Duration::from_secs(3600),
            sticky_renewal_threshold: Duration::from_secs(600),
            wait_enabled: false,
            max_wait: Duration::from_millis(0),
            poll_interval: Duration::from_millis(10),
        };
        assert!(select(&kv, input).await.is_err());
    }
}
