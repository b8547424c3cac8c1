//! C12 — Usage recorder. Turns an upstream `usage` object into a cost,
//! then charges it in the mandatory 2->3->4 order: increment, force-
//! refreshed read, transaction log append. Violating that order
//! reintroduces the drift the rest of the system exists to eliminate.

use crate::accounts::Account;
use crate::cost::{self, TransactionLogEntry};
use crate::error::RelayResult;
use crate::kv::Kv;
use crate::pricing;

#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

pub struct RecordOutcome {
    pub cost: f64,
    /// `None` means the key carries no total cost limit.
    pub remaining_quota: Option<f64>,
}

/// `model` is the upstream-facing model string, recorded verbatim in the
/// transaction log — vendor-specific account tagging (e.g. a `-2api`
/// suffix some resellers expect) happens only in the request path the
/// rewriter owns, never here.
pub async fn record(
    kv: &Kv,
    api_key_id: &str,
    total_cost_limit: f64,
    model: &str,
    account: &Account,
    usage: UpstreamUsage,
) -> RelayResult<RecordOutcome> {
    let charge = pricing::cost_usd(
        model,
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_creation_input_tokens,
        usage.cache_read_input_tokens,
        account.cost_multiplier,
    );

    cost::increment_cost(kv, api_key_id, charge, model).await?;
    let stats = cost::get_cost_stats(kv, api_key_id, true).await?;
    let remaining_quota = if total_cost_limit > 0.0 { Some(total_cost_limit - stats.total) } else { None };

    let entry = TransactionLogEntry {
        timestamp: crate::kv::now_ms(),
        model: model.to_string(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_create_tokens: usage.cache_creation_input_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
        cost: charge,
        remaining_quota,
    };
    cost::append_transaction_log(kv, api_key_id, &entry).await?;

    Ok(RecordOutcome { cost: charge, remaining_quota })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStatus;

    fn account() -> Account {
        Account {
            id: "acc-1".to_string(),
            platform: "anthropic".to_string(),
            name: "acc".to_string(),
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
            supported_models: vec![],
            cost_multiplier: Some(0.5),
        }
    }

    #[tokio::test]
    async fn record_applies_account_multiplier_and_ordering() {
        let kv = Kv::in_memory();
        let usage = UpstreamUsage { input_tokens: 1000, output_tokens: 1000, ..Default::default() };
        let outcome = record(&kv, "key-1", 1000.0, "claude-sonnet-4-5-20250929", &account(), usage).await.unwrap();

        let full_price = pricing::cost_usd("claude-sonnet-4-5-20250929", 1000, 1000, 0, 0, None);
        assert!((outcome.cost - full_price * 0.5).abs() < 1e-9);

        let stats = cost::get_cost_stats(&kv, "key-1", true).await.unwrap();
        assert!((outcome.remaining_quota.unwrap() - (1000.0 - stats.total)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn record_reports_no_quota_ceiling_when_unlimited() {
        let kv = Kv::in_memory();
        let usage = UpstreamUsage { input_tokens: 100, output_tokens: 100, ..Default::default() };
        let outcome = record(&kv, "key-1", 0.0, "claude-sonnet-4-5-20250929", &account(), usage).await.unwrap();
        assert_eq!(outcome.remaining_quota, None);
    }
}
