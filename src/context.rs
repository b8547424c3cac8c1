//! Per-request context. The cancellation token, request id, resolved
//! ApiKey, and selected account travel together through every call in the
//! pipeline — there is no ambient/global state for any of this, unlike
//! the donor app's `ForwardContext`, which this is grounded on but which
//! leans on a couple of process-wide config lookups internally.

use tokio_util::sync::CancellationToken;

use crate::accounts::Account;
use crate::auth::ApiKey;

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub api_key: ApiKey,
    pub account: Option<Account>,
    pub session_fingerprint: Option<String>,
    pub excluded_accounts: Vec<String>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(request_id: String, api_key: ApiKey) -> Self {
        Self {
            request_id,
            api_key,
            account: None,
            session_fingerprint: None,
            excluded_accounts: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.account = Some(account);
        self
    }

    pub fn exclude_current(&mut self) {
        if let Some(account) = &self.account {
            self.excluded_accounts.push(account.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStatus;

    fn key() -> ApiKey {
        ApiKey {
            id: "key-1".to_string(),
            key_material: "cr_x".to_string(),
            name: "t".to_string(),
            enabled: true,
            claude_account_id: None,
            total_cost_limit: 0.0,
            daily_cost_limit: 0.0,
            concurrency_limit: 0,
            rate_limit_requests: 0,
            rate_limit_window_secs: 60,
        }
    }

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            platform: "anthropic".to_string(),
            name: "a".to_string(),
            status: AccountStatus::Active,
            schedulable: true,
            priority: 0,
            last_used_at: 0,
            api_key: None,
            endpoints: vec![],
            max_concurrent_tasks: 1,
            session_id_limit_enabled: false,
            session_id_max_count: 0,
            session_id_window_minutes: 60,
            proxy: None,
            supported_models: vec![],
            cost_multiplier: None,
        }
    }

    #[test]
    fn exclude_current_appends_selected_account() {
        let mut ctx = RequestContext::new("req-1".to_string(), key()).with_account(account("acc-1"));
        ctx.exclude_current();
        assert_eq!(ctx.excluded_accounts, vec!["acc-1".to_string()]);
    }
}
