//! Multi-tenant reverse proxy and orchestration layer for upstream AI
//! chat-completion providers: account pool, concurrency ledger, sticky
//! sessions, retry engine, and cost accounting in front of a single
//! client-facing `/v1/messages` surface.

pub mod accounts;
pub mod aggregator;
pub mod auth;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod kv;
pub mod logger;
pub mod pricing;
pub mod retry;
pub mod rewriter;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod upstream;
pub mod usage;

/// Installs a panic hook that logs through the same batching logger as
/// everything else, so a panic in a spawned task leaves a record instead
/// of only a console line.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        crate::logger::error("panic", &format!("message='{message}', location='{location}'"));
        eprintln!("FATAL PANIC: {message} at {location}");
    }));
}

/// Seeds accounts and ApiKeys from config into the store if they aren't
/// already present. Mutation after startup goes through `accounts`/`auth`
/// directly — there is no admin CRUD surface fronting this.
pub async fn seed_from_config(kv: &kv::Kv, cfg: &config::RelayConfig) {
    for seed in &cfg.seed_accounts {
        if accounts::get_account(kv, &seed.platform, &seed.id).await.ok().flatten().is_some() {
            continue;
        }
        let account = accounts::Account {
            id: seed.id.clone(),
            platform: seed.platform.clone(),
            name: seed.name.clone(),
            status: accounts::AccountStatus::Active,
            schedulable: true,
            priority: seed.priority,
            last_used_at: 0,
            api_key: seed.api_key.clone(),
            endpoints: seed.endpoints.clone(),
            max_concurrent_tasks: seed.max_concurrent_tasks,
            session_id_limit_enabled: seed.session_id_limit_enabled,
            session_id_max_count: seed.session_id_max_count,
            session_id_window_minutes: seed.session_id_window_minutes,
            proxy: seed.proxy.clone(),
            supported_models: seed.supported_models.clone(),
            cost_multiplier: seed.cost_multiplier,
        };
        if let Err(e) = accounts::create_account(kv, &account).await {
            logger::error("startup", &format!("failed to seed account {}: {}", seed.id, e));
        }
    }

    for seed in &cfg.seed_api_keys {
        if auth::get_api_key(kv, &seed.id).await.ok().flatten().is_some() {
            continue;
        }
        let key = auth::ApiKey {
            id: seed.id.clone(),
            key_material: seed.key_material.clone(),
            name: seed.name.clone(),
            enabled: true,
            claude_account_id: seed.claude_account_id.clone(),
            total_cost_limit: seed.total_cost_limit,
            daily_cost_limit: seed.daily_cost_limit,
            concurrency_limit: seed.concurrency_limit,
            rate_limit_requests: seed.rate_limit_requests,
            rate_limit_window_secs: seed.rate_limit_window_secs,
        };
        if let Err(e) = auth::create_api_key(kv, &key).await {
            logger::error("startup", &format!("failed to seed api key {}: {}", seed.id, e));
        }
    }
}

/// Connects to the configured Redis store, falling back to the in-process
/// backend (with a warning) if the connection fails — keeps a fresh
/// checkout usable without a Redis instance on hand.
pub async fn connect_kv(cfg: &config::RelayConfig) -> kv::Kv {
    match kv::Kv::connect_redis(&cfg.kv_url).await {
        Ok(kv) => kv,
        Err(e) => {
            logger::error("startup", &format!("failed to connect to redis at {}: {} — falling back to in-memory store", cfg.kv_url, e));
            kv::Kv::in_memory()
        }
    }
}
