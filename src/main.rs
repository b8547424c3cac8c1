use provider_relay::{config, connect_kv, install_panic_hook, logger, seed_from_config, server};

#[tokio::main]
async fn main() {
    install_panic_hook();
    logger::init();
    logger::info("startup", "provider-relay starting");

    let cfg = config::load();
    let kv = connect_kv(&cfg).await;
    seed_from_config(&kv, &cfg).await;

    let state = server::AppState::new(kv, cfg);
    server::serve(state).await;
}
