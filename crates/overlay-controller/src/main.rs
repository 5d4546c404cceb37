use std::collections::HashMap;
use std::sync::Arc;

use overlay_controller::{router, InMemoryPeerStore, LoginHandler, StaticTokenValidator, UpdateBroker};

mod config;

use config::ControllerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::load()?;
    overlay_logging::setup_global_subscriber(&config.log_filter)?;

    tracing::info!(bind_addr = %config.bind_addr, prefix = %config.overlay_prefix, "starting controller");

    let store = Arc::new(InMemoryPeerStore::new());
    let tokens = Arc::new(StaticTokenValidator::new(HashMap::new()));
    let broker = UpdateBroker::new();
    let login = Arc::new(LoginHandler::new(
        store.clone(),
        tokens,
        config.overlay_prefix,
        broker.clone(),
    ));

    let app = router(login, broker, store, Vec::new());

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("signaling endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
