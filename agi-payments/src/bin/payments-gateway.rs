//! Webhook gateway: loads configuration, activates providers and serves
//! `POST /webhooks/{provider}`.
//!
//! Configuration comes from `PAYMENTS_CONFIG` (TOML file) when set, otherwise
//! from the environment and `.env`.

use agi_payments::{
    GatewayState, MemoryStore, PaymentManager, PaymentsConfig, WebhookReconciler, router,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<PaymentsConfig, agi_payments::ConfigError> {
    let config = match std::env::var("PAYMENTS_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading payments configuration file");
            PaymentsConfig::load_file(path)?
        }
        Err(_) => PaymentsConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    let manager = Arc::new(PaymentManager::initialize(&config).await);
    let store = Arc::new(MemoryStore::new());
    let reconciler = Arc::new(WebhookReconciler::new(store));

    let app = router(GatewayState::new(manager, reconciler));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Payments gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
