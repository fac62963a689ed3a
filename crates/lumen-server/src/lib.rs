//! HTTP server for the LumenFHIR subscription engine.
//!
//! Exposes tenant-scoped resource CRUD plus the subscription operations
//! (`$status`, `$events`) over axum, backed by one subscription engine per
//! tenant.

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::{AppConfig, LoggingConfig, ServerConfig, TenantConfig};
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize structured logging from `RUST_LOG`, falling back to the
/// configured level.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Provision tenants and serve until the process is interrupted.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    config.validate().map_err(anyhow::Error::msg)?;
    let addr = config.addr();

    let state = AppState::from_config(config).await;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "LumenFHIR server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
