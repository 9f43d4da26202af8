//! # drillink-server
//!
//! HTTP server for driving networked shooting targets.
//!
//! This binary provides:
//! - A WebSocket hub for target devices (or a BLE proxy)
//! - REST API for drill runs, stored results and scoring
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package drillink-server
//!
//! # With an explicit configuration file
//! ./drillink-server /etc/drillink/config.toml
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;

use drillink_core::{default_config_path, DrillinkConfig};
use drillink_server::api::create_router;
use drillink_server::logging;
use drillink_server::state::AppState;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Configuration path from the first argument, `DRILLINK_CONFIG`, or the
/// platform default.
fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DRILLINK_CONFIG").ok())
        .map_or_else(default_config_path, PathBuf::from)
}

#[cfg(feature = "bluetooth")]
async fn build_state(config: DrillinkConfig) -> anyhow::Result<AppState> {
    use std::sync::Arc;

    use drillink_core::{BleChannel, JsonResultStore};
    use drillink_server::hub::DeviceHub;

    if !config.ble.is_configured() {
        return Ok(AppState::new(config));
    }
    let ble = Arc::new(BleChannel::connect(&config.ble).await?);
    let store = Arc::new(JsonResultStore::new(config.storage.resolved_data_dir()));
    Ok(AppState::with_parts(config, Arc::new(DeviceHub::new()), ble, store))
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn build_state(config: DrillinkConfig) -> anyhow::Result<AppState> {
    if config.ble.is_configured() {
        tracing::warn!("BLE settings ignored: built without bluetooth, using the WebSocket hub");
    }
    Ok(AppState::new(config))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = DrillinkConfig::load(Some(&path))?;

    logging::init(&config.server)?;
    info!(config = %path.display(), "Starting drillink-server");

    let addr: SocketAddr = config.server.bind_address.parse()?;
    let state = build_state(config).await?.shared();

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
