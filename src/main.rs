//! minutebar - headless tick-to-candle capture daemon.
//!
//! Subscribes to a binary exchange feed, aggregates ticks into one-minute
//! OHLCV candles and appends each closed candle exactly once to a
//! per-symbol, per-day CSV file. Designed to run unattended across trading
//! sessions.
//!
//! # Usage
//! ```sh
//! UNIVERSE_PATH=mapping_security_ids.csv TOKEN_PATH=dhan_token.json cargo run
//! ```

use anyhow::{Context, Result};
use minutebar::application::session::SessionController;
use minutebar::application::store::CandleStore;
use minutebar::config::Config;
use minutebar::domain::ports::CredentialProvider;
use minutebar::infrastructure::credentials::FileCredentialProvider;
use minutebar::infrastructure::universe::SymbolUniverse;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("minutebar {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: feed={}, output={}, max_per_connection={}",
        config.feed_ws_url,
        config.output_root.display(),
        config.max_per_connection
    );

    let universe = Arc::new(
        SymbolUniverse::load(&config.universe_path)
            .with_context(|| format!("failed to load universe from {}", config.universe_path.display()))?,
    );
    info!(
        "Loaded {} security ids from {}",
        universe.len(),
        config.universe_path.display()
    );

    std::fs::create_dir_all(&config.output_root)
        .with_context(|| format!("failed to create output root {}", config.output_root.display()))?;

    let credentials: Arc<dyn CredentialProvider> =
        Arc::new(FileCredentialProvider::new(config.token_path.clone()));
    let store = Arc::new(CandleStore::new(config.hv_window));

    let controller = SessionController::new(config, universe, credentials, store);
    let shutdown = CancellationToken::new();
    let controller_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(controller.run(shutdown))
    };

    info!("Running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping session...");
    shutdown.cancel();

    // Give the session time to tear down and force-flush before exiting.
    match tokio::time::timeout(Duration::from_secs(10), controller_handle).await {
        Ok(joined) => {
            joined.context("session controller panicked")??;
        }
        Err(_) => info!("Session controller did not stop within 10s; exiting anyway"),
    }

    info!("Goodbye");
    Ok(())
}
