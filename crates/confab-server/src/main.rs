//! # Confab Server
//!
//! Realtime chat channel server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! confab
//!
//! # Run with custom config
//! CONFAB_CONFIG=/path/to/confab.toml confab
//!
//! # Run with environment variables
//! CONFAB_PORT=8080 CONFAB_HOST=0.0.0.0 confab
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use confab_core::{MemoryStore, Store};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::ServerConfig::load()?;

    tracing::info!("Starting confab server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Seed an in-memory store. A demo conversation lets local clients join
    // without a separate provisioning step.
    let store = Arc::new(MemoryStore::new());
    if config.channels.demo_users > 0 {
        let conversation = store.create_conversation("demo", 1..=config.channels.demo_users);
        tracing::info!(
            conversation,
            users = config.channels.demo_users,
            "Seeded demo conversation"
        );
    }
    let store: Arc<dyn Store> = store;

    // Start the server
    handlers::run_server(config, store).await?;

    Ok(())
}
