//! # Beacon Server
//!
//! WebSocket front end for the Beacon realtime broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with environment overrides
//! BEACON_PORT=8080 BEACON_BROKER__REQUIRE_AUTH=true BEACON_BROKER__JWT_SECRET=s3cret beacon
//! ```
//!
//! A `beacon.toml` is picked up from the working directory,
//! `/etc/beacon/` or `~/.config/beacon/`.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,beacon_core=debug,beacon_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Beacon server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
