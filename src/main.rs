//! trafficdash - traffic accounting for proxy nodes
//!
//! Nodes report per-interval traffic deltas per inbound port and per client.
//! The server accumulates them into daily history buckets and serves:
//! - Per-node and per-entity summaries with live status
//! - Zero-filled daily series over 1-30 day windows
//! - CSV export of an entity's full history

mod config;
mod db;
mod error;
mod report;
mod scheduler;
mod service;
mod sync;
mod web;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting trafficdash...");
    info!(
        "Timezone {}, storage mode {}",
        config.traffic.timezone,
        config.traffic.storage_mode.as_str()
    );

    let settings = db::TrafficSettings::from_config(&config.traffic)?;
    let database = db::Database::new(&config.database, settings).await?;
    database.run_migrations().await?;
    info!("Database initialized");

    let service = service::TrafficService::new(database);

    if config.traffic.rollover_enabled {
        scheduler::start_rollover_scheduler(service.clone());
    } else {
        info!("Midnight rollover disabled");
    }

    sync::start_sync_poller(&config.sync, service.clone())?;

    // Start web server (blocking)
    web::start_server(&config, service).await?;

    Ok(())
}
