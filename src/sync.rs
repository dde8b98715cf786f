//! Hysteria2 traffic poller
//!
//! Hysteria2 nodes expose per-user counters at `GET /traffic` and reset them
//! when `clear=1` is passed, so every successful poll yields a delta. Deltas
//! are normalized into a single inbound entry and ingested for the node's host
//! as if the node had posted the report itself.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::{SyncConfig, SyncSourceConfig};
use crate::report::{InboundTraffic, TrafficReport};
use crate::service::TrafficService;

#[derive(Debug, Deserialize)]
struct UserTraffic {
    #[serde(default)]
    tx: i64,
    #[serde(default)]
    rx: i64,
}

fn traffic_url(source: &SyncSourceConfig) -> String {
    format!("http://{}:{}/traffic?clear=1", source.host, source.port)
}

/// Fetch and clear one node's counters
pub async fn fetch_report(
    client: &reqwest::Client,
    source: &SyncSourceConfig,
) -> Result<TrafficReport> {
    let url = traffic_url(source);
    let response = client
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, &source.password)
        .send()
        .await
        .with_context(|| format!("request to {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} returned {}: {}", url, status, body);
    }

    let users: HashMap<String, UserTraffic> =
        response.json().await.with_context(|| format!("unreadable traffic from {}", url))?;

    // All users of a node share the one listening port
    let (up, down) = users.values().fold((0, 0), |(up, down), u| (up + u.tx, down + u.rx));
    debug!("{}: {} users, tx={}, rx={}", source.host, users.len(), up, down);

    Ok(TrafficReport {
        inbound_traffics: vec![InboundTraffic::inbound(source.tag.clone(), up, down)],
        client_traffics: Vec::new(),
    })
}

/// Poll one node and ingest the result under its host as source ip
pub async fn sync_source(
    client: &reqwest::Client,
    service: &TrafficService,
    source: &SyncSourceConfig,
) -> Result<()> {
    let report = fetch_report(client, source).await?;
    service.ingest(&source.host, report, None).await?;
    Ok(())
}

/// Start the background poller. Does nothing without configured sources.
pub fn start_sync_poller(config: &SyncConfig, service: TrafficService) -> Result<()> {
    if config.sources.is_empty() {
        debug!("No sync sources configured, poller not started");
        return Ok(());
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("failed to build sync http client")?;
    let sources = config.sources.clone();
    let period = Duration::from_secs(config.interval_secs);

    info!("Sync poller started for {} source(s), every {}s", sources.len(), config.interval_secs);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for source in &sources {
                let client = client.clone();
                let service = service.clone();
                let source = source.clone();
                // A slow node must not hold up the others
                tokio::spawn(async move {
                    if let Err(e) = sync_source(&client, &service, &source).await {
                        error!("Sync from {}:{} failed: {:#}", source.host, source.port, e);
                    }
                });
            }
        }
    });

    Ok(())
}
