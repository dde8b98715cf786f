//! Database module
//!
//! SQLite storage for sources, per-port and per-client entities and their
//! daily history buckets. Writers that can conflict (ingest, rollover) are
//! funnelled through [`write_queue`]; readers use the pool directly.

mod admin;
mod archive;
mod history;
mod ingest;
mod rollover;
mod schema;
mod summary;
mod window;
pub mod write_queue;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

use crate::config::{DatabaseConfig, StorageMode, TrafficConfig};
use crate::error::{TrafficError, TrafficResult};

pub use archive::{RawRequest, RawRequestFilter, RawRequestRecord};
pub use history::{HistoryFilter, HistoryRecord};
pub use ingest::IngestOutcome;
pub use rollover::RolloverReport;
pub use summary::{SourceDetail, SourceSummary, TrafficSummary};
pub use window::{clamp_days, EntityDetail, EntityScope, Series};

use schema::{KindQueries, CLIENT_QUERIES, PORT_QUERIES};

/// Day-boundary and liveness rules shared by every reader and writer
#[derive(Debug, Clone)]
pub struct TrafficSettings {
    pub tz: Tz,
    pub mode: StorageMode,
    pub source_freshness: TimeDelta,
    pub entity_freshness: TimeDelta,
}

impl TrafficSettings {
    pub fn from_config(config: &TrafficConfig) -> Result<Self> {
        Ok(Self {
            tz: config.tz()?,
            mode: config.storage_mode,
            source_freshness: TimeDelta::seconds(config.source_freshness_secs),
            entity_freshness: TimeDelta::seconds(config.entity_freshness_secs),
        })
    }

    /// Calendar date of `now` in the configured timezone
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    pub fn source_status(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> &'static str {
        if now - last_seen <= self.source_freshness {
            "active"
        } else {
            "inactive"
        }
    }

    /// Live only with recent traffic AND something counted today
    pub fn entity_is_live(
        &self,
        last_updated: Option<DateTime<Utc>>,
        today_up: i64,
        today_down: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last_updated) = last_updated else {
            return false;
        };
        now - last_updated <= self.entity_freshness && (today_up != 0 || today_down != 0)
    }
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            tz: chrono_tz::UTC,
            mode: StorageMode::History,
            source_freshness: TimeDelta::seconds(30),
            entity_freshness: TimeDelta::seconds(60),
        }
    }
}

/// Port (inbound tag) or client (user email)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Port,
    Client,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Port => "port",
            EntityKind::Client => "client",
        }
    }

    fn queries(&self) -> &'static KindQueries {
        match self {
            EntityKind::Port => &PORT_QUERIES,
            EntityKind::Client => &CLIENT_QUERIES,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    settings: Arc<TrafficSettings>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig, settings: TrafficSettings) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool, settings: Arc::new(settings) })
    }

    /// Single-connection in-memory database for tests
    #[cfg(test)]
    pub async fn in_memory(settings: TrafficSettings) -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .expect("valid sqlite url")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .expect("in-memory sqlite");
        let db = Self { pool, settings: Arc::new(settings) };
        db.run_migrations().await.expect("migrations");
        db
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for statement in schema::MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn settings(&self) -> &TrafficSettings {
        &self.settings
    }

    /// Round-trip to the database for health checks
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Reject non-numeric or non-positive source ids before touching storage
pub fn parse_source_id(raw: &str) -> TrafficResult<i64> {
    parse_id(raw, "service")
}

pub fn parse_request_id(raw: &str) -> TrafficResult<i64> {
    parse_id(raw, "request")
}

fn parse_id(raw: &str, what: &str) -> TrafficResult<i64> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(TrafficError::Validation(format!("invalid {} id '{}'", what, raw))),
    }
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Calendar date from a stored value, ignoring any time-of-day suffix
/// (`2024-05-01`, `2024-05-01 00:00:00`, `2024-05-01T00:00:00Z`).
pub(crate) fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub(crate) fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2024-05-01"), Some(day(2024, 5, 1)));
        assert_eq!(normalize_date("2024-05-01 00:00:00"), Some(day(2024, 5, 1)));
        assert_eq!(normalize_date("2024-05-01T00:00:00Z"), Some(day(2024, 5, 1)));
        assert_eq!(normalize_date("yesterday"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn test_parse_source_id() {
        assert_eq!(parse_source_id("42").unwrap(), 42);
        assert!(matches!(parse_source_id("abc"), Err(TrafficError::Validation(_))));
        assert!(matches!(parse_source_id("0"), Err(TrafficError::Validation(_))));
        assert!(matches!(parse_source_id("-3"), Err(TrafficError::Validation(_))));
        assert_eq!(parse_request_id(" 7 ").unwrap(), 7);
        assert!(matches!(parse_request_id("x"), Err(TrafficError::Validation(_))));
    }

    #[test]
    fn test_today_uses_configured_timezone() {
        let settings = settings(StorageMode::History);
        // 2024-05-10 17:00 UTC is already 2024-05-11 01:00 in Shanghai
        let late = noon() + TimeDelta::hours(13);
        assert_eq!(settings.today(noon()), day(2024, 5, 10));
        assert_eq!(settings.today(late), day(2024, 5, 11));
    }

    #[test]
    fn test_entity_liveness() {
        let settings = settings(StorageMode::History);
        let now = noon();
        assert!(settings.entity_is_live(Some(now - TimeDelta::seconds(5)), 130, 60, now));
        assert!(!settings.entity_is_live(Some(now - TimeDelta::seconds(120)), 130, 60, now));
        assert!(!settings.entity_is_live(Some(now - TimeDelta::seconds(5)), 0, 0, now));
        assert!(!settings.entity_is_live(None, 130, 60, now));
    }

    #[test]
    fn test_source_status() {
        let settings = settings(StorageMode::History);
        let now = noon();
        assert_eq!(settings.source_status(now - TimeDelta::seconds(10), now), "active");
        assert_eq!(settings.source_status(now - TimeDelta::seconds(31), now), "inactive");
    }
}
