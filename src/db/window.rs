//! Windowed history queries
//!
//! Every series is a fixed list of consecutive calendar dates ending today
//! (oldest first). Dates without a history row read as zero.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

use super::{date_key, millis_to_datetime, normalize_date, Database, EntityKind};
use crate::config::StorageMode;
use crate::error::{TrafficError, TrafficResult};

pub const DEFAULT_WINDOW_DAYS: u32 = 7;
pub const MAX_WINDOW_DAYS: u32 = 30;

/// What a window is computed over
#[derive(Debug, Clone, PartialEq)]
pub enum EntityScope {
    Entity { source_id: i64, kind: EntityKind, key: String },
    /// All port entities of a source combined
    Source { source_id: i64 },
}

/// Positionally aligned date / upload / download sequences
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Series {
    pub dates: Vec<String>,
    pub upload_data: Vec<i64>,
    pub download_data: Vec<i64>,
}

impl Series {
    fn build(dates: &[NaiveDate], buckets: &HashMap<NaiveDate, (i64, i64)>) -> Self {
        let mut series = Series {
            dates: Vec::with_capacity(dates.len()),
            upload_data: Vec::with_capacity(dates.len()),
            download_data: Vec::with_capacity(dates.len()),
        };
        for date in dates {
            let (up, down) = buckets.get(date).copied().unwrap_or((0, 0));
            series.dates.push(date_key(*date));
            series.upload_data.push(up);
            series.download_data.push(down);
        }
        series
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Out-of-range or missing values fall back to the default window
pub fn clamp_days(days: Option<i64>) -> u32 {
    match days {
        Some(d) if (1..=i64::from(MAX_WINDOW_DAYS)).contains(&d) => d as u32,
        _ => DEFAULT_WINDOW_DAYS,
    }
}

/// `days` consecutive dates ending at `today`, oldest first
pub fn window_dates(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..days)
        .rev()
        .filter_map(|back| today.checked_sub_signed(TimeDelta::days(i64::from(back))))
        .collect()
}

/// Fold raw rows into per-date totals. Duplicate dates are summed.
fn fold_rows(rows: Vec<(String, i64, i64)>) -> HashMap<NaiveDate, (i64, i64)> {
    let mut buckets: HashMap<NaiveDate, (i64, i64)> = HashMap::new();
    for (raw_date, up, down) in rows {
        let Some(date) = normalize_date(&raw_date) else {
            warn!("Ignoring history row with unreadable date '{}'", raw_date);
            continue;
        };
        let bucket = buckets.entry(date).or_insert((0, 0));
        bucket.0 += up;
        bucket.1 += down;
    }
    buckets
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityInfo {
    pub id: i64,
    pub source_id: i64,
    pub ip_address: String,
    pub service_name: String,
    pub kind: EntityKind,
    /// Tag for ports, email for clients
    pub key: String,
    pub port: i64,
    pub custom_name: Option<String>,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub today_up: i64,
    pub today_down: i64,
    pub total_up: i64,
    pub total_down: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDetail {
    pub info: EntityInfo,
    pub history: Series,
}

type EntityRow = (
    i64,
    i64,
    String,
    String,
    String,
    i64,
    Option<String>,
    String,
    Option<i64>,
    i64,
    i64,
    Option<String>,
);

impl Database {
    /// N-day series for one entity or for a whole source. `days` outside
    /// 1..=30 falls back to the default window.
    pub async fn query_window_at(
        &self,
        scope: &EntityScope,
        days: u32,
        now: DateTime<Utc>,
    ) -> TrafficResult<Series> {
        let days = clamp_days(Some(i64::from(days)));
        let today = self.settings.today(now);
        let dates = window_dates(today, days);
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok(Series::default());
        };

        let rows: Vec<(String, i64, i64)> = match scope {
            EntityScope::Entity { source_id, kind, key } => {
                let entity = self.find_entity(*source_id, *kind, key).await?;
                sqlx::query_as(kind.queries().window_rows)
                    .bind(entity.0)
                    .bind(date_key(*first))
                    .bind(date_key(*last))
                    .fetch_all(&self.pool)
                    .await?
            }
            EntityScope::Source { source_id } => {
                self.ensure_source(*source_id).await?;
                sqlx::query_as(
                    r#"
                    SELECT h.date, SUM(h.daily_up), SUM(h.daily_down)
                    FROM port_history h
                    JOIN port_entities p ON p.id = h.entity_id
                    WHERE p.source_id = ?
                      AND substr(h.date, 1, 10) >= ?
                      AND substr(h.date, 1, 10) <= ?
                    GROUP BY h.date
                    "#,
                )
                .bind(source_id)
                .bind(date_key(*first))
                .bind(date_key(*last))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(Series::build(&dates, &fold_rows(rows)))
    }

    /// Entity info (today, all-time totals, liveness) plus its window
    pub async fn entity_detail_at(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> TrafficResult<EntityDetail> {
        let row = self.find_entity(source_id, kind, key).await?;
        let (
            id,
            source_id,
            ip_address,
            service_name,
            key,
            port,
            custom_name,
            status,
            last_updated,
            live_up,
            live_down,
            live_date,
        ) = row;
        let queries = kind.queries();
        let today = self.settings.today(now);

        // Read directly so the answer holds even if the window excludes today
        let (today_up, today_down) = match self.settings.mode {
            StorageMode::History => {
                let rows: Vec<(String, i64, i64)> = sqlx::query_as(queries.window_rows)
                    .bind(id)
                    .bind(date_key(today))
                    .bind(date_key(today))
                    .fetch_all(&self.pool)
                    .await?;
                fold_rows(rows).get(&today).copied().unwrap_or((0, 0))
            }
            StorageMode::LiveCounters => {
                if live_date.as_deref().and_then(normalize_date) == Some(today) {
                    (live_up, live_down)
                } else {
                    (0, 0)
                }
            }
        };

        let (total_up, total_down): (i64, i64) =
            sqlx::query_as(queries.totals).bind(id).fetch_one(&self.pool).await?;

        let last_seen = last_updated.map(millis_to_datetime);
        let is_active = self.settings.entity_is_live(last_seen, today_up, today_down, now);

        let scope = EntityScope::Entity { source_id, kind, key: key.clone() };
        let history = self.query_window_at(&scope, days, now).await?;

        Ok(EntityDetail {
            info: EntityInfo {
                id,
                source_id,
                ip_address,
                service_name,
                kind,
                key,
                port,
                custom_name,
                status,
                last_seen,
                today_up,
                today_down,
                total_up,
                total_down,
                is_active,
            },
            history,
        })
    }

    /// Full history of one entity, from its first recorded day through today
    pub async fn export_history_at(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
        now: DateTime<Utc>,
    ) -> TrafficResult<Series> {
        let entity = self.find_entity(source_id, kind, key).await?;
        let rows: Vec<(String, i64, i64)> =
            sqlx::query_as(kind.queries().all_rows).bind(entity.0).fetch_all(&self.pool).await?;
        let buckets = fold_rows(rows);

        let first = buckets.keys().min().copied();
        let last = buckets.keys().max().copied();
        let (Some(first), Some(last)) = (first, last) else {
            return Ok(Series::default());
        };
        let end = last.max(self.settings.today(now));
        let dates: Vec<NaiveDate> = first.iter_days().take_while(|d| *d <= end).collect();

        Ok(Series::build(&dates, &buckets))
    }

    async fn find_entity(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
    ) -> TrafficResult<EntityRow> {
        if key.trim().is_empty() {
            let message = format!("{} key must not be empty", kind.as_str());
            return Err(TrafficError::Validation(message));
        }
        sqlx::query_as(kind.queries().select_entity)
            .bind(source_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                let what = format!("{} '{}' on service {}", kind.as_str(), key, source_id);
                TrafficError::NotFound(what)
            })
    }

    pub(crate) async fn ensure_source(&self, source_id: i64) -> TrafficResult<()> {
        let found: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or_else(|| TrafficError::NotFound(format!("service {}", source_id)))
    }
}
