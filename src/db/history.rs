//! Flat history listing with optional filters

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use super::{normalize_date, Database};
use crate::error::{TrafficError, TrafficResult};

/// Upper bound on rows returned by one listing
const MAX_RECORDS: i64 = 1000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    pub service_id: Option<i64>,
    pub tag: Option<String>,
    /// Inclusive, `YYYY-MM-DD`
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct HistoryRecord {
    pub date: String,
    pub tag: String,
    pub ip_address: String,
    pub daily_up: i64,
    pub daily_down: i64,
    pub total_daily: i64,
}

fn parse_bound(raw: &Option<String>, name: &str) -> TrafficResult<Option<String>> {
    match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => normalize_date(s)
            .map(|d| Some(d.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| TrafficError::Validation(format!("invalid {} '{}'", name, s))),
    }
}

impl Database {
    /// Per-port daily rows, newest first
    pub async fn history_records(
        &self,
        filter: &HistoryFilter,
    ) -> TrafficResult<Vec<HistoryRecord>> {
        let start = parse_bound(&filter.start_date, "start_date")?;
        let end = parse_bound(&filter.end_date, "end_date")?;

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT substr(h.date, 1, 10) AS date, p.tag AS tag, s.ip_address AS ip_address,
                   h.daily_up AS daily_up, h.daily_down AS daily_down,
                   h.daily_up + h.daily_down AS total_daily
            FROM port_history h
            JOIN port_entities p ON p.id = h.entity_id
            JOIN sources s ON s.id = p.source_id
            WHERE 1 = 1
            "#,
        );

        if let Some(service_id) = filter.service_id {
            query.push(" AND s.id = ").push_bind(service_id);
        }
        if let Some(tag) = filter.tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            query.push(" AND p.tag = ").push_bind(tag.to_string());
        }
        if let Some(start) = start {
            query.push(" AND substr(h.date, 1, 10) >= ").push_bind(start);
        }
        if let Some(end) = end {
            query.push(" AND substr(h.date, 1, 10) <= ").push_bind(end);
        }

        query.push(" ORDER BY h.date DESC, s.ip_address, p.tag LIMIT ").push_bind(MAX_RECORDS);

        let records = query.build_query_as::<HistoryRecord>().fetch_all(&self.pool).await?;
        Ok(records)
    }
}
