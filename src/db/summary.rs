//! Per-source listings and totals

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::window::{EntityScope, Series};
use super::{date_key, millis_to_datetime, Database, EntityKind};
use crate::config::StorageMode;
use crate::error::{TrafficError, TrafficResult};

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub id: i64,
    pub ip_address: String,
    pub service_name: String,
    pub custom_name: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub status: &'static str,
    pub inbound_count: i64,
    pub client_count: i64,
    /// Today's inbound traffic across all ports
    pub total_inbound_up: i64,
    pub total_inbound_down: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficSummary {
    pub total_services: usize,
    pub total_up: i64,
    pub total_down: i64,
    pub total_traffic: i64,
    pub services: Vec<SourceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: i64,
    pub ip_address: String,
    pub service_name: String,
    pub custom_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub id: i64,
    pub kind: EntityKind,
    pub key: String,
    pub port: i64,
    pub custom_name: Option<String>,
    pub status: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub today_up: i64,
    pub today_down: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceDetail {
    pub service: SourceInfo,
    pub inbound_traffics: Vec<EntitySummary>,
    pub client_traffics: Vec<EntitySummary>,
    /// Source-wide inbound series
    pub history: Series,
}

type SourceRow = (i64, String, String, Option<String>, i64, i64);
type EntityListRow = (
    i64,
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
    /// One row per source, most recently seen first.
    ///
    /// Three passes regardless of source count: sources, grouped entity
    /// counts, grouped today's port traffic.
    pub async fn list_sources_at(&self, now: DateTime<Utc>) -> TrafficResult<Vec<SourceSummary>> {
        let today = date_key(self.settings.today(now));

        let sources: Vec<SourceRow> = sqlx::query_as(
            "SELECT id, ip_address, service_name, custom_name, first_seen, last_seen \
             FROM sources ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let port_counts = self.count_active(EntityKind::Port).await?;
        let client_counts = self.count_active(EntityKind::Client).await?;

        let today_rows: Vec<(i64, i64, i64)> = match self.settings.mode {
            StorageMode::History => {
                sqlx::query_as(
                    r#"
                    SELECT p.source_id, COALESCE(SUM(h.daily_up), 0), COALESCE(SUM(h.daily_down), 0)
                    FROM port_history h
                    JOIN port_entities p ON p.id = h.entity_id
                    WHERE substr(h.date, 1, 10) = ? AND p.status = 'active'
                    GROUP BY p.source_id
                    "#,
                )
                .bind(&today)
                .fetch_all(&self.pool)
                .await?
            }
            StorageMode::LiveCounters => {
                sqlx::query_as(
                    r#"
                    SELECT source_id, COALESCE(SUM(live_up), 0), COALESCE(SUM(live_down), 0)
                    FROM port_entities
                    WHERE live_date = ? AND status = 'active'
                    GROUP BY source_id
                    "#,
                )
                .bind(&today)
                .fetch_all(&self.pool)
                .await?
            }
        };
        let today_totals: HashMap<i64, (i64, i64)> =
            today_rows.into_iter().map(|(id, up, down)| (id, (up, down))).collect();

        Ok(sources
            .into_iter()
            .map(|(id, ip_address, service_name, custom_name, _first_seen, last_seen)| {
                let last_seen = millis_to_datetime(last_seen);
                let (up, down) = today_totals.get(&id).copied().unwrap_or((0, 0));
                SourceSummary {
                    id,
                    ip_address,
                    service_name,
                    custom_name,
                    last_seen,
                    status: self.settings.source_status(last_seen, now),
                    inbound_count: port_counts.get(&id).copied().unwrap_or(0),
                    client_count: client_counts.get(&id).copied().unwrap_or(0),
                    total_inbound_up: up,
                    total_inbound_down: down,
                }
            })
            .collect())
    }

    pub async fn traffic_summary_at(&self, now: DateTime<Utc>) -> TrafficResult<TrafficSummary> {
        let services = self.list_sources_at(now).await?;
        let total_up = services.iter().map(|s| s.total_inbound_up).sum::<i64>();
        let total_down = services.iter().map(|s| s.total_inbound_down).sum::<i64>();
        Ok(TrafficSummary {
            total_services: services.len(),
            total_up,
            total_down,
            total_traffic: total_up + total_down,
            services,
        })
    }

    /// Source info, both entity lists with today's counters, and the
    /// source-wide window
    pub async fn source_detail_at(
        &self,
        source_id: i64,
        days: u32,
        now: DateTime<Utc>,
    ) -> TrafficResult<SourceDetail> {
        let row: Option<SourceRow> = sqlx::query_as(
            "SELECT id, ip_address, service_name, custom_name, first_seen, last_seen \
             FROM sources WHERE id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        let (id, ip_address, service_name, custom_name, first_seen, last_seen) =
            row.ok_or_else(|| TrafficError::NotFound(format!("service {}", source_id)))?;
        let last_seen = millis_to_datetime(last_seen);

        let inbound_traffics = self.entities_with_today(source_id, EntityKind::Port, now).await?;
        let client_traffics = self.entities_with_today(source_id, EntityKind::Client, now).await?;
        let history = self.query_window_at(&EntityScope::Source { source_id }, days, now).await?;

        Ok(SourceDetail {
            service: SourceInfo {
                id,
                ip_address,
                service_name,
                custom_name,
                first_seen: millis_to_datetime(first_seen),
                last_seen,
                status: self.settings.source_status(last_seen, now),
            },
            inbound_traffics,
            client_traffics,
            history,
        })
    }

    async fn entities_with_today(
        &self,
        source_id: i64,
        kind: EntityKind,
        now: DateTime<Utc>,
    ) -> TrafficResult<Vec<EntitySummary>> {
        let queries = kind.queries();
        let today = self.settings.today(now);

        let rows: Vec<EntityListRow> = sqlx::query_as(queries.select_entities_by_source)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        let today_sql = match self.settings.mode {
            StorageMode::History => queries.today_history_by_source,
            StorageMode::LiveCounters => queries.today_live_by_source,
        };
        let today_rows: Vec<(i64, i64, i64)> = sqlx::query_as(today_sql)
            .bind(source_id)
            .bind(date_key(today))
            .fetch_all(&self.pool)
            .await?;
        let today_map: HashMap<i64, (i64, i64)> =
            today_rows.into_iter().map(|(id, up, down)| (id, (up, down))).collect();

        Ok(rows
            .into_iter()
            .map(|row| {
                let (id, key, port, custom_name, status, last_updated, ..) = row;
                let (today_up, today_down) = today_map.get(&id).copied().unwrap_or((0, 0));
                let last_updated = last_updated.map(millis_to_datetime);
                EntitySummary {
                    id,
                    kind,
                    key,
                    port,
                    custom_name,
                    status,
                    last_updated,
                    today_up,
                    today_down,
                    is_active: self
                        .settings
                        .entity_is_live(last_updated, today_up, today_down, now),
                }
            })
            .collect())
    }

    async fn count_active(&self, kind: EntityKind) -> TrafficResult<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(kind.queries().count_active_by_source)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::report::{ClientTraffic, InboundTraffic, TrafficReport};
    use chrono::TimeDelta;

    fn report(ports: &[(&str, i64, i64)], clients: &[(&str, i64, i64)]) -> TrafficReport {
        TrafficReport {
            inbound_traffics: ports
                .iter()
                .map(|(t, u, d)| InboundTraffic::inbound(*t, *u, *d))
                .collect(),
            client_traffics: clients
                .iter()
                .map(|(e, u, d)| ClientTraffic::new(*e, *u, *d))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_list_sources_counts_and_today_totals() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let yesterday = report(&[("inbound-80", 10, 20), ("inbound-443", 1, 2)], &[("a@x", 5, 5)]);
        db.ingest_at("1.1.1.1", &yesterday, noon() - TimeDelta::days(1))
            .await
            .unwrap();
        db.ingest_at("1.1.1.1", &report(&[("inbound-80", 3, 4)], &[]), noon()).await.unwrap();
        db.ingest_at("2.2.2.2", &report(&[], &[]), noon() - TimeDelta::seconds(60)).await.unwrap();

        let sources = db.list_sources_at(noon() + TimeDelta::seconds(5)).await.unwrap();
        assert_eq!(sources.len(), 2);

        let first = &sources[0];
        assert_eq!(first.ip_address, "1.1.1.1");
        assert_eq!(first.status, "active");
        assert_eq!(first.inbound_count, 2);
        assert_eq!(first.client_count, 1);
        // Yesterday's traffic is not part of today's totals
        assert_eq!((first.total_inbound_up, first.total_inbound_down), (3, 4));

        let second = &sources[1];
        assert_eq!(second.status, "inactive");
        assert_eq!((second.inbound_count, second.client_count), (0, 0));
        assert_eq!((second.total_inbound_up, second.total_inbound_down), (0, 0));
    }

    #[tokio::test]
    async fn test_traffic_summary_sums_sources() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        db.ingest_at("1.1.1.1", &report(&[("inbound-80", 10, 20)], &[]), noon()).await.unwrap();
        db.ingest_at("2.2.2.2", &report(&[("inbound-80", 1, 2)], &[]), noon()).await.unwrap();

        let summary = db.traffic_summary_at(noon()).await.unwrap();
        assert_eq!(summary.total_services, 2);
        assert_eq!(summary.total_up, 11);
        assert_eq!(summary.total_down, 22);
        assert_eq!(summary.total_traffic, 33);
    }

    #[tokio::test]
    async fn test_live_mode_summary_reads_counters() {
        let db = Database::in_memory(settings(StorageMode::LiveCounters)).await;
        db.ingest_at("1.1.1.1", &report(&[("inbound-80", 10, 20)], &[]), noon()).await.unwrap();

        let sources = db.list_sources_at(noon()).await.unwrap();
        assert_eq!((sources[0].total_inbound_up, sources[0].total_inbound_down), (10, 20));

        // Counter dated yesterday no longer counts as today
        let sources = db.list_sources_at(noon() + TimeDelta::days(1)).await.unwrap();
        assert_eq!((sources[0].total_inbound_up, sources[0].total_inbound_down), (0, 0));
    }

    #[tokio::test]
    async fn test_source_detail() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let outcome = db
            .ingest_at(
                "1.1.1.1",
                &report(&[("inbound-80", 10, 20), ("inbound-443", 0, 0)], &[("a@x", 5, 6)]),
                noon(),
            )
            .await
            .unwrap();

        let detail = db
            .source_detail_at(outcome.source_id, 7, noon() + TimeDelta::seconds(1))
            .await
            .unwrap();
        assert_eq!(detail.service.ip_address, "1.1.1.1");
        assert_eq!(detail.service.service_name, "node-1.1.1.1");
        assert_eq!(detail.inbound_traffics.len(), 2);

        let port_80 = detail.inbound_traffics.iter().find(|e| e.key == "inbound-80").unwrap();
        assert_eq!((port_80.port, port_80.today_up, port_80.today_down), (80, 10, 20));
        assert!(port_80.is_active);
        let port_443 = detail.inbound_traffics.iter().find(|e| e.key == "inbound-443").unwrap();
        assert!(!port_443.is_active);

        assert_eq!(detail.client_traffics.len(), 1);
        assert_eq!(detail.client_traffics[0].today_up, 5);
        assert_eq!(detail.history.upload_data, vec![0, 0, 0, 0, 0, 0, 10]);

        let clamped = db.source_detail_at(outcome.source_id, 0, noon()).await.unwrap();
        assert_eq!(clamped.history.len(), 7);
    }

    #[tokio::test]
    async fn test_timestamped_rows_count_as_today_in_every_view() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let outcome = db
            .ingest_at("1.1.1.1", &report(&[("inbound-80", 0, 0)], &[]), noon())
            .await
            .unwrap();
        let (entity_id,): (i64,) =
            sqlx::query_as("SELECT id FROM port_entities WHERE tag = 'inbound-80'")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        // Row written with a time-of-day suffix next to a plain one for the same day
        sqlx::query(
            "INSERT INTO port_history (entity_id, date, daily_up, daily_down) \
             VALUES (?, '2024-05-10 00:00:00', 500, 600)",
        )
        .bind(entity_id)
        .execute(&db.pool)
        .await
        .unwrap();
        db.ingest_at("1.1.1.1", &report(&[("inbound-80", 1, 2)], &[]), noon()).await.unwrap();

        let entity = db
            .entity_detail_at(outcome.source_id, EntityKind::Port, "inbound-80", 7, noon())
            .await
            .unwrap();
        assert_eq!((entity.info.today_up, entity.info.today_down), (501, 602));
        assert_eq!(entity.history.upload_data.last(), Some(&501));

        let sources = db.list_sources_at(noon()).await.unwrap();
        assert_eq!((sources[0].total_inbound_up, sources[0].total_inbound_down), (501, 602));

        let detail = db.source_detail_at(outcome.source_id, 7, noon()).await.unwrap();
        let port = &detail.inbound_traffics[0];
        assert_eq!((port.today_up, port.today_down), (501, 602));
        assert_eq!(detail.history.upload_data.last(), Some(&501));
    }

    #[tokio::test]
    async fn test_source_detail_missing() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let err = db.source_detail_at(99, 7, noon()).await.unwrap_err();
        assert!(matches!(err, TrafficError::NotFound(_)));
    }
}
