//! Counter accumulation for incoming traffic reports

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, warn};

use super::archive::{record_raw_request, RawRequest};
use super::{date_key, Database, EntityKind};
use crate::config::StorageMode;
use crate::error::{TrafficError, TrafficResult};
use crate::report::{extract_port, TrafficReport};

/// What one report changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub source_id: i64,
    /// Entities with nonzero traffic in this report
    pub active_ports: usize,
    pub active_clients: usize,
    /// Entries that were skipped (empty key)
    pub skipped: usize,
}

impl Database {
    /// Apply one report from `source_ip` atomically, without archiving it
    pub async fn ingest_at(
        &self,
        source_ip: &str,
        report: &TrafficReport,
        now: DateTime<Utc>,
    ) -> TrafficResult<IngestOutcome> {
        self.ingest_with_raw_at(source_ip, report, None, now).await
    }

    /// Apply one report from `source_ip` atomically.
    ///
    /// Every entity row is ensured; only nonzero deltas accumulate into
    /// today's history bucket and bump `last_updated`. The source's
    /// `last_seen` is refreshed even when every delta is zero. When `raw` is
    /// given, the request is archived in the same transaction.
    pub async fn ingest_with_raw_at(
        &self,
        source_ip: &str,
        report: &TrafficReport,
        raw: Option<&RawRequest>,
        now: DateTime<Utc>,
    ) -> TrafficResult<IngestOutcome> {
        let source_ip = source_ip.trim();
        if source_ip.is_empty() {
            return Err(TrafficError::Validation("source ip must not be empty".to_string()));
        }

        let today = self.settings.today(now);
        let now_ms = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let source_id = resolve_source(&mut tx, source_ip, now_ms).await?;
        let mut outcome = IngestOutcome { source_id, ..IngestOutcome::default() };

        if let Some(raw) = raw {
            record_raw_request(&mut tx, source_id, source_ip, raw, report, now_ms).await?;
        }

        for traffic in &report.inbound_traffics {
            if !traffic.is_inbound {
                continue;
            }
            let tag = traffic.tag.trim();
            if tag.is_empty() {
                warn!("Skipping inbound entry with empty tag from {}", source_ip);
                outcome.skipped += 1;
                continue;
            }
            let port = extract_port(tag);
            if port == 0 {
                debug!("No port in tag '{}', storing port 0", tag);
            }
            let entity_id =
                resolve_entity(&mut tx, EntityKind::Port, source_id, tag, Some(port), now_ms)
                    .await?;
            let delta = (traffic.up, traffic.down);
            let active = self
                .accumulate(&mut tx, EntityKind::Port, entity_id, today, delta, now_ms)
                .await?;
            if active {
                outcome.active_ports += 1;
            }
        }

        for traffic in &report.client_traffics {
            let email = traffic.email.trim();
            if email.is_empty() {
                warn!("Skipping client entry with empty email from {}", source_ip);
                outcome.skipped += 1;
                continue;
            }
            let entity_id =
                resolve_entity(&mut tx, EntityKind::Client, source_id, email, None, now_ms).await?;
            let delta = (traffic.up, traffic.down);
            let active = self
                .accumulate(&mut tx, EntityKind::Client, entity_id, today, delta, now_ms)
                .await?;
            if active {
                outcome.active_clients += 1;
            }
        }

        sqlx::query("UPDATE sources SET last_seen = ? WHERE id = ?")
            .bind(now_ms)
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            "Ingested report from {} (ports={}, clients={}, skipped={})",
            source_ip, outcome.active_ports, outcome.active_clients, outcome.skipped
        );
        Ok(outcome)
    }

    /// Add one delta into today's bucket. Returns false for zero deltas,
    /// which leave history and `last_updated` untouched.
    async fn accumulate(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        kind: EntityKind,
        entity_id: i64,
        today: NaiveDate,
        (up, down): (i64, i64),
        now_ms: i64,
    ) -> TrafficResult<bool> {
        if up <= 0 && down <= 0 {
            return Ok(false);
        }
        let queries = kind.queries();
        let date = date_key(today);

        sqlx::query(queries.upsert_history_add)
            .bind(entity_id)
            .bind(&date)
            .bind(up)
            .bind(down)
            .execute(&mut **tx)
            .await?;

        sqlx::query(queries.touch_entity)
            .bind(now_ms)
            .bind(entity_id)
            .execute(&mut **tx)
            .await?;

        if self.settings.mode == StorageMode::LiveCounters {
            sqlx::query(queries.add_live)
                .bind(&date)
                .bind(up)
                .bind(up)
                .bind(&date)
                .bind(down)
                .bind(down)
                .bind(&date)
                .bind(entity_id)
                .execute(&mut **tx)
                .await?;
        }

        Ok(true)
    }
}

async fn resolve_source(
    tx: &mut Transaction<'_, Sqlite>,
    ip: &str,
    now_ms: i64,
) -> TrafficResult<i64> {
    sqlx::query(
        "INSERT INTO sources (ip_address, service_name, first_seen, last_seen) VALUES (?, ?, ?, ?) \
         ON CONFLICT(ip_address) DO NOTHING",
    )
    .bind(ip)
    .bind(format!("node-{}", ip))
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;

    let row: (i64,) = sqlx::query_as("SELECT id FROM sources WHERE ip_address = ?")
        .bind(ip)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.0)
}

async fn resolve_entity(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    source_id: i64,
    key: &str,
    port: Option<u16>,
    now_ms: i64,
) -> TrafficResult<i64> {
    let queries = kind.queries();

    let mut insert = sqlx::query(queries.insert_entity).bind(source_id).bind(key).bind(now_ms);
    if let Some(port) = port {
        insert = insert.bind(i64::from(port));
    }
    insert.execute(&mut **tx).await?;

    let row: (i64,) = sqlx::query_as(queries.select_entity_id)
        .bind(source_id)
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;
    Ok(row.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::test_support::*;
    use crate::report::{ClientTraffic, InboundTraffic};
    use chrono::TimeDelta;

    fn report(inbound: Vec<InboundTraffic>, clients: Vec<ClientTraffic>) -> TrafficReport {
        TrafficReport { client_traffics: clients, inbound_traffics: inbound }
    }

    async fn history(db: &Database, table: &str) -> Vec<(i64, String, i64, i64)> {
        let sql = format!(
            "SELECT entity_id, date, daily_up, daily_down FROM {} ORDER BY entity_id, date",
            table
        );
        sqlx::query_as(&sql).fetch_all(&db.pool).await.unwrap()
    }

    async fn scalar(db: &Database, sql: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(sql).fetch_one(&db.pool).await.unwrap();
        row.0
    }

    #[tokio::test]
    async fn test_repeated_reports_accumulate() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let t0 = noon();
        let t1 = t0 + TimeDelta::seconds(1);

        let first = report(vec![InboundTraffic::inbound("inbound-8443", 100, 50)], vec![]);
        db.ingest_at("1.2.3.4", &first, t0).await.unwrap();
        let second = report(vec![InboundTraffic::inbound("inbound-8443", 30, 10)], vec![]);
        db.ingest_at("1.2.3.4", &second, t1).await.unwrap();

        let (port, last_updated): (i64, Option<i64>) = sqlx::query_as(
            "SELECT port, last_updated FROM port_entities WHERE tag = 'inbound-8443'",
        )
        .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(port, 8443);
        assert_eq!(last_updated, Some(t1.timestamp_millis()));

        let rows = history(&db, "port_history").await;
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].1.as_str(), rows[0].2, rows[0].3), ("2024-05-10", 130, 60));
    }

    #[tokio::test]
    async fn test_accumulation_is_order_independent() {
        let deltas = [(5, 1), (40, 0), (0, 7), (12, 12)];
        let mut totals = Vec::new();

        for order in [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]] {
            let db = Database::in_memory(settings(StorageMode::History)).await;
            for i in order {
                let (up, down) = deltas[i];
                let batch = report(vec![], vec![ClientTraffic::new("a@x", up, down)]);
                db.ingest_at("1.2.3.4", &batch, noon()).await.unwrap();
            }
            let rows = history(&db, "client_history").await;
            assert_eq!(rows.len(), 1);
            totals.push((rows[0].2, rows[0].3));
        }

        assert!(totals.iter().all(|t| *t == (57, 20)));
    }

    #[tokio::test]
    async fn test_concurrent_ingests_are_all_counted() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let mut handles = Vec::new();
        for _ in 0..10 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                let batch = report(vec![InboundTraffic::inbound("inbound-443", 3, 4)], vec![]);
                db.ingest_at("5.6.7.8", &batch, noon()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let rows = history(&db, "port_history").await;
        assert_eq!((rows[0].2, rows[0].3), (30, 40));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingests_on_shared_wal_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("traffic.db").display().to_string(),
            max_connections: 4,
            busy_timeout_ms: 10_000,
        };
        let db = Database::new(&config, settings(StorageMode::LiveCounters)).await.unwrap();
        db.run_migrations().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..24 {
            let db = db.clone();
            let ip = if i % 2 == 0 { "5.6.7.8" } else { "9.9.9.9" };
            handles.push(tokio::spawn(async move {
                let r = report(
                    vec![InboundTraffic::inbound("inbound-443", 3, 4)],
                    vec![ClientTraffic::new("a@x", 1, 2)],
                );
                db.ingest_at(ip, &r, noon()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let ports: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT h.daily_up, h.daily_down, p.live_up, p.live_down \
             FROM port_history h JOIN port_entities p ON p.id = h.entity_id ORDER BY p.id",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        assert_eq!(ports, vec![(36, 48, 36, 48), (36, 48, 36, 48)]);

        let clients = history(&db, "client_history").await;
        let totals: Vec<_> = clients.iter().map(|r| (r.2, r.3)).collect();
        assert_eq!(totals, vec![(12, 24), (12, 24)]);

        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM sources").await, 2);
    }

    #[tokio::test]
    async fn test_zero_delta_heartbeat_only_touches_source() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let t0 = noon();
        let first = report(vec![InboundTraffic::inbound("inbound-80", 10, 10)], vec![]);
        db.ingest_at("1.2.3.4", &first, t0).await.unwrap();

        let t1 = t0 + TimeDelta::seconds(30);
        let outcome = db
            .ingest_at(
                "1.2.3.4",
                &report(
                    vec![
                        InboundTraffic::inbound("inbound-80", 0, 0),
                        InboundTraffic::inbound("inbound-81", 0, 0),
                    ],
                    vec![ClientTraffic::new("idle@x", 0, 0)],
                ),
                t1,
            )
            .await
            .unwrap();
        assert_eq!(outcome.active_ports, 0);
        assert_eq!(outcome.active_clients, 0);

        let last_seen = scalar(&db, "SELECT last_seen FROM sources").await;
        assert_eq!(last_seen, t1.timestamp_millis());

        let touched: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT tag, last_updated FROM port_entities ORDER BY tag")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        assert_eq!(touched[0], ("inbound-80".to_string(), Some(t0.timestamp_millis())));
        assert_eq!(touched[1], ("inbound-81".to_string(), None));

        assert_eq!(history(&db, "port_history").await.len(), 1);
        assert!(history(&db, "client_history").await.is_empty());
    }

    #[tokio::test]
    async fn test_outbound_and_empty_keys_are_skipped() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let mut outbound = InboundTraffic::inbound("direct", 99, 99);
        outbound.is_inbound = false;
        outbound.is_outbound = true;

        let outcome = db
            .ingest_at(
                "1.2.3.4",
                &report(
                    vec![
                        outbound,
                        InboundTraffic::inbound("  ", 1, 1),
                        InboundTraffic::inbound("hysteria2", 1, 2),
                    ],
                    vec![ClientTraffic::new("", 5, 5)],
                ),
                noon(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.active_ports, 1);

        let tags: Vec<(String, i64)> = sqlx::query_as("SELECT tag, port FROM port_entities")
            .fetch_all(&db.pool)
            .await
            .unwrap();
        assert_eq!(tags, vec![("hysteria2".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_day_boundary_opens_new_bucket() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let evening = noon() + TimeDelta::hours(11);
        let after_midnight = noon() + TimeDelta::hours(12) + TimeDelta::minutes(1);
        let r = report(vec![], vec![ClientTraffic::new("a@x", 1, 1)]);
        db.ingest_at("1.2.3.4", &r, evening).await.unwrap();
        db.ingest_at("1.2.3.4", &r, after_midnight).await.unwrap();

        let rows = history(&db, "client_history").await;
        let dates: Vec<&str> = rows.iter().map(|r| r.1.as_str()).collect();
        assert_eq!(dates, vec!["2024-05-10", "2024-05-11"]);
    }

    #[tokio::test]
    async fn test_live_counters_track_open_day() {
        let db = Database::in_memory(settings(StorageMode::LiveCounters)).await;
        let r = report(vec![InboundTraffic::inbound("inbound-1080", 10, 20)], vec![]);
        db.ingest_at("1.2.3.4", &r, noon()).await.unwrap();
        db.ingest_at("1.2.3.4", &r, noon()).await.unwrap();

        let live: (i64, i64, Option<String>) =
            sqlx::query_as("SELECT live_up, live_down, live_date FROM port_entities")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(live, (20, 40, Some("2024-05-10".to_string())));

        // Next day restarts the counter instead of adding to yesterday's
        db.ingest_at("1.2.3.4", &r, noon() + TimeDelta::days(1)).await.unwrap();
        let live: (i64, i64, Option<String>) =
            sqlx::query_as("SELECT live_up, live_down, live_date FROM port_entities")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(live, (10, 20, Some("2024-05-11".to_string())));
    }

    #[tokio::test]
    async fn test_empty_source_ip_is_rejected() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let err = db.ingest_at("  ", &TrafficReport::default(), noon()).await.unwrap_err();
        assert!(matches!(err, TrafficError::Validation(_)));
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM sources").await, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let first = report(vec![], vec![ClientTraffic::new("a@x", 1, 1)]);
        db.ingest_at("1.2.3.4", &first, noon()).await.unwrap();

        // Break the client history table so the second write of the batch fails
        sqlx::query("DROP TABLE client_history").execute(&db.pool).await.unwrap();

        let later = noon() + TimeDelta::seconds(10);
        let err = db
            .ingest_at(
                "1.2.3.4",
                &report(
                    vec![InboundTraffic::inbound("inbound-80", 5, 5)],
                    vec![ClientTraffic::new("a@x", 1, 1)],
                ),
                later,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TrafficError::Storage(_)));

        assert!(history(&db, "port_history").await.is_empty());
        assert_eq!(scalar(&db, "SELECT COUNT(*) FROM port_entities").await, 0);
        let last_seen = scalar(&db, "SELECT last_seen FROM sources").await;
        assert_eq!(last_seen, noon().timestamp_millis());
    }
}
