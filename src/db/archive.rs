//! Archive of accepted report bodies
//!
//! Every report that reaches storage is kept verbatim next to the counters
//! it produced, in the same transaction, so a questionable total can be
//! traced back to what the node actually sent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, Transaction};

use super::{millis_to_datetime, Database};
use crate::error::{TrafficError, TrafficResult};
use crate::report::TrafficReport;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 1000;

/// A request as it arrived
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub user_agent: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRequestFilter {
    pub service_id: Option<i64>,
    /// Defaults to 50, capped at 1000
    pub limit: Option<i64>,
}

impl RawRequestFilter {
    fn limit(&self) -> i64 {
        match self.limit {
            Some(n) if n > 0 => n.min(MAX_LIMIT),
            _ => DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RawRequestRecord {
    pub id: i64,
    pub service_id: i64,
    pub service_ip: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    /// Decoded JSON, or the stored text if it is not JSON
    pub request_body: Value,
    /// The report as it was applied; only on single-record reads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_data: Option<Value>,
    pub received_at: DateTime<Utc>,
}

type RawRow = (i64, i64, String, String, Option<String>, String, Option<String>, i64);

fn decode(text: String) -> Value {
    match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => Value::String(text),
    }
}

impl RawRequestRecord {
    fn from_row(row: RawRow, with_parsed: bool) -> Self {
        let (id, service_id, service_ip, client_ip, user_agent, body, parsed, received_at) = row;
        Self {
            id,
            service_id,
            service_ip,
            client_ip,
            user_agent,
            request_body: decode(body),
            parsed_data: if with_parsed { parsed.map(decode) } else { None },
            received_at: millis_to_datetime(received_at),
        }
    }
}

const SELECT_RAW: &str = r#"
    SELECT r.id, r.source_id, s.ip_address, r.client_ip, r.user_agent,
           r.request_body, r.parsed_data, r.received_at
    FROM raw_requests r
    JOIN sources s ON s.id = r.source_id
"#;

/// Store one accepted request inside the ingest transaction
pub(super) async fn record_raw_request(
    tx: &mut Transaction<'_, Sqlite>,
    source_id: i64,
    client_ip: &str,
    raw: &RawRequest,
    report: &TrafficReport,
    now_ms: i64,
) -> TrafficResult<()> {
    let parsed = serde_json::to_string(report).ok();
    sqlx::query(
        "INSERT INTO raw_requests \
         (source_id, client_ip, user_agent, request_body, parsed_data, received_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(source_id)
    .bind(client_ip)
    .bind(raw.user_agent.as_deref())
    .bind(&raw.body)
    .bind(parsed)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Database {
    /// Archived requests, newest first
    pub async fn raw_requests(
        &self,
        filter: &RawRequestFilter,
    ) -> TrafficResult<Vec<RawRequestRecord>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_RAW);
        query.push(" WHERE 1 = 1");
        if let Some(service_id) = filter.service_id {
            query.push(" AND r.source_id = ").push_bind(service_id);
        }
        query
            .push(" ORDER BY r.received_at DESC, r.id DESC LIMIT ")
            .push_bind(filter.limit());

        let rows = query.build_query_as::<RawRow>().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| RawRequestRecord::from_row(row, false))
            .collect())
    }

    pub async fn raw_request(&self, id: i64) -> TrafficResult<RawRequestRecord> {
        let sql = format!("{} WHERE r.id = ?", SELECT_RAW);
        let row: Option<RawRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| RawRequestRecord::from_row(row, true))
            .ok_or_else(|| TrafficError::NotFound(format!("raw request {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageMode;
    use crate::db::test_support::*;
    use crate::report::InboundTraffic;
    use chrono::TimeDelta;

    fn raw(body: &str) -> RawRequest {
        RawRequest { user_agent: Some("xray-reporter/1.2".to_string()), body: body.to_string() }
    }

    fn port_report(up: i64) -> TrafficReport {
        TrafficReport {
            inbound_traffics: vec![InboundTraffic::inbound("inbound-443", up, 0)],
            client_traffics: vec![],
        }
    }

    async fn seeded() -> (Database, i64) {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        let first = db
            .ingest_with_raw_at("1.1.1.1", &port_report(1), Some(&raw(r#"{"n":1}"#)), noon())
            .await
            .unwrap();
        let later = noon() + TimeDelta::seconds(10);
        db.ingest_with_raw_at("1.1.1.1", &port_report(2), Some(&raw("not json")), later)
            .await
            .unwrap();
        db.ingest_with_raw_at("2.2.2.2", &port_report(3), Some(&raw(r#"{"n":3}"#)), later)
            .await
            .unwrap();
        (db, first.source_id)
    }

    #[tokio::test]
    async fn test_ingest_archives_request() {
        let (db, source_id) = seeded().await;
        let records = db
            .raw_requests(&RawRequestFilter { service_id: Some(source_id), limit: None })
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_body, Value::String("not json".to_string()));
        assert_eq!(records[1].request_body, serde_json::json!({"n": 1}));
        assert_eq!(records[1].user_agent.as_deref(), Some("xray-reporter/1.2"));
        assert_eq!(records[1].service_ip, "1.1.1.1");
        assert!(records.iter().all(|r| r.parsed_data.is_none()));
    }

    #[tokio::test]
    async fn test_limit_and_defaults() {
        let (db, _) = seeded().await;
        assert_eq!(db.raw_requests(&RawRequestFilter::default()).await.unwrap().len(), 3);
        let one = RawRequestFilter { service_id: None, limit: Some(1) };
        assert_eq!(db.raw_requests(&one).await.unwrap().len(), 1);
        assert_eq!(RawRequestFilter { service_id: None, limit: Some(0) }.limit(), 50);
        assert_eq!(RawRequestFilter { service_id: None, limit: Some(5000) }.limit(), 1000);
    }

    #[tokio::test]
    async fn test_detail_includes_applied_report() {
        let (db, source_id) = seeded().await;
        let filter = RawRequestFilter { service_id: Some(source_id), limit: None };
        let oldest = db.raw_requests(&filter).await.unwrap().pop().unwrap();

        let detail = db.raw_request(oldest.id).await.unwrap();
        let parsed = detail.parsed_data.unwrap();
        assert_eq!(parsed["inboundTraffics"][0]["tag"], "inbound-443");
        assert_eq!(parsed["inboundTraffics"][0]["up"], 1);

        assert!(matches!(db.raw_request(9999).await, Err(TrafficError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ingest_without_raw_stores_nothing() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        db.ingest_at("1.1.1.1", &port_report(1), noon()).await.unwrap();
        assert!(db.raw_requests(&RawRequestFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_ingest_archives_nothing() {
        let db = Database::in_memory(settings(StorageMode::History)).await;
        sqlx::query("DROP TABLE port_history").execute(&db.pool).await.unwrap();
        let result = db
            .ingest_with_raw_at("1.1.1.1", &port_report(1), Some(&raw("{}")), noon())
            .await;
        assert!(matches!(result, Err(TrafficError::Storage(_))));
        assert!(db.raw_requests(&RawRequestFilter::default()).await.unwrap().is_empty());
    }
}
