//! Daily rollover of live counters into history

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

use super::{date_key, normalize_date, Database, EntityKind};
use crate::config::StorageMode;
use crate::error::TrafficResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloverReport {
    pub mode: &'static str,
    /// Counters written out as a history row
    pub closed_ports: usize,
    pub closed_clients: usize,
    /// Rows whose live counters were zeroed
    pub reset: u64,
    pub executed_at: DateTime<Utc>,
}

impl Database {
    /// Close out every live counter dated before today.
    ///
    /// Each nonzero counter guarantees a history row for its own date holding
    /// at least the counter value, then the counter is zeroed. Counters dated
    /// today are left alone, so running this again (or mid-day) changes nothing.
    /// In history mode there are no counters and this is a no-op.
    pub async fn rollover_at(&self, now: DateTime<Utc>) -> TrafficResult<RolloverReport> {
        let mut report = RolloverReport {
            mode: self.settings.mode.as_str(),
            closed_ports: 0,
            closed_clients: 0,
            reset: 0,
            executed_at: now,
        };

        if self.settings.mode == StorageMode::History {
            debug!("Rollover skipped: history storage has no live counters");
            return Ok(report);
        }

        let today = self.settings.today(now);
        let mut tx = self.pool.begin().await?;

        let (closed, reset) = close_out(&mut tx, EntityKind::Port, today).await?;
        report.closed_ports = closed;
        report.reset += reset;

        let (closed, reset) = close_out(&mut tx, EntityKind::Client, today).await?;
        report.closed_clients = closed;
        report.reset += reset;

        tx.commit().await?;

        info!(
            "Daily rollover done: {} ports, {} clients closed out, {} counters reset",
            report.closed_ports, report.closed_clients, report.reset
        );
        Ok(report)
    }
}

async fn close_out(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    today: NaiveDate,
) -> TrafficResult<(usize, u64)> {
    let queries = kind.queries();
    let today_key = date_key(today);

    let stale: Vec<(i64, String, i64, i64, String)> = sqlx::query_as(queries.select_stale_live)
        .bind(&today_key)
        .fetch_all(&mut **tx)
        .await?;

    let mut closed = 0;
    for (entity_id, key, up, down, live_date) in &stale {
        let Some(date) = normalize_date(live_date) else {
            debug!(
                "{} {}: unreadable live date '{}', resetting without history",
                kind.as_str(),
                key,
                live_date
            );
            continue;
        };
        sqlx::query(queries.upsert_history_close)
            .bind(entity_id)
            .bind(date_key(date))
            .bind(up)
            .bind(down)
            .execute(&mut **tx)
            .await?;
        debug!("{} {}: closed {} with up={}, down={}", kind.as_str(), key, date, up, down);
        closed += 1;
    }

    let reset = sqlx::query(queries.reset_stale_live)
        .bind(&today_key)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    Ok((closed, reset))
}
