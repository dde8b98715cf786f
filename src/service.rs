//! Traffic service
//!
//! The one object the HTTP layer, the scheduler and the sync poller talk to.
//! Writes that can conflict go through the write queue; everything else reads
//! or writes the database directly. The wall clock is read here so the
//! storage layer can stay clock-free.

use std::sync::Arc;

use chrono::Utc;

use crate::db::write_queue::{start_write_queue, WriteQueue};
use crate::db::{
    Database, EntityDetail, EntityKind, EntityScope, HistoryFilter, HistoryRecord, IngestOutcome,
    RawRequest, RawRequestFilter, RawRequestRecord, RolloverReport, Series, SourceDetail,
    SourceSummary, TrafficSettings, TrafficSummary,
};
use crate::error::TrafficResult;
use crate::report::TrafficReport;

#[derive(Clone)]
pub struct TrafficService {
    db: Arc<Database>,
    writes: WriteQueue,
}

impl TrafficService {
    /// Wrap a migrated database and start its writer task
    pub fn new(db: Database) -> Self {
        let db = Arc::new(db);
        let writes = start_write_queue(db.clone());
        Self { db, writes }
    }

    pub fn settings(&self) -> &TrafficSettings {
        self.db.settings()
    }

    /// Queue one report. `raw` is archived alongside the counters when given.
    pub async fn ingest(
        &self,
        source_ip: &str,
        report: TrafficReport,
        raw: Option<RawRequest>,
    ) -> TrafficResult<IngestOutcome> {
        self.writes.ingest(source_ip, report, raw, Utc::now()).await
    }

    pub async fn rollover(&self) -> TrafficResult<RolloverReport> {
        self.writes.rollover(Utc::now()).await
    }

    pub async fn list_sources(&self) -> TrafficResult<Vec<SourceSummary>> {
        self.db.list_sources_at(Utc::now()).await
    }

    pub async fn traffic_summary(&self) -> TrafficResult<TrafficSummary> {
        self.db.traffic_summary_at(Utc::now()).await
    }

    pub async fn source_detail(&self, source_id: i64, days: u32) -> TrafficResult<SourceDetail> {
        self.db.source_detail_at(source_id, days, Utc::now()).await
    }

    pub async fn source_window(&self, source_id: i64, days: u32) -> TrafficResult<Series> {
        self.db.query_window_at(&EntityScope::Source { source_id }, days, Utc::now()).await
    }

    pub async fn entity_detail(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
        days: u32,
    ) -> TrafficResult<EntityDetail> {
        self.db.entity_detail_at(source_id, kind, key, days, Utc::now()).await
    }

    pub async fn export_history(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
    ) -> TrafficResult<Series> {
        self.db.export_history_at(source_id, kind, key, Utc::now()).await
    }

    pub async fn history_records(
        &self,
        filter: &HistoryFilter,
    ) -> TrafficResult<Vec<HistoryRecord>> {
        self.db.history_records(filter).await
    }

    pub async fn raw_requests(
        &self,
        filter: &RawRequestFilter,
    ) -> TrafficResult<Vec<RawRequestRecord>> {
        self.db.raw_requests(filter).await
    }

    pub async fn raw_request(&self, id: i64) -> TrafficResult<RawRequestRecord> {
        self.db.raw_request(id).await
    }

    pub async fn delete_source(&self, source_id: i64) -> TrafficResult<()> {
        self.db.delete_source(source_id).await
    }

    pub async fn rename_source(&self, source_id: i64, name: Option<&str>) -> TrafficResult<()> {
        self.db.rename_source(source_id, name).await
    }

    pub async fn rename_entity(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
        name: Option<&str>,
    ) -> TrafficResult<()> {
        self.db.rename_entity(source_id, kind, key, name).await
    }

    pub async fn healthy(&self) -> bool {
        self.db.ping().await
    }
}
