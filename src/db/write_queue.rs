//! Single writer for ingest and rollover
//!
//! Commands are sent to a channel and applied one at a time, each in its own
//! transaction, so concurrent reports never race each other or a rollover
//! for a SQLite write lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::{Database, IngestOutcome, RawRequest, RolloverReport};
use crate::error::{TrafficError, TrafficResult};
use crate::report::TrafficReport;

enum WriteCommand {
    Ingest {
        source_ip: String,
        report: TrafficReport,
        raw: Option<RawRequest>,
        now: DateTime<Utc>,
        reply: oneshot::Sender<TrafficResult<IngestOutcome>>,
    },
    Rollover {
        now: DateTime<Utc>,
        reply: oneshot::Sender<TrafficResult<RolloverReport>>,
    },
}

/// Cloneable handle for queueing writes
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

/// Start the writer background task
pub fn start_write_queue(db: Arc<Database>) -> WriteQueue {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_queue_task(db, rx));
    WriteQueue { tx }
}

impl WriteQueue {
    pub async fn ingest(
        &self,
        source_ip: &str,
        report: TrafficReport,
        raw: Option<RawRequest>,
        now: DateTime<Utc>,
    ) -> TrafficResult<IngestOutcome> {
        let (reply, rx) = oneshot::channel();
        let source_ip = source_ip.to_string();
        self.send(WriteCommand::Ingest { source_ip, report, raw, now, reply })?;
        rx.await.map_err(|_| closed())?
    }

    pub async fn rollover(&self, now: DateTime<Utc>) -> TrafficResult<RolloverReport> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Rollover { now, reply })?;
        rx.await.map_err(|_| closed())?
    }

    fn send(&self, command: WriteCommand) -> TrafficResult<()> {
        self.tx.send(command).map_err(|_| closed())
    }
}

fn closed() -> TrafficError {
    TrafficError::Unavailable("write queue is not running".to_string())
}

async fn write_queue_task(db: Arc<Database>, mut rx: mpsc::UnboundedReceiver<WriteCommand>) {
    info!("Write queue started");

    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Ingest { source_ip, report, raw, now, reply } => {
                let result = db.ingest_with_raw_at(&source_ip, &report, raw.as_ref(), now).await;
                if let Err(e) = &result {
                    error!("Failed to ingest report from {}: {}", source_ip, e);
                }
                // Caller may have gone away; the write is committed either way
                if reply.send(result).is_err() {
                    debug!("Ingest caller for {} dropped before reply", source_ip);
                }
            }
            WriteCommand::Rollover { now, reply } => {
                let result = db.rollover_at(now).await;
                if let Err(e) = &result {
                    error!("Rollover failed: {}", e);
                }
                if reply.send(result).is_err() {
                    debug!("Rollover caller dropped before reply");
                }
            }
        }
    }

    info!("Write queue shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageMode;
    use crate::db::test_support::*;
    use crate::db::EntityKind;
    use crate::report::InboundTraffic;

    fn port_report(up: i64, down: i64) -> TrafficReport {
        TrafficReport {
            inbound_traffics: vec![InboundTraffic::inbound("inbound-443", up, down)],
            client_traffics: vec![],
        }
    }

    #[tokio::test]
    async fn test_concurrent_ingests_all_land() {
        let db = Arc::new(Database::in_memory(settings(StorageMode::LiveCounters)).await);
        let queue = start_write_queue(db.clone());

        let mut handles = Vec::new();
        for i in 1..=20 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.ingest("1.2.3.4", port_report(i, 1), None, noon()).await
            }));
        }
        let mut source_id = 0;
        for handle in handles {
            source_id = handle.await.unwrap().unwrap().source_id;
        }

        let detail = db
            .entity_detail_at(source_id, EntityKind::Port, "inbound-443", 7, noon())
            .await
            .unwrap();
        assert_eq!(detail.info.today_up, (1..=20).sum::<i64>());
        assert_eq!(detail.info.today_down, 20);
        assert_eq!(detail.info.total_up, (1..=20).sum::<i64>());
    }

    #[tokio::test]
    async fn test_rollover_goes_through_queue() {
        let db = Arc::new(Database::in_memory(settings(StorageMode::LiveCounters)).await);
        let queue = start_write_queue(db.clone());
        queue.ingest("1.2.3.4", port_report(5, 5), None, noon()).await.unwrap();

        let report = queue.rollover(noon() + chrono::TimeDelta::days(1)).await.unwrap();
        assert_eq!(report.closed_ports, 1);
    }

    #[tokio::test]
    async fn test_errors_are_returned_to_caller() {
        let db = Arc::new(Database::in_memory(settings(StorageMode::History)).await);
        let queue = start_write_queue(db);
        let err = queue.ingest("  ", port_report(1, 1), None, noon()).await.unwrap_err();
        assert!(matches!(err, TrafficError::Validation(_)));
    }
}
