//! Terminal job reports and where they go.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Summary emitted once per job when it reaches a terminal state.
///
/// A fatal job carries `fatal = true`, a reason and zero counts: nothing
/// was attempted. A completed job carries its totals, which may include
/// failed rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReport {
    pub job_id: Uuid,
    pub table_name: String,
    pub succeeded: u64,
    pub failed: u64,
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl IngestionReport {
    pub fn completed(
        job_id: Uuid,
        table_name: impl Into<String>,
        succeeded: u64,
        failed: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            table_name: table_name.into(),
            succeeded,
            failed,
            fatal: false,
            reason: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn fatal(
        job_id: Uuid,
        table_name: impl Into<String>,
        reason: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            table_name: table_name.into(),
            succeeded: 0,
            failed: 0,
            fatal: true,
            reason: Some(reason.into()),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Downstream consumer of job reports (event publisher, metadata registry).
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn deliver(&self, report: &IngestionReport);
}

/// Writes each report to the log.
pub struct LogSink;

#[async_trait]
impl CompletionSink for LogSink {
    async fn deliver(&self, report: &IngestionReport) {
        if report.fatal {
            log::error!(
                "job {}: {} failed: {}",
                report.job_id,
                report.table_name,
                report.reason.as_deref().unwrap_or("unknown")
            );
        } else {
            log::info!(
                "job {}: {} done, {} ok / {} failed in {} ms",
                report.job_id,
                report.table_name,
                report.succeeded,
                report.failed,
                (report.finished_at - report.started_at).num_milliseconds()
            );
        }
    }
}

/// Forwards reports into a channel for an embedding application.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<IngestionReport>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IngestionReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CompletionSink for ChannelSink {
    async fn deliver(&self, report: &IngestionReport) {
        if self.tx.send(report.clone()).is_err() {
            log::warn!("job {}: report receiver dropped", report.job_id);
        }
    }
}
