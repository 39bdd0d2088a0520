//! One ingestion request, from stream acquisition to terminal report.

use crate::config::LoaderConfig;
use crate::error::JobError;
use crate::ingest::executor::{InsertStatement, PgStatementExecutor};
use crate::ingest::loader::{BatchLoader, LoadTotals};
use crate::ingest::parser::RowParser;
use crate::ingest::report::{CompletionSink, IngestionReport};
use crate::ingest::schema::{PgSchemaSource, TableName};
use crate::ingest::schema_cache::SchemaCache;
use crate::ingest::selector::select_columns;
use crate::ingest::source::ByteStreamProvider;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Lifecycle of a job: `Queued -> Running -> Completed | Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed { succeeded: u64, failed: u64 },
    Failed { reason: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }
}

/// Result of running a job. `Fatal` means no partial counts exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(LoadTotals),
    Fatal(String),
}

impl JobOutcome {
    fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(totals) => JobStatus::Completed {
                succeeded: totals.succeeded,
                failed: totals.failed,
            },
            JobOutcome::Fatal(reason) => JobStatus::Failed {
                reason: reason.clone(),
            },
        }
    }
}

/// Collaborators shared by every job of a service.
pub struct IngestionContext {
    pub schema_cache: Arc<SchemaCache>,
    pub loader: BatchLoader,
    pub sink: Arc<dyn CompletionSink>,
}

impl IngestionContext {
    pub fn new(
        schema_cache: Arc<SchemaCache>,
        loader: BatchLoader,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        Self {
            schema_cache,
            loader,
            sink,
        }
    }

    /// Wire the catalog source and statement executor to one Postgres pool.
    pub fn postgres(pool: PgPool, config: &LoaderConfig, sink: Arc<dyn CompletionSink>) -> Self {
        let schema_cache = SchemaCache::new(
            Arc::new(PgSchemaSource::new(pool.clone())),
            config.schema_ttl,
        );
        let executor = PgStatementExecutor::new(pool).with_statement_timeout(config.group_timeout);
        let loader = BatchLoader::new(Arc::new(executor)).with_batch_size(config.batch_size);

        Self::new(Arc::new(schema_cache), loader, sink)
    }
}

/// Observer side of a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: Uuid,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// If the job is dropped before finishing, the last observed status is
    /// returned.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status.clone();
        if rx.wait_for(JobStatus::is_terminal).await.is_err() {
            log::debug!("job {}: dropped before finishing", self.id);
        }
        let status = rx.borrow().clone();
        status
    }
}

pub struct IngestionJob {
    id: Uuid,
    table: String,
    source: Box<dyn ByteStreamProvider>,
    status: Arc<watch::Sender<JobStatus>>,
}

impl IngestionJob {
    pub fn new(table: impl Into<String>, source: Box<dyn ByteStreamProvider>) -> (Self, JobHandle) {
        let id = Uuid::new_v4();
        let (tx, rx) = watch::channel(JobStatus::Queued);
        let job = Self {
            id,
            table: table.into(),
            source,
            status: Arc::new(tx),
        };
        (job, JobHandle { id, status: rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn status_sender(&self) -> Arc<watch::Sender<JobStatus>> {
        Arc::clone(&self.status)
    }

    /// Run the job to a terminal state and deliver its report.
    pub async fn run(self, ctx: &IngestionContext) -> JobOutcome {
        let started_at = Utc::now();
        self.status.send_replace(JobStatus::Running);
        log::info!(
            "job {}: loading {} from {}",
            self.id,
            self.table,
            self.source.describe()
        );

        let outcome = match self.execute(ctx).await {
            Ok(totals) => JobOutcome::Completed(totals),
            Err(e) => {
                log::error!("job {}: aborted: {}", self.id, e);
                JobOutcome::Fatal(e.to_string())
            }
        };

        let report = match &outcome {
            JobOutcome::Completed(totals) => IngestionReport::completed(
                self.id,
                &self.table,
                totals.succeeded,
                totals.failed,
                started_at,
            ),
            JobOutcome::Fatal(reason) => {
                IngestionReport::fatal(self.id, &self.table, reason, started_at)
            }
        };
        ctx.sink.deliver(&report).await;

        self.status.send_replace(outcome.status());
        outcome
    }

    async fn execute(&self, ctx: &IngestionContext) -> Result<LoadTotals, JobError> {
        let table = TableName::parse(&self.table)?;

        let input = self.source.open().await?;
        let parser = RowParser::new(input).await?;
        let header: HashSet<String> = parser.header().iter().cloned().collect();

        let schema = ctx.schema_cache.get(&table).await?;
        if schema.is_empty() {
            return Err(JobError::TableNotFound(table.to_string()));
        }

        let selected = select_columns(&schema, &header)?;
        let statement = InsertStatement::new(&table, &selected);
        log::debug!(
            "job {}: binding {} column(s): {}",
            self.id,
            selected.len(),
            selected.names().collect::<Vec<_>>().join(", ")
        );

        ctx.loader
            .load(self.id, &statement, parser.into_records())
            .await
    }
}
