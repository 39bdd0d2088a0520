//! Grouped, sequential loading of coerced rows.
//!
//! Rows are consumed in fixed-size groups. Each row of a group is coerced
//! against the statement's columns; rows that fail coercion are counted as
//! failed and left out, and the rest of the group is executed as one bulk
//! statement. A group whose execution fails is counted as failed in full
//! and the load carries on with the next group. Groups are never retried
//! and never run concurrently: each execution is awaited to completion,
//! so a group's time limit belongs to the executor.

use crate::error::{CoercionError, JobError};
use crate::ingest::coerce::{SqlValue, coerce_row};
use crate::ingest::executor::{InsertStatement, StatementExecutor};
use crate::ingest::parser::Record;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Rejected rows logged per group before going quiet.
const LOGGED_REJECTIONS_PER_GROUP: u64 = 5;

/// Counts for one flushed group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Running totals across all groups of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTotals {
    pub groups: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl LoadTotals {
    pub fn merge(&mut self, outcome: BatchOutcome) {
        self.groups += 1;
        self.succeeded += outcome.succeeded;
        self.failed += outcome.failed;
    }
}

#[derive(Clone)]
pub struct BatchLoader {
    executor: Arc<dyn StatementExecutor>,
    batch_size: usize,
}

impl BatchLoader {
    pub const DEFAULT_BATCH_SIZE: usize = 1_000;

    pub fn new(executor: Arc<dyn StatementExecutor>) -> Self {
        Self {
            executor,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Load every record of `records` through `statement`.
    ///
    /// Only a read failure of the underlying input is returned as an error;
    /// row and group failures are folded into the totals.
    pub async fn load<S>(
        &self,
        job_id: Uuid,
        statement: &InsertStatement,
        records: S,
    ) -> Result<LoadTotals, JobError>
    where
        S: Stream<Item = Result<Record, JobError>>,
    {
        tokio::pin!(records);

        let mut totals = LoadTotals::default();
        let mut group: Vec<Record> = Vec::with_capacity(self.batch_size);

        while let Some(next) = records.next().await {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    log::error!(
                        "job {}: input failed after {} groups ({} ok / {} failed): {}",
                        job_id,
                        totals.groups,
                        totals.succeeded,
                        totals.failed,
                        e
                    );
                    return Err(e);
                }
            };

            group.push(record);
            if group.len() == self.batch_size {
                let last_line = group.last().map(Record::line).unwrap_or_default();
                let outcome = self.flush(job_id, statement, &mut group).await;
                totals.merge(outcome);
                log::info!(
                    "job {}: group {} up to line {} -> {} ok / {} fail",
                    job_id,
                    totals.groups,
                    last_line,
                    outcome.succeeded,
                    outcome.failed
                );
            }
        }

        if !group.is_empty() {
            let outcome = self.flush(job_id, statement, &mut group).await;
            totals.merge(outcome);
            log::info!(
                "job {}: final group {} -> {} ok / {} fail",
                job_id,
                totals.groups,
                outcome.succeeded,
                outcome.failed
            );
        }

        Ok(totals)
    }

    /// Coerce and execute one group, draining it.
    async fn flush(
        &self,
        job_id: Uuid,
        statement: &InsertStatement,
        group: &mut Vec<Record>,
    ) -> BatchOutcome {
        let attempted = group.len() as u64;
        let mut valid: Vec<Vec<SqlValue>> = Vec::with_capacity(group.len());
        let mut rejected = 0u64;

        for record in group.drain(..) {
            let line = record.line();
            let undecodable = statement
                .columns
                .iter()
                .find(|column| !record.is_decodable(&column.name));
            let result = match undecodable {
                Some(column) => Err(CoercionError::Encoding(column.name.clone())),
                None => coerce_row(&record.fields, &statement.columns),
            };

            match result {
                Ok(values) => valid.push(values),
                Err(e) => {
                    rejected += 1;
                    if rejected <= LOGGED_REJECTIONS_PER_GROUP {
                        log::warn!("job {}: line {} rejected: {}", job_id, line, e);
                    }
                }
            }
        }

        if rejected > LOGGED_REJECTIONS_PER_GROUP {
            log::warn!(
                "job {}: {} more rejected rows in this group",
                job_id,
                rejected - LOGGED_REJECTIONS_PER_GROUP
            );
        }

        if valid.is_empty() {
            return BatchOutcome {
                attempted,
                succeeded: 0,
                failed: rejected,
            };
        }

        let valid_count = valid.len() as u64;
        match self.executor.execute_batch_insert(statement, valid).await {
            Ok(affected) => {
                let succeeded = affected.min(valid_count);
                BatchOutcome {
                    attempted,
                    succeeded,
                    failed: rejected + (valid_count - succeeded),
                }
            }
            Err(e) => {
                log::warn!(
                    "job {}: insert of {} rows into {} failed: {}",
                    job_id,
                    valid_count,
                    statement.table,
                    e
                );
                BatchOutcome {
                    attempted,
                    succeeded: 0,
                    failed: attempted,
                }
            }
        }
    }
}
