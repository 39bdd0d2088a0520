//! Error taxonomy for the loader.
//!
//! Errors are scoped by how much work they abort:
//!
//! - [`JobError`]: fatal to one job, raised before any row is loaded
//! - [`ExecutionError`]: fatal to one group of rows, the job moves on
//! - [`CoercionError`]: fatal to one row, the group moves on

use crate::ingest::schema::SqlType;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort a whole ingestion job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("input is empty: no header line")]
    EmptyInput,
    #[error("failed to acquire input stream: {0}")]
    StreamAcquisition(String),
    #[error("invalid table name `{0}`")]
    InvalidTableName(String),
    #[error(transparent)]
    SchemaLookup(#[from] SchemaLookupError),
    #[error("table `{0}` not found")]
    TableNotFound(String),
    #[error("no matching columns for table `{0}`")]
    NoMatchingColumns(String),
    #[error("failed to read input: {0}")]
    Read(#[from] csv_async::Error),
}

/// The catalog query for a table's columns failed.
///
/// Only the job that triggered the lookup is affected; cached schemas for
/// other tables stay valid.
#[derive(Debug, Error)]
#[error("schema lookup failed for table `{table}`: {source}")]
pub struct SchemaLookupError {
    pub table: String,
    #[source]
    pub source: sqlx::Error,
}

/// A single field (and therefore its row) could not be converted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    #[error("column `{column}`: `{value}` is not a valid {sql_type}")]
    InvalidValue {
        column: String,
        value: String,
        sql_type: SqlType,
    },
    #[error("column `{column}`: unparsable timestamp `{value}`")]
    InvalidTimestamp { column: String, value: String },
    #[error("column `{0}` does not accept null")]
    NullViolation(String),
    #[error("column `{0}` contains a NUL byte")]
    NulByte(String),
    #[error("column `{0}` is not valid UTF-8")]
    Encoding(String),
}

impl CoercionError {
    /// Attach the column name to an error produced by a column-agnostic parse.
    pub(crate) fn for_column(self, name: &str) -> Self {
        match self {
            CoercionError::InvalidValue {
                value, sql_type, ..
            } => CoercionError::InvalidValue {
                column: name.to_string(),
                value,
                sql_type,
            },
            CoercionError::InvalidTimestamp { value, .. } => CoercionError::InvalidTimestamp {
                column: name.to_string(),
                value,
            },
            CoercionError::NulByte(_) => CoercionError::NulByte(name.to_string()),
            other => other,
        }
    }
}

/// Failure to execute one group's bulk insert.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch execution timed out after {0:?}")]
    Timeout(Duration),
}

/// Rejection of a job at submission time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("ingestion queue is full")]
    QueueFull,
    #[error("ingestion queue is closed")]
    QueueClosed,
}
