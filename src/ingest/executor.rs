//! Bulk insert statements and their execution against Postgres.
//!
//! A group of rows is sent as one `INSERT ... SELECT FROM UNNEST(...)`
//! statement with one array parameter per selected column, so the whole
//! group commits or fails together.
//!
//! A group's time limit is enforced by the server (`SET LOCAL
//! statement_timeout`) inside the group's transaction. An overrunning
//! statement is cancelled and rolled back before the connection goes back
//! to the pool.

use crate::error::ExecutionError;
use crate::ingest::coerce::SqlValue;
use crate::ingest::schema::{ColumnMeta, SqlType, TableName, quote_ident};
use crate::ingest::selector::SelectedColumns;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

/// SQLSTATE `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

/// Parameterized insert built once per job; column order is fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: TableName,
    pub columns: Vec<ColumnMeta>,
    pub sql: String,
}

impl InsertStatement {
    pub fn new(table: &TableName, selected: &SelectedColumns) -> Self {
        let columns = selected.columns().to_vec();

        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let projections: Vec<String> = columns
            .iter()
            .zip(&names)
            .map(|(column, name)| {
                if column.needs_text_cast() {
                    format!("t.{}::{}", name, quote_ident(&column.catalog_type))
                } else {
                    format!("t.{}", name)
                }
            })
            .collect();
        let params: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(idx, column)| format!("${}::{}", idx + 1, column.sql_type.array_type()))
            .collect();

        let column_list = names.join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) SELECT {} FROM UNNEST({}) AS t({})",
            table.quoted(),
            column_list,
            projections.join(", "),
            params.join(", "),
            column_list
        );

        Self {
            table: table.clone(),
            columns,
            sql,
        }
    }
}

/// Runs one group's bulk insert.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Insert `rows` (each in statement column order) and return the number
    /// of rows the store reports as affected.
    async fn execute_batch_insert(
        &self,
        statement: &InsertStatement,
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64, ExecutionError>;
}

pub struct PgStatementExecutor {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

impl PgStatementExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statement_timeout: None,
        }
    }

    /// Server-side limit per group insert; `None` leaves the session default.
    pub fn with_statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

/// `SET LOCAL` for a per-transaction statement timeout, in whole milliseconds.
///
/// Zero would disable the limit, so sub-millisecond limits round up to one.
fn statement_timeout_sql(limit: Duration) -> String {
    format!("SET LOCAL statement_timeout = {}", limit.as_millis().max(1))
}

fn is_query_canceled(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(QUERY_CANCELED),
        _ => false,
    }
}

#[async_trait]
impl StatementExecutor for PgStatementExecutor {
    async fn execute_batch_insert(
        &self,
        statement: &InsertStatement,
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64, ExecutionError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let count = rows.len();
        let mut buffers: Vec<ColumnBuffer> = statement
            .columns
            .iter()
            .map(|c| ColumnBuffer::with_capacity(c.sql_type, count))
            .collect();

        for row in rows {
            for (buffer, value) in buffers.iter_mut().zip(row) {
                buffer.push(value);
            }
        }

        let mut query = sqlx::query(&statement.sql);
        for buffer in buffers {
            query = buffer.bind(query);
        }

        let mut tx = self.pool.begin().await?;
        if let Some(limit) = self.statement_timeout {
            sqlx::query(&statement_timeout_sql(limit))
                .execute(&mut *tx)
                .await?;
        }

        // Dropping `tx` on error rolls the group back.
        let result = match query.execute(&mut *tx).await {
            Ok(result) => result,
            Err(err) => {
                return Err(match self.statement_timeout {
                    Some(limit) if is_query_canceled(&err) => ExecutionError::Timeout(limit),
                    _ => ExecutionError::Database(err),
                });
            }
        };
        tx.commit().await?;

        log::trace!(
            "bulk inserted {} of {} rows into {}",
            result.rows_affected(),
            count,
            statement.table
        );
        Ok(result.rows_affected())
    }
}

/// One column of a group in array form, ready to bind.
#[derive(Debug)]
enum ColumnBuffer {
    SmallInt(Vec<Option<i16>>),
    Integer(Vec<Option<i32>>),
    BigInt(Vec<Option<i64>>),
    Numeric(Vec<Option<BigDecimal>>),
    Double(Vec<Option<f64>>),
    Boolean(Vec<Option<bool>>),
    /// Local wall-clock time for `timestamp without time zone`.
    Timestamp(Vec<Option<NaiveDateTime>>),
    TimestampTz(Vec<Option<DateTime<Utc>>>),
    Text(Vec<Option<String>>),
}

impl ColumnBuffer {
    fn with_capacity(sql_type: SqlType, capacity: usize) -> Self {
        match sql_type {
            SqlType::SmallInt => ColumnBuffer::SmallInt(Vec::with_capacity(capacity)),
            SqlType::Integer => ColumnBuffer::Integer(Vec::with_capacity(capacity)),
            SqlType::BigInt => ColumnBuffer::BigInt(Vec::with_capacity(capacity)),
            SqlType::Numeric => ColumnBuffer::Numeric(Vec::with_capacity(capacity)),
            SqlType::Double => ColumnBuffer::Double(Vec::with_capacity(capacity)),
            SqlType::Boolean => ColumnBuffer::Boolean(Vec::with_capacity(capacity)),
            SqlType::Timestamp => ColumnBuffer::Timestamp(Vec::with_capacity(capacity)),
            SqlType::TimestampTz => ColumnBuffer::TimestampTz(Vec::with_capacity(capacity)),
            SqlType::Varchar => ColumnBuffer::Text(Vec::with_capacity(capacity)),
        }
    }

    /// Append a value. Values are produced by coercion against the same
    /// column type, so anything else is stored as NULL.
    fn push(&mut self, value: SqlValue) {
        match (self, value) {
            (ColumnBuffer::SmallInt(v), SqlValue::SmallInt(x)) => v.push(Some(x)),
            (ColumnBuffer::Integer(v), SqlValue::Integer(x)) => v.push(Some(x)),
            (ColumnBuffer::BigInt(v), SqlValue::BigInt(x)) => v.push(Some(x)),
            (ColumnBuffer::Numeric(v), SqlValue::Numeric(x)) => v.push(Some(x)),
            (ColumnBuffer::Double(v), SqlValue::Double(x)) => v.push(Some(x)),
            (ColumnBuffer::Boolean(v), SqlValue::Boolean(x)) => v.push(Some(x)),
            (ColumnBuffer::Timestamp(v), SqlValue::Timestamp(x)) => {
                v.push(Some(x.with_timezone(&Local).naive_local()))
            }
            (ColumnBuffer::TimestampTz(v), SqlValue::Timestamp(x)) => v.push(Some(x)),
            (ColumnBuffer::Text(v), SqlValue::Text(x)) => v.push(Some(x)),
            (buffer, value) => {
                debug_assert!(value.is_null(), "value {value:?} does not match column buffer");
                buffer.push_null();
            }
        }
    }

    fn push_null(&mut self) {
        match self {
            ColumnBuffer::SmallInt(v) => v.push(None),
            ColumnBuffer::Integer(v) => v.push(None),
            ColumnBuffer::BigInt(v) => v.push(None),
            ColumnBuffer::Numeric(v) => v.push(None),
            ColumnBuffer::Double(v) => v.push(None),
            ColumnBuffer::Boolean(v) => v.push(None),
            ColumnBuffer::Timestamp(v) => v.push(None),
            ColumnBuffer::TimestampTz(v) => v.push(None),
            ColumnBuffer::Text(v) => v.push(None),
        }
    }

    fn bind<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            ColumnBuffer::SmallInt(v) => query.bind(v),
            ColumnBuffer::Integer(v) => query.bind(v),
            ColumnBuffer::BigInt(v) => query.bind(v),
            ColumnBuffer::Numeric(v) => query.bind(v),
            ColumnBuffer::Double(v) => query.bind(v),
            ColumnBuffer::Boolean(v) => query.bind(v),
            ColumnBuffer::Timestamp(v) => query.bind(v),
            ColumnBuffer::TimestampTz(v) => query.bind(v),
            ColumnBuffer::Text(v) => query.bind(v),
        }
    }
}
