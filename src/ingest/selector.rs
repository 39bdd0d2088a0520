//! Reconciles a file header with a table schema.

use crate::error::JobError;
use crate::ingest::schema::{ColumnMeta, TableSchema};
use std::collections::HashSet;

/// Columns bound by every insert of a job, in the table's ordinal order.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedColumns {
    columns: Vec<ColumnMeta>,
}

impl SelectedColumns {
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Pick the columns to load.
///
/// A column is selected when the header names it, or when it is NOT NULL
/// without a default: leaving such a column out would only move the
/// constraint failure into the database, so it is bound (as NULL) and
/// every row lacking it is rejected explicitly.
pub fn select_columns(
    schema: &TableSchema,
    header: &HashSet<String>,
) -> Result<SelectedColumns, JobError> {
    let columns: Vec<ColumnMeta> = schema
        .columns
        .iter()
        .filter(|c| header.contains(&c.name) || c.is_required())
        .cloned()
        .collect();

    if columns.is_empty() {
        return Err(JobError::NoMatchingColumns(schema.table.clone()));
    }

    let ignored: Vec<&str> = header
        .iter()
        .filter(|name| schema.column(name).is_none())
        .map(String::as_str)
        .collect();
    if !ignored.is_empty() {
        log::debug!(
            "{}: ignoring {} header column(s) not in table: {}",
            schema.table,
            ignored.len(),
            ignored.join(", ")
        );
    }

    Ok(SelectedColumns { columns })
}
