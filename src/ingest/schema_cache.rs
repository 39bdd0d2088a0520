//! Time-bounded cache of table schemas shared by all jobs.
//!
//! Entries are replaced wholesale once stale, never mutated. Concurrent
//! callers that all find the same entry stale each run their own lookup;
//! the content is deterministic for a given table, so the last writer wins
//! without harm.

use crate::error::SchemaLookupError;
use crate::ingest::schema::{SchemaSource, TableName, TableSchema};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Source of "now" for staleness checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: DashMap<String, Arc<TableSchema>>,
}

impl SchemaCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

    pub fn new(source: Arc<dyn SchemaSource>, ttl: Duration) -> Self {
        Self::with_clock(source, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(source: Arc<dyn SchemaSource>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Schema for `table`, querying the source on a miss or a stale entry.
    ///
    /// A fresh entry is returned as the same shared instance on every call.
    pub async fn get(&self, table: &TableName) -> Result<Arc<TableSchema>, SchemaLookupError> {
        let key = table.to_string();

        // Clone out of the map so no shard lock is held across the lookup.
        let cached = self.entries.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(schema) = cached {
            if !schema.is_stale(self.clock.now(), self.ttl) {
                return Ok(schema);
            }
            log::debug!("schema cache: entry for {} is stale", key);
        }

        let columns = self
            .source
            .lookup_columns(table)
            .await
            .map_err(|source| SchemaLookupError {
                table: key.clone(),
                source,
            })?;

        let schema = Arc::new(TableSchema::from_catalog(
            key.clone(),
            columns,
            self.clock.now(),
        ));
        self.entries.insert(key, Arc::clone(&schema));

        log::info!(
            "schema cache: loaded {} ({} columns)",
            schema.table,
            schema.columns.len()
        );
        Ok(schema)
    }

    /// Drop the entry for one table so the next `get` reloads it.
    pub fn invalidate(&self, table: &TableName) {
        self.entries.remove(&table.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
