pub mod config;
pub mod db;
pub mod error;
pub mod ingest;

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the process logger once; `RUST_LOG` overrides the default filter.
pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::error::ExecutionError;
    use crate::ingest::coerce::SqlValue;
    use crate::ingest::executor::{InsertStatement, StatementExecutor};
    use crate::ingest::schema::{ColumnDescriptor, ColumnMeta, SchemaSource, TableName};
    use crate::ingest::schema_cache::Clock;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Catalog `udt_name` for the `data_type` spellings used in tests.
    fn udt_name(data_type: &str) -> String {
        match data_type {
            "smallint" => "int2",
            "integer" => "int4",
            "bigint" => "int8",
            "double precision" => "float8",
            "real" => "float4",
            "boolean" => "bool",
            "character varying" => "varchar",
            "character" => "bpchar",
            "timestamp with time zone" => "timestamptz",
            "timestamp without time zone" => "timestamp",
            other => other,
        }
        .to_string()
    }

    /// Catalog row as the schema source would report it.
    pub fn column(name: &str, data_type: &str, nullable: bool, has_default: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt_name(data_type),
            nullable,
            has_default,
        }
    }

    pub fn column_meta(name: &str, data_type: &str, nullable: bool, has_default: bool) -> ColumnMeta {
        ColumnMeta::from_descriptor(column(name, data_type, nullable, has_default))
    }

    /// In-memory catalog. Unknown tables have no columns.
    #[derive(Default)]
    pub struct StaticSchemaSource {
        tables: HashMap<String, Vec<ColumnDescriptor>>,
        failing: HashSet<String>,
        lookups: AtomicUsize,
    }

    impl StaticSchemaSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_table(mut self, table: &str, columns: Vec<ColumnDescriptor>) -> Self {
            self.tables.insert(table.to_lowercase(), columns);
            self
        }

        /// Make lookups for `table` fail with a database error.
        pub fn failing_on(mut self, table: &str) -> Self {
            self.failing.insert(table.to_lowercase());
            self
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SchemaSource for StaticSchemaSource {
        async fn lookup_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>, sqlx::Error> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let key = table.to_string();
            if self.failing.contains(&key) {
                return Err(sqlx::Error::Protocol(format!("catalog unavailable for {key}")));
            }
            Ok(self.tables.get(&key).cloned().unwrap_or_default())
        }
    }

    /// Clock that only moves when told to.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self {
                now: Mutex::new(Utc::now()),
            }
        }
    }

    impl ManualClock {
        pub fn advance(&self, by: Duration) {
            let delta = chrono::Duration::from_std(by).expect("duration in range");
            *self.now.lock() += delta;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }

    /// Statement executor that records every group it is handed.
    #[derive(Default)]
    pub struct RecordingExecutor {
        groups: Mutex<Vec<Vec<Vec<SqlValue>>>>,
        failing_groups: HashSet<usize>,
        affected_cap: Option<u64>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl RecordingExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the `index`-th execution (zero based) with a database error.
        pub fn failing_group(mut self, index: usize) -> Self {
            self.failing_groups.insert(index);
            self
        }

        /// Report at most `rows` affected rows per execution.
        pub fn affecting_at_most(mut self, rows: u64) -> Self {
            self.affected_cap = Some(rows);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Row counts of every execution, in call order.
        pub fn group_sizes(&self) -> Vec<usize> {
            self.groups.lock().iter().map(Vec::len).collect()
        }

        pub fn rows(&self) -> Vec<Vec<SqlValue>> {
            self.groups.lock().iter().flatten().cloned().collect()
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StatementExecutor for RecordingExecutor {
        async fn execute_batch_insert(
            &self,
            _statement: &InsertStatement,
            rows: Vec<Vec<SqlValue>>,
        ) -> Result<u64, ExecutionError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            let count = rows.len() as u64;
            let index = {
                let mut groups = self.groups.lock();
                groups.push(rows);
                groups.len() - 1
            };

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.failing_groups.contains(&index) {
                return Err(ExecutionError::Database(sqlx::Error::Protocol(format!(
                    "group {index} rejected"
                ))));
            }

            Ok(self.affected_cap.map_or(count, |cap| count.min(cap)))
        }
    }

    pub mod database {
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
        }

        /// Throwaway schema in the database named by `TEST_DATABASE_URL`.
        ///
        /// The pool's `search_path` points at the schema, so unqualified
        /// table names resolve inside it.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            schema: String,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                let url = std::env::var("TEST_DATABASE_URL")
                    .map_err(|_| TestDatabaseError::MissingUrl)?;
                let admin_options: PgConnectOptions = url.parse()?;
                let admin_options = admin_options.log_statements(log::LevelFilter::Off);

                let schema = format!("loader_test_{}", Uuid::new_v4().simple());
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;
                sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema))
                    .execute(&admin_pool)
                    .await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(
                        admin_options
                            .clone()
                            .options([("search_path", schema.as_str())]),
                    )
                    .await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    schema,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn schema(&self) -> &str {
                &self.schema
            }

            /// Close the pool and drop the schema with everything in it.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }
                drop_schema(self.admin_options.clone(), &self.schema).await?;
                Ok(())
            }
        }

        async fn drop_schema(admin_options: PgConnectOptions, schema: &str) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;
            sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema))
                .execute(&admin_pool)
                .await?;
            admin_pool.close().await;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let schema = self.schema.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_schema(admin_options, &schema).await;
                        });
                    }
                }
            }
        }
    }
}
