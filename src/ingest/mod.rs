//! Schema-aware CSV ingestion.
//!
//! # Architecture Overview
//!
//! A job loads one delimited file into one existing table. The table's
//! catalog decides how each text field is typed; the file decides which
//! columns are bound.
//!
//! ## Core Components
//!
//! - **`schema_cache`**: per-table column metadata with a time-to-live,
//!   shared by all jobs and refreshed lazily from the catalog (`schema`).
//!
//! - **`parser`**: lazy reader turning the byte stream into header-keyed rows.
//!
//! - **`coerce`**: converts one text field into a typed value for its column,
//!   including timestamp offset normalization.
//!
//! - **`selector`**: reconciles the file header with the schema into the
//!   ordered column list bound by every insert of the job.
//!
//! - **`loader`**: groups rows (1,000 by default), drops rows that fail
//!   coercion and executes each group as one bulk insert (`executor`),
//!   accumulating succeeded/failed totals.
//!
//! - **`job`** and **`queue`**: the per-request state machine and the bounded
//!   worker pool that runs it. Terminal outcomes go to a `report` sink.
//!
//! ## Data Flow
//!
//! 1. **Acquire**: open the job's byte stream (`source`)
//! 2. **Header**: read the first record; an empty input is fatal
//! 3. **Schema**: fetch the table's columns through the cache
//! 4. **Select**: choose columns; an empty selection is fatal
//! 5. **Load**: stream rows through coercion and grouped inserts
//! 6. **Report**: deliver the totals, or the fatal reason
//!
//! Within a job everything is sequential; only separate jobs run in parallel.

pub mod coerce;
pub mod executor;
pub mod job;
pub mod loader;
pub mod parser;
pub mod queue;
pub mod report;
pub mod schema;
pub mod schema_cache;
pub mod selector;
pub mod source;

pub use job::{IngestionContext, IngestionJob, JobHandle, JobOutcome, JobStatus};
pub use loader::{BatchLoader, BatchOutcome, LoadTotals};
pub use queue::IngestionService;
pub use report::{ChannelSink, CompletionSink, IngestionReport, LogSink};
pub use schema_cache::SchemaCache;
pub use source::{ByteStreamProvider, FileSource, HttpSource, MemorySource};
