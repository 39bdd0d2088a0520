use std::sync::Arc;

use std::str::FromStr;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use csv_loader::config::LoaderConfig;
use csv_loader::ingest::{ChannelSink, IngestionContext, IngestionService, JobStatus, MemorySource};
use csv_loader::test_support::{TestDatabase, TestDatabaseError};

async fn test_database() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping postgres load test: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

fn config() -> LoaderConfig {
    let mut config = LoaderConfig::from_env();
    config.batch_size = 2;
    config
}

#[tokio::test]
async fn loads_typed_rows_and_counts_rejects() {
    let Some(test_db) = test_database().await else {
        return;
    };
    let pool = test_db.pool().clone();

    sqlx::query(
        r#"CREATE TABLE orders (
               id BIGINT NOT NULL,
               total NUMERIC(10, 2),
               qty SMALLINT,
               paid BOOLEAN,
               placed_at TIMESTAMPTZ,
               ref UUID,
               note VARCHAR(40),
               created_at TIMESTAMPTZ NOT NULL DEFAULT now()
           )"#,
    )
    .execute(&pool)
    .await
    .expect("create table");

    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(pool.clone(), &config(), Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), 1, 4);

    let csv = "id,total,qty,paid,placed_at,ref,note,unknown\n\
               1,9.99,3,true,2024-01-05 10:00:00-5,6f1c1a2e-8d1b-4c5e-9a55-2f0a7b0c9d11,first,x\n\
               abc,1.00,1,false,,,,x\n\
               3,,70000,false,,,,x\n\
               4,,,,,,\"quoted, note\",x\n";

    let handle = service
        .submit("orders", Box::new(MemorySource::new(csv)))
        .expect("job accepted");

    assert_eq!(
        handle.wait().await,
        JobStatus::Completed {
            succeeded: 2,
            failed: 2
        }
    );
    let report = reports.recv().await.expect("report");
    assert!(!report.fatal);

    let rows: Vec<(i64, Option<BigDecimal>, Option<i16>, Option<bool>, Option<DateTime<Utc>>, Option<String>)> =
        sqlx::query_as(
            "SELECT id, total, qty, paid, placed_at, note FROM orders ORDER BY id",
        )
        .fetch_all(&pool)
        .await
        .expect("select rows");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, 1);
    assert_eq!(rows[0].1, Some(BigDecimal::from_str("9.99").unwrap()));
    assert_eq!(rows[0].2, Some(3));
    assert_eq!(rows[0].3, Some(true));
    assert_eq!(
        rows[0].4.map(|t| t.to_rfc3339()),
        Some("2024-01-05T15:00:00+00:00".to_string())
    );
    assert_eq!(rows[1].5.as_deref(), Some("quoted, note"));

    service.shutdown().await;
    test_db.close().await.expect("drop test schema");
}

#[tokio::test]
async fn constraint_violation_fails_only_its_group() {
    let Some(test_db) = test_database().await else {
        return;
    };
    let pool = test_db.pool().clone();

    sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, label TEXT)")
        .execute(&pool)
        .await
        .expect("create table");

    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(pool.clone(), &config(), Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), 1, 4);

    // Groups of two: the duplicate key sinks the second group only.
    let csv = "id,label\n1,a\n2,b\n3,c\n3,d\n5,e\n";
    let handle = service
        .submit(format!("{}.events", test_db.schema()), Box::new(MemorySource::new(csv)))
        .expect("job accepted");

    assert_eq!(
        handle.wait().await,
        JobStatus::Completed {
            succeeded: 3,
            failed: 2
        }
    );
    reports.recv().await.expect("report");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&pool)
        .await
        .expect("count rows");
    assert_eq!(count, 3);

    service.shutdown().await;
    test_db.close().await.expect("drop test schema");
}

#[tokio::test]
async fn plain_timestamp_column_keeps_wall_clock_time() {
    let Some(test_db) = test_database().await else {
        return;
    };
    let pool = test_db.pool().clone();

    sqlx::query("CREATE TABLE readings (id INTEGER, taken_at TIMESTAMP, logged_at TIMESTAMPTZ)")
        .execute(&pool)
        .await
        .expect("create table");

    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(pool.clone(), &config(), Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), 1, 4);

    let csv = "id,taken_at,logged_at\n\
               1,2024-01-05 10:00:00,2024-01-05 10:00:00-5\n\
               2,2024-07-01T23:30,2024-07-01T23:30Z\n";
    let handle = service
        .submit("readings", Box::new(MemorySource::new(csv)))
        .expect("job accepted");

    assert_eq!(
        handle.wait().await,
        JobStatus::Completed {
            succeeded: 2,
            failed: 0
        }
    );
    reports.recv().await.expect("report");

    let rows: Vec<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT taken_at::text, logged_at FROM readings ORDER BY id")
            .fetch_all(&pool)
            .await
            .expect("select rows");

    assert_eq!(rows[0].0, "2024-01-05 10:00:00");
    assert_eq!(rows[1].0, "2024-07-01 23:30:00");
    assert_eq!(rows[0].1.to_rfc3339(), "2024-01-05T15:00:00+00:00");
    assert_eq!(rows[1].1.to_rfc3339(), "2024-07-01T23:30:00+00:00");

    service.shutdown().await;
    test_db.close().await.expect("drop test schema");
}

#[tokio::test]
async fn numeric_beyond_twenty_eight_digits_round_trips() {
    let Some(test_db) = test_database().await else {
        return;
    };
    let pool = test_db.pool().clone();

    sqlx::query("CREATE TABLE ledger (id INTEGER, amount NUMERIC)")
        .execute(&pool)
        .await
        .expect("create table");

    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(pool.clone(), &config(), Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), 1, 4);

    let csv = "id,amount\n\
               1,123456789012345678901234567890\n\
               2,0.1234567890123456789012345678901234\n";
    let handle = service
        .submit("ledger", Box::new(MemorySource::new(csv)))
        .expect("job accepted");

    assert_eq!(
        handle.wait().await,
        JobStatus::Completed {
            succeeded: 2,
            failed: 0
        }
    );
    reports.recv().await.expect("report");

    let amounts: Vec<String> = sqlx::query_scalar("SELECT amount::text FROM ledger ORDER BY id")
        .fetch_all(&pool)
        .await
        .expect("select amounts");
    assert_eq!(
        amounts,
        vec![
            "123456789012345678901234567890".to_string(),
            "0.1234567890123456789012345678901234".to_string()
        ]
    );

    service.shutdown().await;
    test_db.close().await.expect("drop test schema");
}

#[tokio::test]
async fn group_over_statement_timeout_is_rolled_back_and_counted_failed() {
    let Some(test_db) = test_database().await else {
        return;
    };
    let pool = test_db.pool().clone();

    sqlx::query("CREATE TABLE slow (id INTEGER)")
        .execute(&pool)
        .await
        .expect("create table");
    sqlx::query(
        r#"CREATE FUNCTION slow_insert() RETURNS trigger AS $$
           BEGIN
               IF NEW.id = 1 THEN
                   PERFORM pg_sleep(5);
               END IF;
               RETURN NEW;
           END
           $$ LANGUAGE plpgsql"#,
    )
    .execute(&pool)
    .await
    .expect("create trigger function");
    sqlx::query("CREATE TRIGGER slow_insert BEFORE INSERT ON slow FOR EACH ROW EXECUTE FUNCTION slow_insert()")
        .execute(&pool)
        .await
        .expect("create trigger");

    let mut config = config();
    config.group_timeout = Some(Duration::from_millis(500));
    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(pool.clone(), &config, Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), 1, 4);

    // Groups of two: the first group sleeps past the limit, the second does not.
    let csv = "id\n1\n2\n3\n";
    let handle = service
        .submit("slow", Box::new(MemorySource::new(csv)))
        .expect("job accepted");

    assert_eq!(
        handle.wait().await,
        JobStatus::Completed {
            succeeded: 1,
            failed: 2
        }
    );
    reports.recv().await.expect("report");

    let ids: Vec<i32> = sqlx::query_scalar("SELECT id FROM slow ORDER BY id")
        .fetch_all(&pool)
        .await
        .expect("select ids");
    assert_eq!(ids, vec![3]);

    service.shutdown().await;
    test_db.close().await.expect("drop test schema");
}

#[tokio::test]
async fn missing_table_is_fatal() {
    let Some(test_db) = test_database().await else {
        return;
    };

    let (sink, mut reports) = ChannelSink::new();
    let ctx = IngestionContext::postgres(test_db.pool().clone(), &config(), Arc::new(sink));
    let service = IngestionService::start(Arc::new(ctx), 1, 4);

    let handle = service
        .submit("no_such_table", Box::new(MemorySource::new("id\n1\n")))
        .expect("job accepted");

    assert!(matches!(handle.wait().await, JobStatus::Failed { .. }));
    assert!(reports.recv().await.expect("report").fatal);

    service.shutdown().await;
    test_db.close().await.expect("drop test schema");
}
