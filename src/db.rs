use crate::config::LoaderConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open the target database pool sized for the worker pool.
pub async fn connect(database_url: &str, config: &LoaderConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    log::info!(
        "database pool ready ({} max connections)",
        config.db_max_connections
    );
    Ok(pool)
}
