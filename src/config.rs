use std::env;
use std::time::Duration;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Runtime configuration for the loader service.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub database_url: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub schema_ttl: Duration,
    /// Server-side statement timeout per group insert; `None` when disabled.
    pub group_timeout: Option<Duration>,
    pub db_max_connections: u32,
}

impl LoaderConfig {
    pub const MAX_DEFAULT_WORKERS: usize = 8;

    pub fn from_env() -> Self {
        let workers = env_usize(
            "LOADER_WORKERS",
            num_cpus::get().min(Self::MAX_DEFAULT_WORKERS),
        )
        .max(1);

        let group_timeout = env_duration_secs("LOADER_GROUP_TIMEOUT_SECS", 300);

        Self {
            database_url: env_string("DATABASE_URL"),
            workers,
            queue_capacity: env_usize("LOADER_QUEUE_CAPACITY", 64).max(1),
            batch_size: env_usize("LOADER_BATCH_SIZE", 1_000).max(1),
            schema_ttl: env_duration_secs("LOADER_SCHEMA_TTL_SECS", 3_600),
            group_timeout: (!group_timeout.is_zero()).then_some(group_timeout),
            // One connection per worker plus headroom for schema lookups.
            db_max_connections: env_u32("LOADER_DB_MAX_CONNECTIONS", workers as u32 + 2),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
