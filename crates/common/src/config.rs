use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (task queue backend)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Number of workers consuming the interactive `handler` lane (default: 32)
    pub handler_workers: usize,

    /// Number of workers consuming the bulk `batch` lane (default: 4)
    pub batch_workers: usize,

    /// Maximum recipients per broadcast batch task (default: 100)
    pub broadcast_batch_size: usize,

    /// Longest a parked foreman waits for a wake notification (default: 60)
    pub foreman_idle_timeout_secs: u64,

    /// Backoff after a failed queue pop in milliseconds (default: 1000)
    pub foreman_retry_backoff_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            handler_workers: parse_var("HANDLER_WORKERS", 32)?,
            batch_workers: parse_var("BATCH_WORKERS", 4)?,
            broadcast_batch_size: parse_var("BROADCAST_BATCH_SIZE", 100)?,
            foreman_idle_timeout_secs: parse_var("FOREMAN_IDLE_TIMEOUT_SECS", 60)?,
            foreman_retry_backoff_ms: parse_var("FOREMAN_RETRY_BACKOFF_MS", 1000)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would leave a lane without workers or produce empty batches.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handler_workers == 0 || self.batch_workers == 0 {
            anyhow::bail!("HANDLER_WORKERS and BATCH_WORKERS must be at least 1");
        }
        if self.broadcast_batch_size == 0 {
            anyhow::bail!("BROADCAST_BATCH_SIZE must be at least 1");
        }
        Ok(())
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
