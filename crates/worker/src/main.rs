use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;

use postroom_broadcasts::store::PgStore;
use postroom_broadcasts::{BatchSender, BroadcastPlanner, register_handlers};
use postroom_common::config::AppConfig;
use postroom_common::{db, redis_pool};
use postroom_engine::{Foreman, ForemanConfig, TaskRegistry};
use postroom_queue::redis_queue::RedisQueue;
use postroom_queue::{BATCH_QUEUE, HANDLER_QUEUE, TaskQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "postroom_worker=info,postroom_engine=info,postroom_broadcasts=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Postroom worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and Redis
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let (redis_client, redis_conn) = redis_pool::create_redis_pool(&config.redis_url).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisQueue::new(redis_client, redis_conn));

    // Handlers are registered once, before any foreman starts
    let store = Arc::new(PgStore::new(pool));
    let planner = BroadcastPlanner::new(store.clone(), queue.clone())
        .with_batch_size(config.broadcast_batch_size);
    let sender = BatchSender::new(store.clone(), store);
    let registry = Arc::new(register_handlers(TaskRegistry::builder(), planner, sender).build());
    tracing::info!(task_types = ?registry.task_types(), "Task handlers registered");

    let idle_timeout = Duration::from_secs(config.foreman_idle_timeout_secs);
    let retry_backoff = Duration::from_millis(config.foreman_retry_backoff_ms);
    let lanes = [
        (HANDLER_QUEUE, config.handler_workers),
        (BATCH_QUEUE, config.batch_workers),
    ];

    let tracker = TaskTracker::new();
    let foremen: Vec<_> = lanes
        .into_iter()
        .map(|(lane, workers)| {
            let foreman_config = ForemanConfig::new(lane, workers)
                .with_idle_timeout(idle_timeout)
                .with_retry_backoff(retry_backoff);
            Foreman::new(foreman_config, queue.clone(), registry.clone()).start(&tracker)
        })
        .collect();

    // Run until Ctrl+C
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    for foreman in &foremen {
        foreman.stop();
    }

    // In-flight tasks run to completion before their workers exit
    tracker.close();
    tracker.wait().await;

    tracing::info!("Postroom worker stopped.");
    Ok(())
}
