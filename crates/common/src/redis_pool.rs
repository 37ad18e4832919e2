use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager for async operations.
///
/// The client is returned alongside the manager: pub/sub subscribers need
/// dedicated connections, which are opened from the client on demand.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<(Client, ConnectionManager)> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client.clone()).await?;

    tracing::info!("Connected to Redis");
    Ok((client, manager))
}
