use redis::Client;
use redis::aio::ConnectionManager;

/// Open a Redis connection manager for the job queue.
///
/// The manager reconnects on its own; callers clone it per operation.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}

/// Round-trip a `PING`, used by health reporting.
pub async fn ping(redis: &ConnectionManager) -> Result<(), redis::RedisError> {
    let mut conn = redis.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}
