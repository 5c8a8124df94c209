use std::time::Duration;

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::retry::RetryStrategy;

/// Map the reconnect strategy onto the manager's own reconnect backoff.
fn manager_config(reconnect: &RetryStrategy, timeout: Duration) -> ConnectionManagerConfig {
    let base = reconnect.backoff.round().max(2.0) as u64;
    ConnectionManagerConfig::new()
        .set_number_of_retries(reconnect.attempts.saturating_sub(1) as usize)
        .set_exponent_base(base)
        .set_factor(reconnect.delay.as_millis().max(1) as u64)
        .set_max_delay(reconnect.max_delay.as_millis() as u64)
        .set_connection_timeout(timeout)
        .set_response_timeout(timeout)
}

/// Create a Redis connection manager for async operations.
///
/// The manager reconnects on its own after a dropped connection, following
/// `reconnect`; queue calls still wrap commands in the same strategy to ride
/// out longer outages. `timeout` bounds each connect and each response.
pub async fn create_redis_pool(
    redis_url: &str,
    reconnect: &RetryStrategy,
    timeout: Duration,
) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager =
        ConnectionManager::new_with_config(client, manager_config(reconnect, timeout)).await?;

    tracing::info!(attempts = reconnect.attempts, ?timeout, "Connected to Redis");
    Ok(manager)
}
