//! Redis-backed reliable queue using Lua scripts for atomicity.
//!
//! Layout for a queue named `q`:
//! - `q:ready`       list of serialized envelopes, LPUSH in / RPOP out
//! - `q:inflight`    sorted set of envelopes scored by visibility deadline (ms)
//! - `q:deliveries`  hash of envelope -> delivery count
//!
//! Deadlines use the Redis server clock, so consumers with skewed clocks agree
//! on when a message becomes visible again.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use delayed_common::error::AppError;
use delayed_common::retry::{RetryStrategy, retry};
use delayed_common::types::DeliveryTask;

use crate::{Delivery, DeliveryQueue, Envelope, QueueStats};

/// Lua script for atomic receive.
///
/// KEYS[1] = ready list
/// KEYS[2] = in-flight sorted set
/// KEYS[3] = delivery count hash
/// ARGV[1] = visibility timeout in milliseconds
///
/// Returns `{envelope, delivery_count}` or nil when nothing is visible.
const RECEIVE_SCRIPT: &str = r#"
    local ready_key = KEYS[1]
    local inflight_key = KEYS[2]
    local count_key = KEYS[3]
    local visibility_ms = tonumber(ARGV[1])

    local t = redis.call('TIME')
    local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

    -- Expired in-flight messages go to the consuming end of the ready list
    local expired = redis.call('ZRANGEBYSCORE', inflight_key, '-inf', now_ms)
    for _, msg in ipairs(expired) do
        redis.call('ZREM', inflight_key, msg)
        redis.call('RPUSH', ready_key, msg)
    end

    local msg = redis.call('RPOP', ready_key)
    if not msg then
        return false
    end

    redis.call('ZADD', inflight_key, now_ms + visibility_ms, msg)
    local count = redis.call('HINCRBY', count_key, msg, 1)
    return {msg, count}
"#;

/// Lua script for atomic acknowledgement.
///
/// KEYS[1] = in-flight sorted set
/// KEYS[2] = delivery count hash
/// ARGV[1] = envelope
const ACK_SCRIPT: &str = r#"
    redis.call('HDEL', KEYS[2], ARGV[1])
    return redis.call('ZREM', KEYS[1], ARGV[1])
"#;

/// [`DeliveryQueue`] stored in Redis.
#[derive(Clone)]
pub struct RedisDeliveryQueue {
    conn: ConnectionManager,
    ready_key: String,
    inflight_key: String,
    deliveries_key: String,
    visibility_timeout: Duration,
    reconnect: RetryStrategy,
}

impl RedisDeliveryQueue {
    pub fn new(
        conn: ConnectionManager,
        name: &str,
        visibility_timeout: Duration,
        reconnect: RetryStrategy,
    ) -> Self {
        tracing::info!(
            queue = name,
            visibility_timeout_secs = visibility_timeout.as_secs(),
            "Redis delivery queue ready"
        );
        Self {
            conn,
            ready_key: format!("{}:ready", name),
            inflight_key: format!("{}:inflight", name),
            deliveries_key: format!("{}:deliveries", name),
            visibility_timeout,
            reconnect,
        }
    }
}

#[async_trait]
impl DeliveryQueue for RedisDeliveryQueue {
    async fn publish(&self, task: &DeliveryTask) -> Result<(), AppError> {
        let payload = serde_json::to_string(&Envelope::new(task.clone()))?;

        retry(&self.reconnect, "queue.publish", || {
            let mut conn = self.conn.clone();
            let payload = payload.clone();
            async move {
                conn.lpush::<_, _, ()>(&self.ready_key, payload).await?;
                Ok::<_, AppError>(())
            }
        })
        .await?;

        tracing::debug!(uid = %task.uid, retry_count = task.retry_count, "Delivery task published");
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, AppError> {
        let visibility_ms = self.visibility_timeout.as_millis() as u64;

        let raw: Option<(String, u32)> = retry(&self.reconnect, "queue.receive", || {
            let mut conn = self.conn.clone();
            async move {
                let result = redis::Script::new(RECEIVE_SCRIPT)
                    .key(&self.ready_key)
                    .key(&self.inflight_key)
                    .key(&self.deliveries_key)
                    .arg(visibility_ms)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, AppError>(result)
            }
        })
        .await?;

        let Some((payload, delivery_count)) = raw else {
            return Ok(None);
        };

        let envelope: Envelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A poisoned payload would be redelivered forever; drop it.
                tracing::error!(error = %e, payload = %payload, "Discarding undecodable queue message");
                let mut conn = self.conn.clone();
                let _: i64 = redis::Script::new(ACK_SCRIPT)
                    .key(&self.inflight_key)
                    .key(&self.deliveries_key)
                    .arg(&payload)
                    .invoke_async(&mut conn)
                    .await?;
                return Err(AppError::Serialization(e));
            }
        };

        if delivery_count > 1 {
            tracing::info!(
                uid = %envelope.task.uid,
                delivery_count,
                "Redelivering unacknowledged task"
            );
        }

        Ok(Some(Delivery {
            message_id: envelope.id,
            task: envelope.task,
            delivery_count,
            receipt: payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        let removed: i64 = retry(&self.reconnect, "queue.ack", || {
            let mut conn = self.conn.clone();
            async move {
                let removed = redis::Script::new(ACK_SCRIPT)
                    .key(&self.inflight_key)
                    .key(&self.deliveries_key)
                    .arg(&delivery.receipt)
                    .invoke_async(&mut conn)
                    .await?;
                Ok::<_, AppError>(removed)
            }
        })
        .await?;

        if removed == 0 {
            tracing::warn!(
                uid = %delivery.task.uid,
                message_id = %delivery.message_id,
                "Ack for a message no longer in flight (visibility timeout elapsed?)"
            );
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, AppError> {
        let mut conn = self.conn.clone();
        let ready: u64 = conn.llen(&self.ready_key).await?;
        let in_flight: u64 = conn.zcard(&self.inflight_key).await?;
        Ok(QueueStats { ready, in_flight })
    }
}
