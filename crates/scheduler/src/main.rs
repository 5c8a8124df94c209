use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use delayed_common::config::AppConfig;
use delayed_common::db;
use delayed_common::redis_pool::create_redis_pool;
use delayed_queue::RedisDeliveryQueue;
use delayed_scheduler::{DispatchScheduler, SchedulerConfig};
use delayed_store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delayed_scheduler=info,delayed_store=info,delayed_queue=info".into()),
        )
        .json()
        .init();

    tracing::info!("DelayedNotifier scheduler starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(
        &config.database_url,
        config.db_max_connections,
        config.store_timeout(),
        &config.reconnect_strategy(),
    )
    .await?;
    db::run_migrations(&pool).await?;

    // Connect to the queue broker
    let redis = create_redis_pool(
        &config.redis_url,
        &config.reconnect_strategy(),
        config.store_timeout(),
    )
    .await?;

    let store = PgNotificationStore::new(pool)
        .with_call_timeout(config.store_timeout())
        .with_reconnect(config.reconnect_strategy());
    let queue = RedisDeliveryQueue::new(
        redis,
        &config.queue_name,
        config.visibility_timeout(),
        config.reconnect_strategy(),
    );

    let scheduler = DispatchScheduler::new(
        Arc::new(store),
        Arc::new(queue),
        SchedulerConfig::from_app(&config),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            signal.cancel();
        }
    });

    scheduler.run(shutdown).await;

    tracing::info!("DelayedNotifier scheduler stopped.");
    Ok(())
}
