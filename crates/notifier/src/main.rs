use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use delayed_common::config::AppConfig;
use delayed_common::db;
use delayed_common::redis_pool::create_redis_pool;
use delayed_notifier::email::EmailAdapter;
use delayed_notifier::telegram::TelegramAdapter;
use delayed_notifier::{AdapterRegistry, WorkerPool};
use delayed_queue::RedisDeliveryQueue;
use delayed_store::PgNotificationStore;

/// Register an adapter for every channel whose credentials are configured.
fn build_adapters(config: &AppConfig) -> AdapterRegistry {
    let mut adapters = AdapterRegistry::new();

    match (&config.resend_api_key, &config.email_from) {
        (Some(key), Some(from)) => adapters.register(Arc::new(EmailAdapter::new(
            config.email_api_url.clone(),
            key.clone(),
            from.clone(),
            config.email_recipient_template.clone(),
        ))),
        _ => tracing::warn!("RESEND_API_KEY or EMAIL_FROM not set, email channel disabled"),
    }

    match &config.telegram_bot_token {
        Some(token) => adapters.register(Arc::new(TelegramAdapter::new(
            config.telegram_api_url.clone(),
            token.clone(),
        ))),
        None => tracing::warn!("TELEGRAM_BOT_TOKEN not set, telegram channel disabled"),
    }

    adapters
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "delayed_notifier=info,delayed_store=info,delayed_queue=info".into()),
        )
        .json()
        .init();

    tracing::info!("DelayedNotifier delivery workers starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(
        &config.database_url,
        config.db_max_connections,
        config.store_timeout(),
        &config.reconnect_strategy(),
    )
    .await?;
    db::run_migrations(&pool).await?;
    let redis = create_redis_pool(
        &config.redis_url,
        &config.reconnect_strategy(),
        config.store_timeout(),
    )
    .await?;

    let adapters = build_adapters(&config);
    if adapters.is_empty() {
        tracing::warn!("No channel adapters configured, every delivery will fail");
    }

    let store = PgNotificationStore::new(pool)
        .with_call_timeout(config.store_timeout())
        .with_reconnect(config.reconnect_strategy());
    let queue = RedisDeliveryQueue::new(
        redis,
        &config.queue_name,
        config.visibility_timeout(),
        config.reconnect_strategy(),
    );

    let workers = WorkerPool::from_app(&config, Arc::new(store), Arc::new(queue), adapters);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal, draining workers...");
            signal.cancel();
        }
    });

    workers.run(shutdown).await;

    tracing::info!("DelayedNotifier delivery workers stopped.");
    Ok(())
}
