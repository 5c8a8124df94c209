//! DelayedNotifier API server binary entrypoint.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use delayed_common::config::AppConfig;
use delayed_common::db::{create_pool, run_migrations};
use delayed_store::PgNotificationStore;

use delayed_api::routes::{create_router, web};
use delayed_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("delayed_api=debug,delayed_store=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting DelayedNotifier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(
        &config.database_url,
        config.db_max_connections,
        config.store_timeout(),
        &config.reconnect_strategy(),
    )
    .await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created");

    let channels = config.enabled_channels();
    if channels.is_empty() {
        tracing::warn!("No delivery channels configured, every create request will be rejected");
    }

    // Build application state
    let store = PgNotificationStore::new(pool)
        .with_call_timeout(config.store_timeout())
        .with_reconnect(config.reconnect_strategy());
    let state = AppState::new(Arc::new(store), channels);

    // Build router
    let mut app = create_router(state);
    match config.web_dir.as_deref() {
        Some(dir) if Path::new(dir).join("index.html").is_file() => {
            tracing::info!(dir, "Serving web UI");
            app = app.merge(web::router(dir));
        }
        Some(dir) => tracing::warn!(dir, "Web UI directory has no index.html, not serving it"),
        None => tracing::info!("Web UI disabled"),
    }
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
