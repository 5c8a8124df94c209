use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryStrategy;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (delivery queue broker)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Upper bound for a single store call in milliseconds (default: 5000)
    pub store_timeout_ms: u64,

    /// Scheduler tick interval in milliseconds (default: 2000)
    pub scheduler_tick_ms: u64,

    /// Maximum notifications claimed per tick (default: 100)
    pub scheduler_batch_size: u32,

    /// Age after which a `dispatching` claim is considered stranded; 0 disables recovery
    pub scheduler_stale_claim_secs: u64,

    /// Maximum delivery attempts before a notification is marked failed (default: 3)
    pub delivery_max_attempts: u32,

    /// Base delay before the first delivery retry in milliseconds (default: 5000)
    pub delivery_base_delay_ms: u64,

    /// Multiplier applied per delivery retry (default: 2.0)
    pub delivery_backoff: f64,

    /// Ceiling for the delivery retry delay in milliseconds (default: 1h)
    pub delivery_max_delay_ms: u64,

    /// Queue name, used as the Redis key prefix
    pub queue_name: String,

    /// Seconds before an unacknowledged task is redelivered (default: 60)
    pub queue_visibility_timeout_secs: u64,

    /// Sleep between empty queue polls in milliseconds (default: 500)
    pub queue_poll_interval_ms: u64,

    /// Connectivity retry attempts for store and queue calls (default: 5)
    pub reconnect_attempts: u32,

    /// Connectivity retry base delay in milliseconds (default: 500)
    pub reconnect_delay_ms: u64,

    /// Connectivity retry backoff multiplier (default: 2.0)
    pub reconnect_backoff: f64,

    /// Number of concurrent delivery workers per process (default: 4)
    pub worker_concurrency: usize,

    /// Timeout for a single channel adapter call in seconds (default: 10)
    pub adapter_timeout_secs: u64,

    /// Telegram bot token
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL
    pub telegram_api_url: String,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Resend-compatible email endpoint
    pub email_api_url: String,

    /// Email sender address
    pub email_from: Option<String>,

    /// Recipient address template, `{user_id}` is substituted
    pub email_recipient_template: String,

    /// HTTP API port (default: 3000)
    pub api_port: u16,

    /// Directory holding the browser UI (`index.html` and assets); unset disables it
    pub web_dir: Option<String>,
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
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            store_timeout_ms: parse_env("STORE_TIMEOUT_MS", 5_000)?,
            scheduler_tick_ms: parse_env("SCHEDULER_TICK_MS", 2_000)?,
            scheduler_batch_size: parse_env("SCHEDULER_BATCH_SIZE", 100)?,
            scheduler_stale_claim_secs: parse_env("SCHEDULER_STALE_CLAIM_SECS", 600)?,
            delivery_max_attempts: parse_env("DELIVERY_MAX_ATTEMPTS", 3)?,
            delivery_base_delay_ms: parse_env("DELIVERY_BASE_DELAY_MS", 5_000)?,
            delivery_backoff: parse_env("DELIVERY_BACKOFF", 2.0)?,
            delivery_max_delay_ms: parse_env("DELIVERY_MAX_DELAY_MS", 3_600_000)?,
            queue_name: std::env::var("QUEUE_NAME")
                .unwrap_or_else(|_| "delayed-notifier".to_string()),
            queue_visibility_timeout_secs: parse_env("QUEUE_VISIBILITY_TIMEOUT_SECS", 60)?,
            queue_poll_interval_ms: parse_env("QUEUE_POLL_INTERVAL_MS", 500)?,
            reconnect_attempts: parse_env("RECONNECT_ATTEMPTS", 5)?,
            reconnect_delay_ms: parse_env("RECONNECT_DELAY_MS", 500)?,
            reconnect_backoff: parse_env("RECONNECT_BACKOFF", 2.0)?,
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 4)?,
            adapter_timeout_secs: parse_env("ADAPTER_TIMEOUT_SECS", 10)?,
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
            email_from: std::env::var("EMAIL_FROM").ok(),
            email_recipient_template: std::env::var("EMAIL_RECIPIENT_TEMPLATE")
                .unwrap_or_else(|_| "user-{user_id}@localhost".to_string()),
            api_port: parse_env("API_PORT", 3000)?,
            web_dir: match std::env::var("WEB_DIR") {
                Ok(dir) if dir.trim().is_empty() => None,
                Ok(dir) => Some(dir),
                Err(_) => Some("./web".to_string()),
            },
        };
        check_stale_claim(config.stale_claim_after(), config.adapter_timeout())?;
        Ok(config)
    }

    /// Connectivity policy for store and queue calls.
    pub fn reconnect_strategy(&self) -> RetryStrategy {
        RetryStrategy::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
            self.reconnect_backoff,
            Duration::from_millis(self.reconnect_delay_ms.saturating_mul(60)),
        )
    }

    /// Message-level policy for failed delivery attempts.
    pub fn delivery_retry(&self) -> RetryStrategy {
        RetryStrategy::new(
            self.delivery_max_attempts,
            Duration::from_millis(self.delivery_base_delay_ms),
            self.delivery_backoff,
            Duration::from_millis(self.delivery_max_delay_ms),
        )
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    /// `None` when stale-claim recovery is disabled.
    pub fn stale_claim_after(&self) -> Option<Duration> {
        (self.scheduler_stale_claim_secs > 0)
            .then(|| Duration::from_secs(self.scheduler_stale_claim_secs))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Channels whose credentials are configured, sorted.
    pub fn enabled_channels(&self) -> Vec<String> {
        let mut channels = Vec::new();
        if self.resend_api_key.is_some() && self.email_from.is_some() {
            channels.push("email".to_string());
        }
        if self.telegram_bot_token.is_some() {
            channels.push("telegram".to_string());
        }
        channels
    }
}

/// A claim is measured from the start of its delivery, so recovery must wait
/// longer than any single adapter call may run.
fn check_stale_claim(stale_after: Option<Duration>, adapter_timeout: Duration) -> anyhow::Result<()> {
    match stale_after {
        Some(stale) if stale <= adapter_timeout => Err(anyhow::anyhow!(
            "SCHEDULER_STALE_CLAIM_SECS ({}s) must exceed ADAPTER_TIMEOUT_SECS ({}s)",
            stale.as_secs(),
            adapter_timeout.as_secs()
        )),
        _ => Ok(()),
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
