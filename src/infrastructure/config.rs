use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::Level;

use crate::infrastructure::broker::BrokerConfig;
use crate::infrastructure::cache_sync::SyncConfig;
use crate::infrastructure::connection::ReconnectPolicy;
use crate::infrastructure::database::DatabaseConfig;
use crate::infrastructure::logging::LoggingConfig;
use crate::infrastructure::worker_pool::WorkerPoolConfig;
use crate::infrastructure::write_batching::BatchingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("configuration rejected: {0}")]
    Constraint(String),
}

/// Whole-process configuration. Every knob can be overridden from the
/// environment; a value that is present but unparseable is an error rather
/// than a silent fallback to the default.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub reconnect: ReconnectPolicy,
    pub workers: WorkerPoolConfig,
    pub batching: BatchingConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
    pub metrics_report_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            broker: BrokerConfig::default(),
            reconnect: ReconnectPolicy::default(),
            workers: WorkerPoolConfig::default(),
            batching: BatchingConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
            metrics_report_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database = DatabaseConfig {
            url: match optional_var("DATABASE_URL") {
                Some(url) => url,
                None => format!(
                    "postgres://{}:{}@{}:{}/{}?sslmode={}",
                    var_or("DB_USER", "postgres"),
                    var_or("DB_PASSWORD", "postgres"),
                    var_or("DB_HOST", "localhost"),
                    parse_or::<u16>("DB_PORT", 5432)?,
                    var_or("DB_NAME", "balance_db"),
                    var_or("DB_SSLMODE", "disable"),
                ),
            },
            max_connections: parse_or("DB_MAX_CONNECTIONS", defaults.database.max_connections)?,
            min_connections: parse_or("DB_MIN_CONNECTIONS", defaults.database.min_connections)?,
            acquire_timeout: millis_or("DB_ACQUIRE_TIMEOUT_MS", defaults.database.acquire_timeout)?,
            operation_timeout: millis_or(
                "DB_OPERATION_TIMEOUT_MS",
                defaults.database.operation_timeout,
            )?,
        };

        let queue = var_or("RABBITMQ_QUEUE", &defaults.broker.queue);
        let broker = BrokerConfig {
            host: var_or("RABBITMQ_HOST", &defaults.broker.host),
            port: parse_or("RABBITMQ_PORT", defaults.broker.port)?,
            user: var_or("RABBITMQ_USER", &defaults.broker.user),
            password: var_or("RABBITMQ_PASSWORD", &defaults.broker.password),
            vhost: var_or("RABBITMQ_VHOST", &defaults.broker.vhost),
            exchange: var_or("RABBITMQ_EXCHANGE", &defaults.broker.exchange),
            routing_key: var_or("RABBITMQ_ROUTING_KEY", &queue),
            queue,
            dead_letter_exchange: optional_var("RABBITMQ_DLX"),
            dead_letter_routing_key: optional_var("RABBITMQ_DLQ_ROUTING_KEY"),
            message_ttl: optional_parse::<u64>("RABBITMQ_MESSAGE_TTL_MS")?.map(Duration::from_millis),
            prefetch: parse_or("RABBITMQ_PREFETCH", defaults.broker.prefetch)?,
            consumer_tag: var_or("RABBITMQ_CONSUMER_TAG", &defaults.broker.consumer_tag),
        };

        let reconnect = ReconnectPolicy {
            delay: millis_or("RABBITMQ_RECONNECT_DELAY_MS", defaults.reconnect.delay)?,
            max_attempts: parse_or(
                "RABBITMQ_MAX_RECONNECT_ATTEMPTS",
                defaults.reconnect.max_attempts,
            )?,
        };

        let workers = WorkerPoolConfig {
            workers: parse_or("RABBITMQ_WORKERS", defaults.workers.workers)?,
            enqueue_timeout: millis_or("ENQUEUE_TIMEOUT_MS", defaults.workers.enqueue_timeout)?,
            max_event_age: optional_parse::<u64>("MAX_EVENT_AGE_SECONDS")?.map(Duration::from_secs),
        };

        let batching = BatchingConfig {
            batch_size: parse_or("BATCH_SIZE", defaults.batching.batch_size)?,
            flush_interval: millis_or("BATCH_INTERVAL_MS", defaults.batching.flush_interval)?,
            flush_jitter: millis_or("BATCH_JITTER_MS", defaults.batching.flush_jitter)?,
            flushers: parse_or("BATCH_FLUSHERS", defaults.batching.flushers)?,
            channel_capacity: parse_or("BATCH_CHANNEL_CAPACITY", defaults.batching.channel_capacity)?,
            max_retries: parse_or("BATCH_MAX_RETRIES", defaults.batching.max_retries)?,
            retry_backoff: millis_or("BATCH_RETRY_BACKOFF_MS", defaults.batching.retry_backoff)?,
        };

        let sync = SyncConfig {
            interval: secs_or("SYNC_INTERVAL_SECONDS", defaults.sync.interval)?,
            page_size: parse_or("SYNC_BATCH_SIZE", defaults.sync.page_size)?,
            page_retries: parse_or("SYNC_PAGE_RETRIES", defaults.sync.page_retries)?,
            retry_backoff: millis_or("SYNC_RETRY_BACKOFF_MS", defaults.sync.retry_backoff)?,
        };

        let logging = LoggingConfig {
            log_dir: var_or("LOG_DIR", &defaults.logging.log_dir),
            max_files: parse_or("LOG_MAX_FILES", defaults.logging.max_files)?,
            enable_console: parse_or("LOG_CONSOLE", defaults.logging.enable_console)?,
            enable_file: parse_or("LOG_TO_FILE", defaults.logging.enable_file)?,
            log_level: parse_or::<Level>("LOG_LEVEL", defaults.logging.log_level)?,
            enable_json: parse_or("LOG_JSON", defaults.logging.enable_json)?,
        };

        let config = Self {
            database,
            broker,
            reconnect,
            workers,
            batching,
            sync,
            logging,
            metrics_report_interval: secs_or(
                "METRICS_REPORT_INTERVAL_SECONDS",
                defaults.metrics_report_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would stall or silently break the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 11] = [
            (self.broker.queue.is_empty(), "queue name must not be empty"),
            (self.broker.prefetch == 0, "prefetch must be at least 1"),
            (self.workers.workers == 0, "worker count must be at least 1"),
            (self.batching.batch_size == 0, "batch size must be at least 1"),
            (self.batching.flushers == 0, "flusher count must be at least 1"),
            (self.batching.channel_capacity == 0, "update channel capacity must be at least 1"),
            (self.batching.flush_interval.is_zero(), "flush interval must be positive"),
            (self.sync.page_size <= 0, "cache sync page size must be positive"),
            (self.sync.interval.is_zero(), "cache sync interval must be positive"),
            (self.reconnect.max_attempts == 0, "reconnect attempts must be at least 1"),
            (self.metrics_report_interval.is_zero(), "metrics report interval must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::Constraint(reason.to_string())),
            None => Ok(()),
        }
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    optional_var(key).unwrap_or_else(|| default.to_string())
}

fn optional_parse<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(optional_parse(key)?.unwrap_or(default))
}

fn millis_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(optional_parse::<u64>(key)?.map(Duration::from_millis).unwrap_or(default))
}

fn secs_or(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(optional_parse::<u64>(key)?.map(Duration::from_secs).unwrap_or(default))
}
