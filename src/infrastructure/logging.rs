use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Configuration for console and file logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub max_files: usize,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
    pub enable_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            max_files: 30, // Keep 30 days of logs
            enable_console: true,
            enable_file: false,
            log_level: Level::INFO,
            enable_json: true,
        }
    }
}

/// Keeps the non-blocking file writers flushing. Drop it last.
#[must_use]
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Initialize structured logging: console output plus optional daily-rolling
/// files. `RUST_LOG` overrides the configured level.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<LoggingGuard, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.log_level.to_string().to_lowercase();
        EnvFilter::new(format!("balance_ingest={},sqlx=warn,lapin=warn", level))
    });

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.enable_console {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true);
        if config.enable_json {
            layers.push(Box::new(console_layer.json().flatten_event(true)));
        } else {
            layers.push(Box::new(console_layer.with_ansi(true)));
        }
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;

        let all_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "balance-ingest.log");
        let (all_writer, all_guard) = tracing_appender::non_blocking(all_appender);
        guards.push(all_guard);

        let error_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "error.log");
        let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);
        guards.push(error_guard);

        let all_layer = fmt::layer()
            .json()
            .with_writer(all_writer)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);
        layers.push(Box::new(all_layer));

        let error_layer = fmt::layer()
            .json()
            .with_writer(error_writer)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(tracing_subscriber::filter::LevelFilter::WARN);
        layers.push(Box::new(error_layer));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok(LoggingGuard { _guards: guards })
}

/// Clean up old log files based on retention policy
pub fn cleanup_old_logs(log_dir: &str, max_files: usize) -> std::io::Result<usize> {
    let log_path = Path::new(log_dir);
    if !log_path.exists() {
        return Ok(0);
    }

    let mut log_files: Vec<_> = fs::read_dir(log_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.contains(".log"))
                .unwrap_or(false)
        })
        .collect();

    // Oldest first
    log_files.sort_by_key(|entry| {
        entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    let mut removed = 0;
    if log_files.len() > max_files {
        let files_to_remove = log_files.len() - max_files;
        for entry in log_files.iter().take(files_to_remove) {
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }

    Ok(removed)
}
