use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use balance_ingest::infrastructure::logging::{cleanup_old_logs, init_logging};
use balance_ingest::infrastructure::metrics::run_reporter;
use balance_ingest::infrastructure::shutdown::cancel_on_signal;
use balance_ingest::infrastructure::{
    database, AmqpTransport, AppConfig, BalanceCache, BalanceRepository, BatchAccumulator,
    BatchFlusher, CacheSynchronizer, ConnectionManager, IngestMetrics, PgBalanceRepository,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    if config.logging.enable_file {
        match cleanup_old_logs(&config.logging.log_dir, config.logging.max_files) {
            Ok(0) => {}
            Ok(removed) => info!("removed {} old log files", removed),
            Err(e) => warn!("log cleanup failed: {}", e),
        }
    }

    info!(
        "🚀 Starting balance-ingest (queue '{}', {} workers, {} flushers)",
        config.broker.queue, config.workers.workers, config.batching.flushers
    );

    let pool = database::connect(&config.database)
        .await
        .context("failed to connect to Postgres")?;
    database::init_schema(&pool)
        .await
        .context("failed to initialize the database schema")?;

    let repository: Arc<dyn BalanceRepository> = Arc::new(PgBalanceRepository::new(
        pool.clone(),
        config.database.operation_timeout,
    ));
    let cache = Arc::new(BalanceCache::new());
    let metrics = Arc::new(IngestMetrics::default());

    let transport = Arc::new(AmqpTransport::new(config.broker.clone()));
    let mut connection = ConnectionManager::new(
        transport,
        config.reconnect.clone(),
        config.workers.clone(),
        metrics.clone(),
    );
    connection
        .connect()
        .await
        .context("failed to connect to RabbitMQ")?;

    // Stopped last, after the write path has drained.
    let background = CancellationToken::new();
    let sync_task = tokio::spawn(
        CacheSynchronizer::new(
            repository.clone(),
            cache.clone(),
            metrics.clone(),
            config.sync.clone(),
        )
        .run(background.clone()),
    );
    let reporter_task = tokio::spawn(run_reporter(
        metrics.clone(),
        config.metrics_report_interval,
        background.clone(),
    ));

    let (updates_tx, updates_rx) = mpsc::channel(config.batching.channel_capacity);
    let flusher = Arc::new(BatchFlusher::new(
        repository,
        cache,
        metrics,
        config.batching.clone(),
    ));
    let accumulator = BatchAccumulator::spawn(flusher, updates_rx, background.clone());

    let shutdown = CancellationToken::new();
    let signal_task = cancel_on_signal(shutdown.clone());

    // Returns with every worker joined and the update sender dropped.
    let run_result = connection.run(updates_tx, shutdown).await;

    accumulator.join().await;
    connection.close().await;

    background.cancel();
    if let Err(e) = sync_task.await {
        error!("cache synchronizer task failed: {}", e);
    }
    if let Err(e) = reporter_task.await {
        error!("metrics reporter task failed: {}", e);
    }
    pool.close().await;
    signal_task.abort();

    match run_result {
        Ok(()) => {
            info!("✅ Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("broker connection could not be restored: {}", e);
            Err(e).context("broker connection lost")
        }
    }
}
