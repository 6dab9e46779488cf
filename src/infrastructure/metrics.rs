use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
pub struct IngestMetrics {
    // Worker metrics
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub negative_amounts: AtomicU64,
    pub stale_messages: AtomicU64,
    pub backpressure_rejections: AtomicU64,

    // Flush metrics
    pub batches_committed: AtomicU64,
    pub batches_failed: AtomicU64,
    pub batch_retries: AtomicU64,
    pub updates_applied: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub flush_latency: AtomicU64, // in milliseconds, summed

    // Settlement metrics
    pub acks: AtomicU64,
    pub rejects_requeued: AtomicU64,
    pub rejects_dropped: AtomicU64,
    pub settle_errors: AtomicU64,

    // Cache metrics
    pub cache_refreshes: AtomicU64,
    pub sync_runs: AtomicU64,
    pub sync_failures: AtomicU64,
    pub sync_conflicts: AtomicU64,

    // Connection metrics
    pub reconnects: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub negative_amounts: u64,
    pub stale_messages: u64,
    pub backpressure_rejections: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub batch_retries: u64,
    pub updates_applied: u64,
    pub duplicates_skipped: u64,
    pub acks: u64,
    pub rejects_requeued: u64,
    pub rejects_dropped: u64,
    pub settle_errors: u64,
    pub cache_refreshes: u64,
    pub sync_runs: u64,
    pub sync_failures: u64,
    pub sync_conflicts: u64,
    pub reconnects: u64,
}

impl IngestMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_flush_latency(&self, duration: Duration) {
        self.flush_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get_average_flush_latency(&self) -> f64 {
        let total = self.flush_latency.load(Ordering::Relaxed);
        let count = self.batches_committed.load(Ordering::Relaxed)
            + self.batches_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_received: load(&self.messages_received),
            malformed_messages: load(&self.malformed_messages),
            negative_amounts: load(&self.negative_amounts),
            stale_messages: load(&self.stale_messages),
            backpressure_rejections: load(&self.backpressure_rejections),
            batches_committed: load(&self.batches_committed),
            batches_failed: load(&self.batches_failed),
            batch_retries: load(&self.batch_retries),
            updates_applied: load(&self.updates_applied),
            duplicates_skipped: load(&self.duplicates_skipped),
            acks: load(&self.acks),
            rejects_requeued: load(&self.rejects_requeued),
            rejects_dropped: load(&self.rejects_dropped),
            settle_errors: load(&self.settle_errors),
            cache_refreshes: load(&self.cache_refreshes),
            sync_runs: load(&self.sync_runs),
            sync_failures: load(&self.sync_failures),
            sync_conflicts: load(&self.sync_conflicts),
            reconnects: load(&self.reconnects),
        }
    }
}

/// Logs a metrics snapshot every `interval` until cancelled.
pub async fn run_reporter(
    metrics: Arc<IngestMetrics>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot();
                info!(
                    metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
                    avg_flush_ms = metrics.get_average_flush_latency(),
                    "📊 ingest metrics"
                );
            }
        }
    }

    info!("final ingest metrics: {:?}", metrics.snapshot());
}
