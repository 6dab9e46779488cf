use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::decode_update;
use crate::infrastructure::broker::{settle, Delivery, Settlement};
use crate::infrastructure::metrics::IngestMetrics;
use crate::infrastructure::write_batching::PendingUpdate;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// How long a worker waits for room in the update channel before the
    /// delivery is handed back to the broker.
    pub enqueue_timeout: Duration,
    /// Events older than this are acked and skipped. Off unless configured.
    pub max_event_age: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            enqueue_timeout: Duration::from_secs(5),
            max_event_age: None,
        }
    }
}

#[derive(Clone)]
struct WorkerContext {
    config: WorkerPoolConfig,
    updates: mpsc::Sender<PendingUpdate>,
    metrics: Arc<IngestMetrics>,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `config.workers` tasks that share `deliveries`. They stop on
    /// `token` cancellation or when the delivery channel closes; a delivery
    /// already taken is always settled or forwarded first.
    pub fn spawn(
        config: &WorkerPoolConfig,
        deliveries: mpsc::Receiver<Delivery>,
        updates: mpsc::Sender<PendingUpdate>,
        metrics: Arc<IngestMetrics>,
        token: CancellationToken,
    ) -> Self {
        let deliveries = Arc::new(Mutex::new(deliveries));
        let context = WorkerContext {
            config: config.clone(),
            updates,
            metrics,
        };

        let handles = (0..config.workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    context.clone(),
                    deliveries.clone(),
                    token.clone(),
                ))
            })
            .collect();

        info!("🚀 Started {} message workers", config.workers);
        Self { handles }
    }

    /// Waits for every worker to finish its current delivery and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker task failed: {}", e);
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    context: WorkerContext,
    deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            delivery = async { deliveries.lock().await.recv().await } => delivery,
        };
        let Some(delivery) = next else { break };
        process_delivery(&context, delivery).await;
    }
    debug!("worker {} stopped", id);
}

async fn process_delivery(context: &WorkerContext, delivery: Delivery) {
    let metrics = &context.metrics;
    IngestMetrics::incr(&metrics.messages_received);

    let received_at = Utc::now();
    let update = match decode_update(&delivery.body, received_at) {
        Ok(update) => update,
        Err(e) => {
            IngestMetrics::incr(&metrics.malformed_messages);
            warn!(
                delivery_tag = delivery.delivery_tag,
                "rejecting malformed message: {}", e
            );
            settle(delivery, Settlement::Reject { requeue: false }, metrics).await;
            return;
        }
    };

    if update.timestamp_fallback {
        debug!(
            entity_id = update.entity_id,
            "message has no usable event time, using receive time"
        );
    }
    if update.has_negative_amount() {
        IngestMetrics::incr(&metrics.negative_amounts);
        warn!(
            entity_id = update.entity_id,
            amount = %update.amount,
            version = update.version,
            "negative balance accepted"
        );
    }

    if let Some(max_age) = context.config.max_event_age {
        let too_old = !update.timestamp_fallback
            && (received_at - update.timestamp)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false);
        if too_old {
            IngestMetrics::incr(&metrics.stale_messages);
            info!(
                entity_id = update.entity_id,
                event_time = %update.timestamp,
                "skipping event older than {:?}",
                max_age
            );
            settle(delivery, Settlement::Ack, metrics).await;
            return;
        }
    }

    let pending = PendingUpdate { update, delivery };
    match context
        .updates
        .send_timeout(pending, context.config.enqueue_timeout)
        .await
    {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(pending)) => {
            IngestMetrics::incr(&metrics.backpressure_rejections);
            warn!(
                entity_id = pending.update.entity_id,
                "update channel full for {:?}, requeueing",
                context.config.enqueue_timeout
            );
            settle(pending.delivery, Settlement::Reject { requeue: true }, metrics).await;
        }
        Err(SendTimeoutError::Closed(pending)) => {
            warn!(
                entity_id = pending.update.entity_id,
                "update channel closed, requeueing"
            );
            settle(pending.delivery, Settlement::Reject { requeue: true }, metrics).await;
        }
    }
}
