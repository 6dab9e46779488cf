use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{BalanceEvent, BalanceState, BalanceUpdate};
use crate::infrastructure::broker::{settle, Delivery, Settlement};
use crate::infrastructure::cache_service::BalanceCache;
use crate::infrastructure::metrics::IngestMetrics;
use crate::infrastructure::repository::{BalanceRepository, CommitOutcome, StoreError};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_JITTER_MS: u64 = 50;

/// Configuration for write batching
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub flush_jitter: Duration, // each flusher adds a random share of this to its interval
    pub flushers: usize,
    pub channel_capacity: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(2000),
            flush_jitter: Duration::from_millis(500),
            flushers: 4,
            channel_capacity: 1000,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// A decoded update still waiting for its delivery to be settled.
#[derive(Debug)]
pub struct PendingUpdate {
    pub update: BalanceUpdate,
    pub delivery: Delivery,
}

#[derive(Debug)]
pub struct WriteBatch {
    pub batch_id: Uuid,
    pub items: Vec<PendingUpdate>,
    pub created_at: Instant,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            items: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn push(&mut self, item: PendingUpdate) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self, max_size: usize) -> bool {
        self.items.len() >= max_size
    }

    /// Hands the current items off and starts a fresh batch.
    pub fn take(&mut self) -> WriteBatch {
        std::mem::take(self)
    }
}

/// What a flush will do with each item of a batch, by index.
#[derive(Debug, Default, PartialEq)]
pub struct BatchPlan {
    /// Logged in the event table, sorted by (entity, version).
    pub events: Vec<BalanceEvent>,
    /// One highest-version row per entity, sorted by entity id.
    pub balances: Vec<BalanceState>,
    /// Acked once the write commits, nacked with requeue if it fails.
    pub accepted: Vec<usize>,
    /// Already seen, in this batch or in the event log. Acked without writing.
    pub duplicates: Vec<usize>,
    /// Rejected without requeue.
    pub invalid: Vec<usize>,
}

/// Resolves a batch without touching the store: drops invalid items, keeps the
/// first occurrence of each event id, skips ids in `already_logged` and picks
/// the highest version per entity as the balance to write.
pub fn plan_batch(updates: &[BalanceUpdate], already_logged: &HashSet<String>) -> BatchPlan {
    let mut plan = BatchPlan::default();
    let mut seen_event_ids: HashSet<&str> = HashSet::new();
    let mut winners: HashMap<i64, &BalanceUpdate> = HashMap::new();

    for (index, update) in updates.iter().enumerate() {
        if update.entity_id <= 0 {
            plan.invalid.push(index);
            continue;
        }

        if update.has_event_id() {
            if already_logged.contains(&update.event_id)
                || !seen_event_ids.insert(update.event_id.as_str())
            {
                plan.duplicates.push(index);
                continue;
            }
        }

        plan.accepted.push(index);
        plan.events.push(BalanceEvent::from_update(update));
        winners
            .entry(update.entity_id)
            .and_modify(|current| {
                if update.version > current.version {
                    *current = update;
                }
            })
            .or_insert(update);
    }

    plan.events
        .sort_by(|a, b| (a.entity_id, a.version).cmp(&(b.entity_id, b.version)));
    plan.balances = winners.into_values().map(BalanceState::from_update).collect();
    plan.balances.sort_by_key(|balance| balance.entity_id);
    plan
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub batch_id: Uuid,
    pub committed: bool,
    pub acked: usize,
    pub duplicates: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub balances_applied: u64,
}

/// Persists one batch at a time and settles its deliveries.
pub struct BatchFlusher {
    repository: Arc<dyn BalanceRepository>,
    cache: Arc<BalanceCache>,
    metrics: Arc<IngestMetrics>,
    config: BatchingConfig,
}

impl BatchFlusher {
    pub fn new(
        repository: Arc<dyn BalanceRepository>,
        cache: Arc<BalanceCache>,
        metrics: Arc<IngestMetrics>,
        config: BatchingConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            metrics,
            config,
        }
    }

    pub async fn flush(&self, batch: WriteBatch) -> FlushReport {
        let started = Instant::now();
        let mut report = FlushReport {
            batch_id: batch.batch_id,
            ..FlushReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let (updates, deliveries): (Vec<BalanceUpdate>, Vec<Delivery>) = batch
            .items
            .into_iter()
            .map(|item| (item.update, item.delivery))
            .unzip();

        let already_logged = self.already_logged(&updates).await;
        let plan = plan_batch(&updates, &already_logged);
        let mut slots: Vec<Option<Delivery>> = deliveries.into_iter().map(Some).collect();

        for &index in &plan.invalid {
            if let Some(delivery) = slots[index].take() {
                warn!(
                    batch_id = %report.batch_id,
                    entity_id = updates[index].entity_id,
                    "dropping update with invalid entity id"
                );
                settle(delivery, Settlement::Reject { requeue: false }, &self.metrics).await;
                report.dropped += 1;
            }
        }
        for &index in &plan.duplicates {
            if let Some(delivery) = slots[index].take() {
                debug!(event_id = %updates[index].event_id, "duplicate event, acking without write");
                settle(delivery, Settlement::Ack, &self.metrics).await;
                report.duplicates += 1;
            }
        }
        IngestMetrics::add(&self.metrics.duplicates_skipped, report.duplicates);

        let accepted: Vec<Delivery> = plan
            .accepted
            .iter()
            .filter_map(|&index| slots[index].take())
            .collect();
        if accepted.is_empty() {
            return report;
        }

        match self.commit_with_retry(&plan).await {
            Ok(outcome) => {
                self.refresh_cache(&plan.balances).await;
                for delivery in accepted {
                    settle(delivery, Settlement::Ack, &self.metrics).await;
                    report.acked += 1;
                }
                report.committed = true;
                report.balances_applied = outcome.balances_applied;

                IngestMetrics::incr(&self.metrics.batches_committed);
                IngestMetrics::add(&self.metrics.updates_applied, outcome.balances_applied as usize);
                debug!(
                    batch_id = %report.batch_id,
                    events = outcome.events_inserted,
                    balances = outcome.balances_applied,
                    "batch committed in {:?}",
                    started.elapsed()
                );
            }
            Err(e) => {
                error!(
                    batch_id = %report.batch_id,
                    "batch of {} updates failed, requeueing: {}",
                    accepted.len(),
                    e
                );
                for delivery in accepted {
                    settle(delivery, Settlement::Reject { requeue: true }, &self.metrics).await;
                    report.requeued += 1;
                }
                IngestMetrics::incr(&self.metrics.batches_failed);
            }
        }

        self.metrics.record_flush_latency(started.elapsed());
        report
    }

    /// Event ids of this batch that are already in the event log. A failed
    /// lookup falls back to the store's own conflict handling.
    async fn already_logged(&self, updates: &[BalanceUpdate]) -> HashSet<String> {
        let mut event_ids: Vec<String> = updates
            .iter()
            .filter(|u| u.has_event_id())
            .map(|u| u.event_id.clone())
            .collect();
        event_ids.sort();
        event_ids.dedup();
        if event_ids.is_empty() {
            return HashSet::new();
        }

        match self.repository.existing_event_ids(&event_ids).await {
            Ok(found) => found,
            Err(e) => {
                warn!("event log lookup failed, relying on insert conflicts: {}", e);
                HashSet::new()
            }
        }
    }

    async fn commit_with_retry(&self, plan: &BatchPlan) -> Result<CommitOutcome, StoreError> {
        let mut retries = 0;
        let mut backoff = self.config.retry_backoff;

        loop {
            match self
                .repository
                .commit_batch(&plan.events, &plan.balances)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    retries += 1;
                    IngestMetrics::incr(&self.metrics.batch_retries);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..RETRY_JITTER_MS));
                    warn!(
                        "transient store error (retry {}/{}), backing off {:?}: {}",
                        retries, self.config.max_retries, backoff, e
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    backoff = std::cmp::min(backoff * 2, MAX_RETRY_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads the rows back so the cache holds what is actually durable.
    async fn refresh_cache(&self, balances: &[BalanceState]) {
        let entity_ids: Vec<i64> = balances.iter().map(|b| b.entity_id).collect();
        match self.repository.get_by_ids(&entity_ids).await {
            Ok(rows) => {
                for row in &rows {
                    self.cache.refresh(row);
                }
                IngestMetrics::add(&self.metrics.cache_refreshes, rows.len());
            }
            Err(e) => warn!(
                "cache refresh skipped for {} entities, synchronizer will catch up: {}",
                entity_ids.len(),
                e
            ),
        }
    }
}

/// Pool of flush loops draining the update channel.
pub struct BatchAccumulator {
    handles: Vec<JoinHandle<()>>,
}

impl BatchAccumulator {
    /// Starts `config.flushers` loops. Each one flushes when its batch is full
    /// or its jittered interval elapses, and flushes whatever it holds before
    /// exiting on channel close or `token` cancellation.
    pub fn spawn(
        flusher: Arc<BatchFlusher>,
        updates: mpsc::Receiver<PendingUpdate>,
        token: CancellationToken,
    ) -> Self {
        let config = flusher.config.clone();
        let updates = Arc::new(Mutex::new(updates));
        let jitter_ms = config.flush_jitter.as_millis() as u64;

        let handles = (0..config.flushers)
            .map(|id| {
                let period = config.flush_interval
                    + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
                tokio::spawn(flush_loop(
                    id,
                    period,
                    flusher.clone(),
                    updates.clone(),
                    token.clone(),
                ))
            })
            .collect();

        info!(
            "🚀 Started {} batch flushers (batch size {}, interval {:?})",
            config.flushers, config.batch_size, config.flush_interval
        );
        Self { handles }
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("batch flusher task failed: {}", e);
            }
        }
    }
}

async fn flush_loop(
    id: usize,
    period: Duration,
    flusher: Arc<BatchFlusher>,
    updates: Arc<Mutex<mpsc::Receiver<PendingUpdate>>>,
    token: CancellationToken,
) {
    let batch_size = flusher.config.batch_size;
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut batch = WriteBatch::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                let mut rx = updates.lock().await;
                while let Ok(item) = rx.try_recv() {
                    batch.push(item);
                }
                drop(rx);
                break;
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flusher.flush(batch.take()).await;
                }
            }
            item = async { updates.lock().await.recv().await } => match item {
                Some(item) => {
                    batch.push(item);
                    if batch.is_full(batch_size) {
                        flusher.flush(batch.take()).await;
                        ticker.reset();
                    }
                }
                None => break,
            },
        }
    }

    if !batch.is_empty() {
        info!("📦 Flusher {} draining {} buffered updates", id, batch.len());
        flusher.flush(batch.take()).await;
    }
    debug!("flusher {} stopped", id);
}
