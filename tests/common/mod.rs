#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use balance_ingest::domain::{BalanceEvent, BalanceState};
use balance_ingest::infrastructure::broker::{
    BrokerError, BrokerSession, BrokerTransport, Delivery, DeliveryHandle, SessionCloser,
    Settlement,
};
use balance_ingest::infrastructure::cache_sync::{CacheSynchronizer, SyncConfig};
use balance_ingest::infrastructure::connection::{ConnectionManager, ReconnectPolicy};
use balance_ingest::infrastructure::repository::{BalanceRepository, CommitOutcome, StoreError};
use balance_ingest::infrastructure::worker_pool::WorkerPoolConfig;
use balance_ingest::infrastructure::write_batching::{BatchAccumulator, BatchFlusher, BatchingConfig};
use balance_ingest::infrastructure::{BalanceCache, IngestMetrics};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    balances: BTreeMap<i64, BalanceState>,
    events: Vec<BalanceEvent>,
    event_ids: HashSet<String>,
}

/// In-memory store with the same conflict rules as the Postgres one: events
/// are unique per non-empty id, balances only move to a strictly greater
/// version.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    failing_commits: AtomicU32,
    commit_delay_ms: AtomicU64,
    pub commit_attempts: AtomicU32,
    pub successful_commits: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` commits fail with a transient error.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Every commit takes at least this long.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn put_balance(&self, state: BalanceState) {
        self.inner
            .lock()
            .unwrap()
            .balances
            .insert(state.entity_id, state);
    }

    pub fn balance(&self, entity_id: i64) -> Option<BalanceState> {
        self.inner.lock().unwrap().balances.get(&entity_id).cloned()
    }

    pub fn balances(&self) -> Vec<BalanceState> {
        self.inner.lock().unwrap().balances.values().cloned().collect()
    }

    pub fn events(&self) -> Vec<BalanceEvent> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn events_with_id(&self, event_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.event_id == event_id)
            .count()
    }

    fn insert_events(inner: &mut StoreInner, events: &[BalanceEvent]) -> u64 {
        let mut inserted = 0;
        for event in events {
            if !event.event_id.is_empty() && !inner.event_ids.insert(event.event_id.clone()) {
                continue;
            }
            inner.events.push(event.clone());
            inserted += 1;
        }
        inserted
    }

    fn upsert_balances(inner: &mut StoreInner, balances: &[BalanceState]) -> u64 {
        let mut applied = 0;
        for balance in balances {
            let replace = inner
                .balances
                .get(&balance.entity_id)
                .map_or(true, |current| current.version < balance.version);
            if replace {
                inner.balances.insert(balance.entity_id, balance.clone());
                applied += 1;
            }
        }
        applied
    }
}

#[async_trait]
impl BalanceRepository for MemoryStore {
    async fn save_events_batch(&self, events: &[BalanceEvent]) -> Result<u64, StoreError> {
        Ok(Self::insert_events(&mut self.inner.lock().unwrap(), events))
    }

    async fn save_balances_batch(&self, balances: &[BalanceState]) -> Result<u64, StoreError> {
        Ok(Self::upsert_balances(&mut self.inner.lock().unwrap(), balances))
    }

    async fn commit_batch(
        &self,
        events: &[BalanceEvent],
        balances: &[BalanceState],
    ) -> Result<CommitOutcome, StoreError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::from_sqlx("commit_batch", sqlx::Error::PoolTimedOut));
        }

        let mut inner = self.inner.lock().unwrap();
        let outcome = CommitOutcome {
            events_inserted: Self::insert_events(&mut inner, events),
            balances_applied: Self::upsert_balances(&mut inner, balances),
        };
        self.successful_commits.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn existing_event_ids(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(event_ids
            .iter()
            .filter(|id| inner.event_ids.contains(*id))
            .cloned()
            .collect())
    }

    async fn get_by_ids(&self, entity_ids: &[i64]) -> Result<Vec<BalanceState>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(entity_ids
            .iter()
            .filter_map(|id| inner.balances.get(id).cloned())
            .collect())
    }

    async fn get_all_paged(&self, limit: i64, offset: i64) -> Result<Vec<BalanceState>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .balances
            .values()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.lock().unwrap().balances.len() as i64)
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct BrokerInner {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, (u64, Message)>, // tag -> (session, message)
    live_sessions: HashMap<u64, CancellationToken>,
    acked: Vec<Vec<u8>>,
    dropped: Vec<Vec<u8>>,
    requeued: u64,
    double_settlements: u64,
    next_tag: u64,
    next_session: u64,
}

impl BrokerInner {
    /// Channel close: everything the session held goes back to the queue.
    fn kill_session(&mut self, session: u64) {
        if let Some(lost) = self.live_sessions.remove(&session) {
            lost.cancel();
        }
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == session)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some((_, mut message)) = self.unacked.remove(&tag) {
                message.redelivered = true;
                self.ready.push_back(message);
            }
        }
    }
}

/// Broker fake with at-least-once semantics: unsettled deliveries of a dead
/// session are redelivered.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
    prefetch: usize,
    failing_opens: Arc<AtomicU32>,
    pub opens: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new(prefetch: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner::default())),
            prefetch,
            failing_opens: Arc::new(AtomicU32::new(0)),
            opens: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, body: impl Into<Vec<u8>>) {
        self.inner.lock().unwrap().ready.push_back(Message {
            body: body.into(),
            redelivered: false,
        });
    }

    pub fn publish_json(&self, value: serde_json::Value) {
        self.publish(value.to_string());
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Kills every live session as if the TCP connection had dropped.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock().unwrap();
        let sessions: Vec<u64> = inner.live_sessions.keys().copied().collect();
        for session in sessions {
            inner.kill_session(session);
        }
    }

    pub fn acked(&self) -> usize {
        self.inner.lock().unwrap().acked.len()
    }

    pub fn dropped(&self) -> usize {
        self.inner.lock().unwrap().dropped.len()
    }

    pub fn requeued(&self) -> u64 {
        self.inner.lock().unwrap().requeued
    }

    pub fn double_settlements(&self) -> u64 {
        self.inner.lock().unwrap().double_settlements
    }

    pub fn outstanding(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len() + inner.unacked.len()
    }
}

struct MemoryHandle {
    inner: Arc<Mutex<BrokerInner>>,
    session: u64,
    tag: u64,
}

#[async_trait]
impl DeliveryHandle for MemoryHandle {
    async fn settle(&self, settlement: Settlement) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.live_sessions.contains_key(&self.session) {
            return Err(BrokerError::Transport("channel closed".to_string()));
        }
        let Some((_, mut message)) = inner.unacked.remove(&self.tag) else {
            inner.double_settlements += 1;
            return Err(BrokerError::Transport("unknown delivery tag".to_string()));
        };
        match settlement {
            Settlement::Ack => inner.acked.push(message.body),
            Settlement::Reject { requeue: true } => {
                inner.requeued += 1;
                message.redelivered = true;
                inner.ready.push_back(message);
            }
            Settlement::Reject { requeue: false } => inner.dropped.push(message.body),
        }
        Ok(())
    }
}

struct MemoryCloser {
    inner: Arc<Mutex<BrokerInner>>,
    session: u64,
    consuming: CancellationToken,
}

#[async_trait]
impl SessionCloser for MemoryCloser {
    async fn stop_consuming(&self) -> Result<(), BrokerError> {
        self.consuming.cancel();
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.consuming.cancel();
        self.inner.lock().unwrap().kill_session(self.session);
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn open(&self) -> Result<BrokerSession, BrokerError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::Transport("connection refused".to_string()));
        }

        let lost = CancellationToken::new();
        let consuming = CancellationToken::new();
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_session += 1;
            let id = inner.next_session;
            inner.live_sessions.insert(id, lost.clone());
            id
        };

        let (tx, rx) = mpsc::channel(self.prefetch);
        tokio::spawn(pump(
            self.inner.clone(),
            session,
            self.prefetch,
            tx,
            lost.clone(),
            consuming.clone(),
        ));

        Ok(BrokerSession::new(
            rx,
            lost,
            Box::new(MemoryCloser {
                inner: self.inner.clone(),
                session,
                consuming,
            }),
        ))
    }
}

async fn pump(
    inner: Arc<Mutex<BrokerInner>>,
    session: u64,
    prefetch: usize,
    tx: mpsc::Sender<Delivery>,
    lost: CancellationToken,
    consuming: CancellationToken,
) {
    loop {
        if lost.is_cancelled() || consuming.is_cancelled() {
            return;
        }
        let next = {
            let mut inner = inner.lock().unwrap();
            let in_flight = inner.unacked.values().filter(|(s, _)| *s == session).count();
            if in_flight < prefetch {
                inner.ready.pop_front().map(|message| {
                    inner.next_tag += 1;
                    let tag = inner.next_tag;
                    inner.unacked.insert(tag, (session, message.clone()));
                    (tag, message)
                })
            } else {
                None
            }
        };

        match next {
            Some((tag, message)) => {
                let delivery = Delivery::new(
                    message.body,
                    tag,
                    message.redelivered,
                    Box::new(MemoryHandle {
                        inner: inner.clone(),
                        session,
                        tag,
                    }),
                );
                if tx.send(delivery).await.is_err() {
                    return;
                }
            }
            None => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub fn fast_batching() -> BatchingConfig {
    BatchingConfig {
        batch_size: 10,
        flush_interval: Duration::from_millis(20),
        flush_jitter: Duration::from_millis(5),
        flushers: 2,
        channel_capacity: 64,
        max_retries: 3,
        retry_backoff: Duration::from_millis(5),
    }
}

pub fn fast_sync() -> SyncConfig {
    SyncConfig {
        interval: Duration::from_millis(50),
        page_size: 3,
        page_retries: 2,
        retry_backoff: Duration::from_millis(5),
    }
}

/// The whole ingest path wired the way the binary wires it, over fakes.
pub struct Pipeline {
    pub broker: MemoryBroker,
    pub store: Arc<MemoryStore>,
    pub cache: Arc<BalanceCache>,
    pub metrics: Arc<IngestMetrics>,
    shutdown: CancellationToken,
    background: CancellationToken,
    run: JoinHandle<(ConnectionManager, Result<(), BrokerError>)>,
    accumulator: BatchAccumulator,
    sync: JoinHandle<()>,
}

impl Pipeline {
    pub async fn start(broker: MemoryBroker, store: Arc<MemoryStore>, batching: BatchingConfig) -> Self {
        Self::start_with(broker, store, batching, WorkerPoolConfig {
            workers: 3,
            enqueue_timeout: Duration::from_millis(200),
            max_event_age: None,
        })
        .await
    }

    pub async fn start_with(
        broker: MemoryBroker,
        store: Arc<MemoryStore>,
        batching: BatchingConfig,
        workers: WorkerPoolConfig,
    ) -> Self {
        let cache = Arc::new(BalanceCache::new());
        let metrics = Arc::new(IngestMetrics::default());
        let repository: Arc<dyn BalanceRepository> = store.clone();

        let mut connection = ConnectionManager::new(
            Arc::new(broker.clone()),
            ReconnectPolicy {
                delay: Duration::from_millis(10),
                max_attempts: 5,
            },
            workers,
            metrics.clone(),
        );
        connection.connect().await.expect("initial connect");

        let background = CancellationToken::new();
        let sync = tokio::spawn(
            CacheSynchronizer::new(repository.clone(), cache.clone(), metrics.clone(), fast_sync())
                .run(background.clone()),
        );

        let (updates_tx, updates_rx) = mpsc::channel(batching.channel_capacity);
        let flusher = Arc::new(BatchFlusher::new(repository, cache.clone(), metrics.clone(), batching));
        let accumulator = BatchAccumulator::spawn(flusher, updates_rx, background.clone());

        let shutdown = CancellationToken::new();
        let run_token = shutdown.clone();
        let run = tokio::spawn(async move {
            let result = connection.run(updates_tx, run_token).await;
            (connection, result)
        });

        Self {
            broker,
            store,
            cache,
            metrics,
            shutdown,
            background,
            run,
            accumulator,
            sync,
        }
    }

    /// Same order as the binary: stop consuming, drain, close, stop sync.
    pub async fn stop(self) -> Result<(), BrokerError> {
        self.shutdown.cancel();
        let (mut connection, result) = self.run.await.expect("run task");
        self.accumulator.join().await;
        connection.close().await;
        self.background.cancel();
        self.sync.await.expect("sync task");
        result
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
