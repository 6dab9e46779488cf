use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::infrastructure::broker::{BrokerError, BrokerSession, BrokerTransport, SessionHandle};
use crate::infrastructure::metrics::IngestMetrics;
use crate::infrastructure::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::infrastructure::write_batching::PendingUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempt `n` waits `delay * n` first.
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

/// Owns the broker session and keeps the worker pool fed across
/// reconnects.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    policy: ReconnectPolicy,
    workers: WorkerPoolConfig,
    metrics: Arc<IngestMetrics>,
    state: watch::Sender<ConnectionState>,
    session: Option<BrokerSession>,
    stopped: Option<SessionHandle>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        policy: ReconnectPolicy,
        workers: WorkerPoolConfig,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            policy,
            workers,
            metrics,
            state,
            session: None,
            stopped: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("broker connection {:?} -> {:?}", previous, next);
        }
    }

    /// Initial connect. The caller treats failure as fatal.
    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.set_state(ConnectionState::Connecting);
        match self.transport.open().await {
            Ok(session) => {
                self.session = Some(session);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Consumes until `token` fires, reconnecting on unexpected loss.
    ///
    /// On cancellation consumption is stopped and every worker is joined, but
    /// the session stays open so buffered deliveries can still be settled;
    /// call [`close`](Self::close) once the flushers are done. `updates` is
    /// dropped on return.
    pub async fn run(
        &mut self,
        updates: mpsc::Sender<PendingUpdate>,
        token: CancellationToken,
    ) -> Result<(), BrokerError> {
        loop {
            let session = self.session.take().ok_or(BrokerError::NotConnected)?;
            let (deliveries, handle) = session.split();
            let lost = handle.lost();
            let consume = token.child_token();
            let pool = WorkerPool::spawn(
                &self.workers,
                deliveries,
                updates.clone(),
                self.metrics.clone(),
                consume.clone(),
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("🛑 Stopping consumption");
                    if let Err(e) = handle.stop_consuming().await {
                        warn!("cancel consume failed: {}", e);
                    }
                    pool.join().await;
                    self.stopped = Some(handle);
                    return Ok(());
                }
                _ = lost.cancelled() => {
                    self.set_state(ConnectionState::Reconnecting);
                    warn!("broker connection lost, draining workers before reconnecting");
                    consume.cancel();
                    pool.join().await;
                    if let Err(e) = handle.close().await {
                        warn!("teardown of lost session: {}", e);
                    }
                }
            }

            if !self.reconnect(&token).await? {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(false)` when cancelled while waiting.
    async fn reconnect(&mut self, token: &CancellationToken) -> Result<bool, BrokerError> {
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay * attempt;
            info!(
                "reconnecting in {:?} (attempt {}/{})",
                delay, attempt, self.policy.max_attempts
            );
            tokio::select! {
                _ = token.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(false);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            match self.transport.open().await {
                Ok(session) => {
                    self.session = Some(session);
                    IngestMetrics::incr(&self.metrics.reconnects);
                    self.set_state(ConnectionState::Connected);
                    info!("✅ Reconnected to broker after {} attempt(s)", attempt);
                    return Ok(true);
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {}", attempt, e);
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        error!(
            "giving up on the broker after {} reconnect attempts",
            self.policy.max_attempts
        );
        Err(BrokerError::ReconnectExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// Closes whatever session is still open.
    pub async fn close(&mut self) {
        if let Some(handle) = self.stopped.take() {
            if let Err(e) = handle.close().await {
                warn!("broker close: {}", e);
            }
        }
        if let Some(session) = self.session.take() {
            let (_, handle) = session.split();
            if let Err(e) = handle.close().await {
                warn!("broker close: {}", e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
