use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::BalanceState;
use crate::infrastructure::cache_service::{BalanceCache, MergeOutcome};
use crate::infrastructure::metrics::IngestMetrics;
use crate::infrastructure::repository::{BalanceRepository, StoreError};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    pub page_size: i64,
    pub page_retries: u32, // extra attempts per page before the pass is aborted
    pub retry_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            page_size: 1000,
            page_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub scanned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub conflicts: usize,
    /// Row count reported by the store when the pass started.
    pub total: i64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not count balances: {0}")]
    Count(#[source] StoreError),
    #[error("page at offset {offset} failed after {attempts} attempt(s): {source}")]
    Page {
        offset: i64,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("sync pass cancelled")]
    Cancelled,
}

/// Periodically reconciles the cache against the authoritative store.
///
/// Runs independently of the write path and only ever touches the cache
/// through its per-key operations.
pub struct CacheSynchronizer {
    repository: Arc<dyn BalanceRepository>,
    cache: Arc<BalanceCache>,
    metrics: Arc<IngestMetrics>,
    config: SyncConfig,
}

impl CacheSynchronizer {
    pub fn new(
        repository: Arc<dyn BalanceRepository>,
        cache: Arc<BalanceCache>,
        metrics: Arc<IngestMetrics>,
        config: SyncConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            metrics,
            config,
        }
    }

    /// One pass right away, then one per interval until `token` fires.
    pub async fn run(self, token: CancellationToken) {
        info!(
            "🔄 Cache synchronizer started (every {:?}, page size {})",
            self.config.interval, self.config.page_size
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    IngestMetrics::incr(&self.metrics.sync_runs);
                    match self.sync_once(&token).await {
                        Ok(report) => info!(
                            scanned = report.scanned,
                            inserted = report.inserted,
                            updated = report.updated,
                            conflicts = report.conflicts,
                            total = report.total,
                            "cache sync finished in {:?}",
                            started.elapsed()
                        ),
                        Err(SyncError::Cancelled) => break,
                        Err(e) => {
                            IngestMetrics::incr(&self.metrics.sync_failures);
                            error!("cache sync aborted, next pass starts over: {}", e);
                        }
                    }
                }
            }
        }

        info!("🛑 Cache synchronizer stopped");
    }

    pub async fn sync_once(&self, token: &CancellationToken) -> Result<SyncReport, SyncError> {
        let total = self.repository.count().await.map_err(SyncError::Count)?;
        let mut report = SyncReport {
            total,
            ..SyncReport::default()
        };

        let mut offset = 0i64;
        loop {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let page = self.fetch_page(offset, token).await?;
            let fetched = page.len();
            for state in &page {
                self.merge(state, &mut report);
            }
            report.scanned += fetched;

            if (fetched as i64) < self.config.page_size {
                break;
            }
            offset += self.config.page_size;
        }

        Ok(report)
    }

    fn merge(&self, state: &BalanceState, report: &mut SyncReport) {
        match self.cache.merge_from_store(state) {
            MergeOutcome::Inserted => report.inserted += 1,
            MergeOutcome::Updated => report.updated += 1,
            MergeOutcome::Unchanged => {}
            MergeOutcome::Conflict {
                cached_version,
                store_version,
            } => {
                report.conflicts += 1;
                IngestMetrics::incr(&self.metrics.sync_conflicts);
                warn!(
                    entity_id = state.entity_id,
                    cached_version,
                    store_version,
                    "cache is ahead of the store, keeping cached entry"
                );
            }
        }
    }

    async fn fetch_page(
        &self,
        offset: i64,
        token: &CancellationToken,
    ) -> Result<Vec<BalanceState>, SyncError> {
        let max_attempts = self.config.page_retries + 1;
        let mut attempt = 1;

        loop {
            match self
                .repository
                .get_all_paged(self.config.page_size, offset)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(
                        "page at offset {} failed (attempt {}/{}): {}",
                        offset, attempt, max_attempts, e
                    );
                    let backoff = self.config.retry_backoff * attempt;
                    tokio::select! {
                        _ = token.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(source) => {
                    return Err(SyncError::Page {
                        offset,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CachedBalance;
    use crate::infrastructure::repository::MockBalanceRepository;
    use chrono::Utc;
    use mockall::predicate::eq;
    use rust_decimal::Decimal;

    fn row(entity_id: i64, version: i64) -> BalanceState {
        BalanceState {
            entity_id,
            amount: Decimal::from(version * 10),
            version,
            updated_at: Utc::now(),
        }
    }

    fn synchronizer(repo: MockBalanceRepository, cache: Arc<BalanceCache>, page_size: i64) -> CacheSynchronizer {
        CacheSynchronizer::new(
            Arc::new(repo),
            cache,
            Arc::new(IngestMetrics::default()),
            SyncConfig {
                page_size,
                retry_backoff: Duration::from_millis(1),
                ..SyncConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_pages_through_store_and_keeps_fresher_cache() {
        let mut repo = MockBalanceRepository::new();
        repo.expect_count().returning(|| Ok(3));
        repo.expect_get_all_paged()
            .with(eq(2), eq(0))
            .returning(|_, _| Ok(vec![row(1, 1), row(2, 2)]));
        repo.expect_get_all_paged()
            .with(eq(2), eq(2))
            .returning(|_, _| Ok(vec![row(3, 1)]));

        let cache = Arc::new(BalanceCache::new());
        cache.set(
            2,
            CachedBalance {
                amount: Decimal::from(99),
                version: 5,
                observed_at: Utc::now(),
            },
        );

        let sync = synchronizer(repo, cache.clone(), 2);
        let report = sync.sync_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.conflicts, 1);
        assert_eq!(cache.get(2).unwrap().version, 5);
        assert_eq!(cache.get(3).unwrap().amount, Decimal::from(10));
    }

    #[tokio::test]
    async fn test_transient_page_errors_are_retried() {
        let mut repo = MockBalanceRepository::new();
        repo.expect_count().returning(|| Ok(1));
        let mut seq = mockall::Sequence::new();
        repo.expect_get_all_paged()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Err(StoreError::Timeout {
                    operation: "get_all_paged",
                    timeout: Duration::from_secs(1),
                })
            });
        repo.expect_get_all_paged()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![row(4, 2)]));

        let cache = Arc::new(BalanceCache::new());
        let report = synchronizer(repo, cache.clone(), 10)
            .sync_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(cache.get(4).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_permanent_page_error_aborts_pass() {
        let mut repo = MockBalanceRepository::new();
        repo.expect_count().returning(|| Ok(1));
        repo.expect_get_all_paged().times(1).returning(|_, _| {
            Err(StoreError::Database {
                operation: "get_all_paged",
                source: sqlx::Error::RowNotFound,
            })
        });

        let result = synchronizer(repo, Arc::new(BalanceCache::new()), 10)
            .sync_once(&CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SyncError::Page { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_cancelled_token_abandons_pass() {
        let mut repo = MockBalanceRepository::new();
        repo.expect_count().returning(|| Ok(0));
        repo.expect_get_all_paged().never();

        let token = CancellationToken::new();
        token.cancel();
        let result = synchronizer(repo, Arc::new(BalanceCache::new()), 10)
            .sync_once(&token)
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
