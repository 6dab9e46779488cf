use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::{BalanceState, CachedBalance};

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub stale_refreshes_ignored: AtomicU64,
    pub conflicts: AtomicU64,
}

/// Result of reconciling one store row into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The cache already holds a newer version than the store reports. The
    /// cached entry is kept.
    Conflict {
        cached_version: i64,
        store_version: i64,
    },
}

/// In-memory view of the latest balances, keyed by entity id.
///
/// Backed by a sharded map, so readers and writers only contend per key.
#[derive(Debug, Default)]
pub struct BalanceCache {
    entries: DashMap<i64, CachedBalance>,
    metrics: CacheMetrics,
}

impl BalanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: i64) -> Option<CachedBalance> {
        match self.entries.get(&entity_id) {
            Some(entry) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().clone())
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Unconditional replace.
    pub fn set(&self, entity_id: i64, value: CachedBalance) {
        self.entries.insert(entity_id, value);
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Write-path refresh from a row just read back from the store. Keeps the
    /// cached entry only if it is strictly newer. Returns whether the cache
    /// was written.
    pub fn refresh(&self, state: &BalanceState) -> bool {
        match self.entries.entry(state.entity_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().version > state.version {
                    self.metrics
                        .stale_refreshes_ignored
                        .fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                entry.insert(CachedBalance::from(state));
            }
            Entry::Vacant(entry) => {
                entry.insert(CachedBalance::from(state));
            }
        }
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Synchronizer rule: insert when absent, replace when the store is
    /// strictly newer, never overwrite a fresher cached entry.
    pub fn merge_from_store(&self, state: &BalanceState) -> MergeOutcome {
        let outcome = match self.entries.entry(state.entity_id) {
            Entry::Vacant(entry) => {
                entry.insert(CachedBalance::from(state));
                MergeOutcome::Inserted
            }
            Entry::Occupied(mut entry) => {
                let cached_version = entry.get().version;
                if state.version > cached_version {
                    entry.insert(CachedBalance::from(state));
                    MergeOutcome::Updated
                } else if state.version < cached_version {
                    MergeOutcome::Conflict {
                        cached_version,
                        store_version: state.version,
                    }
                } else {
                    MergeOutcome::Unchanged
                }
            }
        };

        match outcome {
            MergeOutcome::Inserted | MergeOutcome::Updated => {
                self.metrics.writes.fetch_add(1, Ordering::Relaxed);
            }
            MergeOutcome::Conflict { .. } => {
                self.metrics.conflicts.fetch_add(1, Ordering::Relaxed);
            }
            MergeOutcome::Unchanged => {}
        }
        outcome
    }
}
