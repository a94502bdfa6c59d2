//! Refresh metrics, per materialized view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::catalog::TableId;
use crate::refresh::RefreshJobStatus;

/// Counters for one materialized view's refresh history.
#[derive(Debug, Default)]
pub struct MvRefreshMetrics {
    last_refresh_duration_ms: AtomicU64,
    success_count: AtomicU64,
    failed_count: AtomicU64,
    empty_count: AtomicU64,
    lock_retry_count: AtomicU64,
    general_retry_count: AtomicU64,
    snapshot_sync_count: AtomicU64,
    last_status: Mutex<Option<RefreshJobStatus>>,
}

impl MvRefreshMetrics {
    /// Record a finished run's terminal status.
    pub fn record_status(&self, status: RefreshJobStatus) {
        match status {
            RefreshJobStatus::Success => self.success_count.fetch_add(1, Ordering::Relaxed),
            RefreshJobStatus::Failed => self.failed_count.fetch_add(1, Ordering::Relaxed),
            RefreshJobStatus::Empty => self.empty_count.fetch_add(1, Ordering::Relaxed),
        };
        *self.last_status.lock() = Some(status);
    }

    /// Record a finished run's duration.
    pub fn record_duration_ms(&self, duration_ms: u64) {
        self.last_refresh_duration_ms
            .store(duration_ms, Ordering::Relaxed);
    }

    pub(crate) fn inc_lock_retry(&self) {
        self.lock_retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_general_retry(&self) {
        self.general_retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_snapshot_sync(&self) {
        self.snapshot_sync_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_refresh_duration_ms(&self) -> u64 {
        self.last_refresh_duration_ms.load(Ordering::Relaxed)
    }

    pub fn last_status(&self) -> Option<RefreshJobStatus> {
        *self.last_status.lock()
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count.load(Ordering::Relaxed)
    }

    pub fn empty_count(&self) -> u64 {
        self.empty_count.load(Ordering::Relaxed)
    }

    /// Refresh attempts retried because a lock could not be acquired.
    pub fn lock_retry_count(&self) -> u64 {
        self.lock_retry_count.load(Ordering::Relaxed)
    }

    /// Refresh attempts retried under the general-failure budget.
    pub fn general_retry_count(&self) -> u64 {
        self.general_retry_count.load(Ordering::Relaxed)
    }

    /// Snapshot-and-verify cycles executed across runs.
    pub fn snapshot_sync_count(&self) -> u64 {
        self.snapshot_sync_count.load(Ordering::Relaxed)
    }
}

/// Registry of per-view refresh metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    entries: RwLock<HashMap<TableId, Arc<MvRefreshMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The metrics entity for a view, created on first use.
    pub fn entity(&self, mv_id: TableId) -> Arc<MvRefreshMetrics> {
        if let Some(m) = self.entries.read().get(&mv_id) {
            return m.clone();
        }
        self.entries
            .write()
            .entry(mv_id)
            .or_insert_with(|| Arc::new(MvRefreshMetrics::default()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let registry = MetricsRegistry::new();
        let m = registry.entity(1);
        m.record_status(RefreshJobStatus::Success);
        m.record_status(RefreshJobStatus::Empty);
        m.record_duration_ms(1234);
        m.inc_lock_retry();

        assert_eq!(m.success_count(), 1);
        assert_eq!(m.empty_count(), 1);
        assert_eq!(m.failed_count(), 0);
        assert_eq!(m.lock_retry_count(), 1);
        assert_eq!(m.last_refresh_duration_ms(), 1234);
        assert_eq!(m.last_status(), Some(RefreshJobStatus::Empty));

        // same entity comes back for the same view
        assert!(Arc::ptr_eq(&m, &registry.entity(1)));
    }
}
