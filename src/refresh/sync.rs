//! Base-table snapshotting and partition synchronization.
//!
//! Each refresh attempt stabilizes a view of the base tables before any
//! scope decision: take point-in-time snapshots under a bounded-wait read
//! lock, reconcile the view's partition catalog with the ref base table,
//! then verify (outside any lock) that no base table's partition layout
//! moved in the meantime. Holding the lock across the whole metadata sweep
//! would be prohibitive for large external catalogs, so optimistic
//! verification replaces it; an unstable layout retries the whole cycle.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::catalog::{BaseTable, BaseTableInfo, PartitionScheme, TableId, TableKind};
use crate::error::{CinderError, Result};
use crate::partition::{
    apply_diff, diff_range_maps, has_partition_change, intersected_partitions, PartitionKeyRange,
    RangeMap,
};
use crate::refresh::executor::RefreshRun;

/// A point-in-time copy of one base table, owned by the run.
#[derive(Debug, Clone)]
pub(crate) struct BaseTableSnapshot {
    pub info: BaseTableInfo,
    pub table: BaseTable,
}

/// The stabilized outcome of one snapshot-and-sync cycle.
#[derive(Debug, Default)]
pub(crate) struct SyncState {
    /// Snapshots of every base table, keyed by table id. Views are
    /// skipped.
    pub snapshots: BTreeMap<TableId, BaseTableSnapshot>,
    /// The partition-determining base table, for range-partitioned views.
    pub ref_table_id: Option<TableId>,
    /// TTL window captured from the view's properties.
    pub ttl_number: i32,
    /// Ref base partition name → overlapping view partition names.
    pub base_to_mv: BTreeMap<String, BTreeSet<String>>,
    /// View partition name → overlapping ref base partition names.
    pub mv_to_base: BTreeMap<String, BTreeSet<String>>,
    /// The ref base table's logical partition ranges.
    pub ref_base_range_map: RangeMap,
    /// Logical ref partition name → real partition names (external
    /// tables can hold several real partitions per logical range).
    pub logical_to_real: BTreeMap<String, BTreeSet<String>>,
    /// Inverse of `logical_to_real`.
    pub real_to_logical: BTreeMap<String, String>,
}

impl SyncState {
    pub(crate) fn ref_snapshot(&self) -> Option<&BaseTableSnapshot> {
        self.ref_table_id.and_then(|id| self.snapshots.get(&id))
    }

    /// Convert a logical ref partition name to the real partition names
    /// behind it.
    pub(crate) fn real_base_names(&self, logical: &str) -> BTreeSet<String> {
        self.logical_to_real
            .get(logical)
            .cloned()
            .unwrap_or_else(|| BTreeSet::from([logical.to_string()]))
    }
}

impl RefreshRun<'_> {
    /// Stabilize the base-table view: snapshot, sync partitions, verify,
    /// and retry the whole cycle while the layout keeps moving.
    pub(crate) fn sync_and_check_partitions(&mut self) -> Result<SyncState> {
        let max_attempts = self.config.max_snapshot_verify_attempts;
        for attempt in 1..=max_attempts {
            self.metrics.inc_snapshot_sync();
            self.refresh_external_tables()?;

            // sync outside the lock: it is a time-cost operation
            let sync = match self.sync_partitions() {
                Ok(sync) => sync,
                Err(e) if !e.is_retryable() || e.is_lock_timeout() => return Err(e),
                Err(e) => {
                    warn!(
                        mv = %self.mv_name, attempt,
                        "partition sync failed, leaving view partitions unchanged: {e}"
                    );
                    std::thread::sleep(self.config.snapshot_retry_delay);
                    continue;
                }
            };

            if self.check_base_table_partition_change(&sync)? {
                info!(
                    mv = %self.mv_name, attempt,
                    "base partitions changed during sync, retrying"
                );
                std::thread::sleep(self.config.snapshot_retry_delay);
                continue;
            }
            return Ok(sync);
        }
        Err(CinderError::unstable_partition_layout(format!(
            "base table partitions of materialized view {} kept changing after {} attempts",
            self.mv_name, max_attempts
        )))
    }

    /// Re-validate base tables and refresh external metadata caches
    /// before snapshotting.
    fn refresh_external_tables(&mut self) -> Result<()> {
        let mut missing: Option<TableId> = None;
        let externals: Vec<TableId> = {
            let state = self.db.try_read(self.config.lock_timeout)?;
            let view = state.view(self.ctx.mv_id()).ok_or_else(|| {
                CinderError::concurrent_drop(format!(
                    "materialized view {} not exist",
                    self.mv_name
                ))
            })?;
            let mut externals = Vec::new();
            for id in view.base_table_ids() {
                match state.base_table(*id) {
                    Some(t) if t.kind() == TableKind::External => externals.push(*id),
                    Some(_) => {}
                    None => {
                        missing = Some(*id);
                        break;
                    }
                }
            }
            externals
        };

        if let Some(id) = missing {
            // a dropped base table breaks the dependency for good
            self.set_view_inactive(&format!("base table {} does not exist", id))?;
            return Err(CinderError::concurrent_drop(format!(
                "materialized view base table {} not exist",
                id
            )));
        }

        if let Some(provider) = self.external_meta {
            for id in externals {
                // a stale cache is retried like any enumeration failure
                provider.refresh_cache(id).map_err(|e| {
                    CinderError::execution(format!(
                        "refresh external table {} metadata failed: {}",
                        id, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn set_view_inactive(&self, reason: &str) -> Result<()> {
        let mut state = self.db.try_write(self.config.lock_timeout)?;
        if let Some(view) = state.view_mut(self.ctx.mv_id()) {
            view.set_inactive(reason);
        }
        Ok(())
    }

    /// Snapshot the base tables and reconcile the view's partition
    /// catalog with the ref base table.
    fn sync_partitions(&mut self) -> Result<SyncState> {
        let mut sync = SyncState::default();

        let scheme = {
            let state = self.db.try_read(self.config.lock_timeout)?;
            let view = state.view(self.ctx.mv_id()).ok_or_else(|| {
                CinderError::concurrent_drop(format!(
                    "materialized view {} not exist",
                    self.mv_name
                ))
            })?;
            sync.ttl_number = view.properties().partition_ttl_number;

            for id in view.base_table_ids() {
                let table = state.base_table(*id).ok_or_else(|| {
                    CinderError::concurrent_drop(format!(
                        "materialized view base table {} not exist",
                        id
                    ))
                })?;
                if table.kind() == TableKind::View {
                    continue;
                }
                sync.snapshots.insert(
                    *id,
                    BaseTableSnapshot {
                        info: table.info(),
                        table: table.clone(),
                    },
                );
            }
            view.partition_scheme().clone()
        };

        if let PartitionScheme::RangePartitioned {
            ref_table,
            transform,
            ..
        } = &scheme
        {
            sync.ref_table_id = Some(*ref_table);
            let snapshot = sync.snapshots.get(ref_table).ok_or_else(|| {
                CinderError::analysis(format!(
                    "ref base table {} of materialized view {} is not snapshotable",
                    ref_table, self.mv_name
                ))
            })?;

            let (base_ranges, logical_to_real) = snapshot.table.logical_range_map();
            let target = transform.apply(&base_ranges)?;

            let mv_ranges = {
                let state = self.db.try_read(self.config.lock_timeout)?;
                let view = state.view(self.ctx.mv_id()).ok_or_else(|| {
                    CinderError::concurrent_drop(format!(
                        "materialized view {} not exist",
                        self.mv_name
                    ))
                })?;
                view.range_partition_map()
            };

            let diff = diff_range_maps(&mv_ranges, &target, sync.ttl_number);

            // Drop before add: a deleted range's key space may be reused
            // by a differently-bounded add.
            for name in diff.deletes.keys() {
                self.db
                    .drop_view_partition(self.ctx.mv_id(), name, self.config.lock_timeout)?;
            }
            if !diff.deletes.is_empty() {
                info!(
                    mv = %self.mv_name,
                    deleted = diff.deletes.len(),
                    "synchronized view partitions: dropped stale ranges"
                );
            }

            let adds: Vec<(String, PartitionKeyRange)> = diff
                .adds
                .iter()
                .map(|(name, range)| (name.clone(), range.clone()))
                .collect();
            let batch_size = self.config.create_partition_batch_size;
            for (i, batch) in adds.chunks(batch_size).enumerate() {
                if i > 0 {
                    std::thread::sleep(self.config.partition_batch_interval);
                }
                self.db
                    .add_view_partitions(self.ctx.mv_id(), batch, self.config.lock_timeout)?;
            }
            if !adds.is_empty() {
                info!(
                    mv = %self.mv_name,
                    added = adds.len(),
                    "synchronized view partitions: created missing ranges"
                );
            }

            let mut updated_mv_ranges = mv_ranges;
            apply_diff(&mut updated_mv_ranges, &diff);

            sync.base_to_mv = intersected_partitions(&base_ranges, &updated_mv_ranges);
            sync.mv_to_base = intersected_partitions(&updated_mv_ranges, &base_ranges);
            sync.ref_base_range_map = base_ranges;
            for (logical, reals) in &logical_to_real {
                for real in reals {
                    sync.real_to_logical.insert(real.clone(), logical.clone());
                }
            }
            sync.logical_to_real = logical_to_real;
        }

        Ok(sync)
    }

    /// Verify, after lock release, that no base table's partition layout
    /// changed since the snapshot was taken.
    fn check_base_table_partition_change(&self, sync: &SyncState) -> Result<bool> {
        let state = self.db.try_read(self.config.lock_timeout)?;
        for snapshot in sync.snapshots.values() {
            let current = match state.base_table(snapshot.info.id) {
                Some(t) => t,
                // dropped mid-sweep counts as a layout change
                None => return Ok(true),
            };
            let changed = match snapshot.info.kind {
                TableKind::Native => {
                    let snap_ranges = snapshot.table.range_partition_map();
                    if snap_ranges.is_empty() {
                        // unpartitioned: a rename still shows up in the name set
                        snapshot.table.visible_partition_names()
                            != current.visible_partition_names()
                    } else {
                        has_partition_change(&snap_ranges, &current.range_partition_map())
                    }
                }
                TableKind::External => {
                    if Some(snapshot.info.id) == sync.ref_table_id {
                        let (snap_ranges, _) = snapshot.table.logical_range_map();
                        let (cur_ranges, _) = current.logical_range_map();
                        has_partition_change(&snap_ranges, &cur_ranges)
                    } else {
                        // non-ref external tables are tracked by modified
                        // time, not layout
                        false
                    }
                }
                TableKind::View => false,
            };
            if changed {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
