//! Post-refresh metadata version bookkeeping.
//!
//! After a successful rebuild, and only then, the consumed base-table
//! partition versions are recorded into the view's refresh context under
//! the database write lock, with existence re-validation: the view may
//! have been concurrently dropped, in which case the update is abandoned
//! and surfaced rather than silently ignored.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::catalog::{BasePartitionInfo, RefreshSchemeChange, TableId};
use crate::error::{CinderError, Result};
use crate::exec::ExecutionReport;
use crate::refresh::executor::RefreshRun;
use crate::refresh::sync::SyncState;

impl RefreshRun<'_> {
    /// Record consumed partition versions and the view↔base partition
    /// association for the partitions touched this run.
    ///
    /// On a continuation run only the ref table's entries advance, so the
    /// follow-up run still observes the non-ref tables' changes. Emits
    /// exactly one edit-log record when any partition info changed.
    pub(crate) fn update_meta(
        &mut self,
        sync: &SyncState,
        refreshed: &BTreeSet<String>,
        ref_logical_partitions: &BTreeSet<String>,
        exec_report: &ExecutionReport,
    ) -> Result<()> {
        let has_next_batch = self.has_next_batch();

        // Per-table consumed partition names: the ref table's incremental
        // set plus every non-ref table's full visible set.
        let mut consumed: BTreeMap<TableId, BTreeSet<String>> = BTreeMap::new();
        for snapshot in sync.snapshots.values() {
            if Some(snapshot.info.id) == sync.ref_table_id {
                let reals: BTreeSet<String> = ref_logical_partitions
                    .iter()
                    .flat_map(|logical| sync.real_base_names(logical))
                    .collect();
                consumed.insert(snapshot.info.id, reals);
            } else {
                consumed.insert(snapshot.info.id, snapshot.table.visible_partition_names());
            }
        }

        let mut state = self.db.try_write_checked(self.config.lock_timeout)?;
        let mv_id = self.ctx.mv_id();
        let view = state.view_mut(mv_id).ok_or_else(|| {
            CinderError::concurrent_drop(format!(
                "update meta failed. materialized view: {} not exist",
                self.mv_name
            ))
        })?;

        // Association of refreshed view partitions to the real ref base
        // partitions they consumed.
        for mv_partition in refreshed {
            if let Some(logicals) = sync.mv_to_base.get(mv_partition) {
                let reals: BTreeSet<String> = logicals
                    .iter()
                    .flat_map(|logical| sync.real_base_names(logical))
                    .collect();
                view.refresh_context_mut()
                    .mv_to_base_partitions
                    .insert(mv_partition.clone(), reals);
            }
        }
        let visible = view.visible_partition_names();
        view.refresh_context_mut()
            .mv_to_base_partitions
            .retain(|name, _| visible.contains(name));

        let mut any_changed = false;
        let mut max_refresh_time = i64::MIN;
        for (table_id, names) in &consumed {
            if has_next_batch && Some(*table_id) != sync.ref_table_id {
                continue;
            }
            let snapshot = match sync.snapshots.get(table_id) {
                Some(s) => s,
                None => continue,
            };
            let mut infos: BTreeMap<String, BasePartitionInfo> = BTreeMap::new();
            for name in names {
                match snapshot.table.partition(name) {
                    Some(p) => {
                        infos.insert(name.clone(), BasePartitionInfo::of(snapshot.info.kind, p));
                    }
                    None => {
                        warn!(
                            mv = %self.mv_name, table = %snapshot.info.name, partition = %name,
                            "consumed partition missing from snapshot, skipping its version record"
                        );
                    }
                }
            }
            if infos.is_empty() {
                continue;
            }
            for info in infos.values() {
                max_refresh_time = max_refresh_time.max(info.version_time);
            }

            let versions = view
                .refresh_context_mut()
                .base_table_versions
                .entry(*table_id)
                .or_default();
            versions.extend(infos);
            // prune entries whose partitions no longer exist in the base
            // table's visible partition set
            let table_visible = snapshot.table.visible_partition_names();
            versions.retain(|name, _| table_visible.contains(name));
            any_changed = true;
        }

        if any_changed {
            view.refresh_context_mut().last_refresh_time = max_refresh_time;
            let record = RefreshSchemeChange {
                mv_id,
                mv_name: self.mv_name.clone(),
                last_refresh_time: max_refresh_time,
                refresh_context: view.refresh_context().clone(),
            };
            self.edit_log.log_refresh_scheme_change(&record)?;
            info!(
                mv = %self.mv_name,
                last_refresh_time = max_refresh_time,
                "updated refresh provenance"
            );
        }
        drop(state);

        self.report.plan_scanned_partitions = exec_report.scanned_partitions.clone();
        Ok(())
    }
}
