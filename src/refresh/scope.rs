//! Refresh scope resolution: which view partitions this run rebuilds.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::catalog::{MaterializedView, PartitionScheme};
use crate::error::{CinderError, Result};
use crate::partition::{
    expand_potential_refresh, sorted_by_range, PartitionKey, PartitionValue, RangeMap,
};
use crate::refresh::executor::RefreshRun;
use crate::refresh::sync::SyncState;

impl RefreshRun<'_> {
    /// Resolve the final partition set to rebuild, under the database
    /// read lock, and truncate it to the per-run refresh cap.
    pub(crate) fn check_to_refresh_partitions(
        &mut self,
        sync: &SyncState,
    ) -> Result<BTreeSet<String>> {
        let (mut to_refresh, view_ranges) = {
            let state = self.db.try_read(self.config.lock_timeout)?;
            let view = state.view(self.ctx.mv_id()).ok_or_else(|| {
                CinderError::concurrent_drop(format!(
                    "materialized view {} not exist",
                    self.mv_name
                ))
            })?;
            let set = self.partitions_to_refresh(view, sync)?;
            (set, view.range_partition_map())
        };

        if to_refresh.is_empty() {
            info!(mv = %self.mv_name, "no partitions to refresh");
            return Ok(to_refresh);
        }

        self.filter_by_refresh_number(&view_ranges, &mut to_refresh);
        info!(mv = %self.mv_name, partitions = ?to_refresh, "partitions to refresh");
        Ok(to_refresh)
    }

    /// The decision table: first matching rule wins.
    fn partitions_to_refresh(
        &self,
        view: &MaterializedView,
        sync: &SyncState,
    ) -> Result<BTreeSet<String>> {
        let force = self.ctx.is_force();
        let start = self.ctx.partition_start();
        let end = self.ctx.partition_end();
        let ttl_number = sync.ttl_number;

        // Force refresh without an explicit window ignores change
        // detection entirely.
        if force && start.is_none() && end.is_none() {
            return Ok(match view.partition_scheme() {
                PartitionScheme::Unpartitioned => view.visible_partition_names(),
                PartitionScheme::RangePartitioned { .. } => {
                    view.valid_partition_map(ttl_number).keys().cloned().collect()
                }
            });
        }

        match view.partition_scheme() {
            PartitionScheme::Unpartitioned => {
                if force || self.unpartitioned_needs_refresh(view, sync) {
                    Ok(view.visible_partition_names())
                } else {
                    Ok(BTreeSet::new())
                }
            }
            PartitionScheme::RangePartitioned { .. } => {
                let windowed = self.windowed_partition_map(view, sync)?;

                // A non-ref base table touches all view partitions
                // equally, so without an explicit window everything in
                // the TTL window is stale.
                if self.non_ref_tables_need_refresh(view, sync) && start.is_none() && end.is_none()
                {
                    return Ok(windowed.keys().cloned().collect());
                }

                self.ref_changed_partitions(view, sync, &windowed, force)
            }
        }
    }

    /// An unpartitioned view refreshes when any base table cannot be
    /// tracked per-partition or has updated partitions.
    fn unpartitioned_needs_refresh(&self, view: &MaterializedView, sync: &SyncState) -> bool {
        sync.snapshots.values().any(|snapshot| {
            !snapshot.table.supports_partition_refresh()
                || !view.updated_partition_names(&snapshot.table).is_empty()
        })
    }

    /// Whether any base table other than the ref table has updated
    /// partitions. Tables that cannot be tracked per-partition are
    /// skipped here; they are the ref table's concern only for
    /// unpartitioned views.
    fn non_ref_tables_need_refresh(&self, view: &MaterializedView, sync: &SyncState) -> bool {
        sync.snapshots
            .values()
            .filter(|s| Some(s.info.id) != sync.ref_table_id)
            .filter(|s| s.table.supports_partition_refresh())
            .any(|s| !view.updated_partition_names(&s.table).is_empty())
    }

    /// The TTL-windowed, `[start, end)`-bounded candidate partition map.
    fn windowed_partition_map(
        &self,
        view: &MaterializedView,
        sync: &SyncState,
    ) -> Result<RangeMap> {
        let mut window = view.valid_partition_map(sync.ttl_number);

        let auto_limit = view.properties().auto_refresh_partitions_limit;
        if self.ctx.task_type().is_auto_refresh()
            && auto_limit > 0
            && window.len() > auto_limit as usize
        {
            window = sorted_by_range(&window)
                .into_iter()
                .rev()
                .take(auto_limit as usize)
                .map(|(name, range)| (name.clone(), range.clone()))
                .collect();
        }

        let start_key = self.ctx.partition_start().map(parse_bound);
        let end_key = self.ctx.partition_end().map(parse_bound);
        if start_key.is_some() || end_key.is_some() {
            window.retain(|_, range| {
                let after_start = start_key
                    .as_ref()
                    .map(|k| range.upper() > k)
                    .unwrap_or(true);
                let before_end = end_key.as_ref().map(|k| range.lower() < k).unwrap_or(true);
                after_start && before_end
            });
        }
        Ok(window)
    }

    /// Candidate partitions whose ref base partitions changed since the
    /// last recorded versions, expanded to the fixed point over the
    /// intersection maps.
    fn ref_changed_partitions(
        &self,
        view: &MaterializedView,
        sync: &SyncState,
        windowed: &RangeMap,
        force: bool,
    ) -> Result<BTreeSet<String>> {
        let ref_snapshot = sync.ref_snapshot().ok_or_else(|| {
            CinderError::internal(format!(
                "range-partitioned materialized view {} has no ref table snapshot",
                self.mv_name
            ))
        })?;

        if force || !ref_snapshot.table.supports_partition_refresh() {
            return Ok(windowed.keys().cloned().collect());
        }

        let updated_real = view.updated_partition_names(&ref_snapshot.table);
        let updated_logical: BTreeSet<String> = updated_real
            .iter()
            .map(|real| {
                sync.real_to_logical
                    .get(real)
                    .cloned()
                    .unwrap_or_else(|| real.clone())
            })
            .collect();

        let mut result = BTreeSet::new();
        for base in &updated_logical {
            match sync.base_to_mv.get(base) {
                Some(mvs) => result.extend(mvs.iter().cloned()),
                None => {
                    warn!(
                        mv = %self.mv_name, base_partition = %base,
                        "updated ref base partition missing from synced intersection map"
                    );
                }
            }
        }
        result.retain(|name| windowed.contains_key(name));

        // The relation between view and base partitions can be n:m under
        // an expression transform; expand to the fixed point so sibling
        // partitions sharing a changed base partition are rebuilt too.
        let is_many_to_many = matches!(
            view.partition_scheme(),
            PartitionScheme::RangePartitioned { transform, .. } if transform.is_many_to_many()
        );
        if is_many_to_many {
            let mut base_changed = BTreeSet::new();
            for mv_name in &result {
                if let Some(bases) = sync.mv_to_base.get(mv_name) {
                    base_changed.extend(bases.iter().cloned());
                }
            }
            expand_potential_refresh(
                &mut result,
                &mut base_changed,
                &sync.base_to_mv,
                &sync.mv_to_base,
            );
        }
        Ok(result)
    }

    /// Truncate the scope to the per-run refresh cap, keeping a
    /// deterministic sorted-by-range prefix and recording the
    /// continuation window for the remainder.
    fn filter_by_refresh_number(&mut self, view_ranges: &RangeMap, to_refresh: &mut BTreeSet<String>) {
        let refresh_number = self.partition_refresh_number;
        if refresh_number <= 0 || refresh_number as usize >= view_ranges.len() {
            return;
        }

        let selected: RangeMap = to_refresh
            .iter()
            .filter_map(|name| {
                view_ranges
                    .get(name)
                    .map(|range| (name.clone(), range.clone()))
            })
            .collect();
        if selected.len() <= refresh_number as usize {
            return;
        }

        let remainder: Vec<(String, crate::partition::PartitionKeyRange)> =
            sorted_by_range(&selected)
                .into_iter()
                .skip(refresh_number as usize)
                .map(|(name, range)| (name.clone(), range.clone()))
                .collect();
        for (name, _) in &remainder {
            to_refresh.remove(name);
        }

        let next_start = remainder
            .first()
            .map(|(_, range)| bound_literal(range.lower()));
        let next_end = remainder
            .last()
            .map(|(_, range)| bound_literal(range.upper()));
        info!(
            mv = %self.mv_name,
            kept = to_refresh.len(),
            deferred = remainder.len(),
            next_start = ?next_start,
            next_end = ?next_end,
            "refresh scope exceeds per-run cap, deferring remainder"
        );
        self.next_partition_start = next_start;
        self.next_partition_end = next_end;
    }
}

fn parse_bound(literal: &str) -> PartitionKey {
    PartitionKey::single(PartitionValue::parse(literal))
}

/// Render a partition bound as the string literal carried by run
/// parameters and continuation markers.
fn bound_literal(key: &PartitionKey) -> String {
    key.values()
        .first()
        .map(|v| v.to_string())
        .unwrap_or_default()
}
