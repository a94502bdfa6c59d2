//! The retry-governed refresh driver.
//!
//! One `RefreshRun` is the unit of work the scheduler dispatches: it
//! stabilizes a snapshot, resolves the scope, hands the rebuild to the
//! execution engine, and commits provenance, all wrapped in a retry loop
//! with two independent budgets: one for lock-timeout failures and one
//! for everything else retryable.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{Database, EditLog, TableId};
use crate::config::RefreshConfig;
use crate::error::{truncate_message, CinderError, Result};
use crate::exec::{
    ContinuationRequest, ExecutionEngine, ExternalMetaProvider, RebuildStatement, TaskRunPriority,
    TaskScheduler,
};
use crate::refresh::context::{RunReport, TaskRunContext};
use crate::refresh::metrics::MvRefreshMetrics;
use crate::refresh::sync::SyncState;
use crate::refresh::RefreshJobStatus;

/// State of one refresh run. Not thread safe for concurrent runs of the
/// same materialized view; the manager's job registry serializes them.
pub(crate) struct RefreshRun<'a> {
    pub(crate) db: &'a Database,
    pub(crate) config: &'a RefreshConfig,
    pub(crate) engine: &'a dyn ExecutionEngine,
    pub(crate) scheduler: &'a dyn TaskScheduler,
    pub(crate) edit_log: &'a dyn EditLog,
    pub(crate) external_meta: Option<&'a dyn ExternalMetaProvider>,
    pub(crate) metrics: Arc<MvRefreshMetrics>,
    pub(crate) ctx: &'a TaskRunContext,
    pub(crate) mv_name: String,
    pub(crate) definition: String,
    pub(crate) resource_group: Option<String>,
    pub(crate) partition_refresh_number: i32,
    pub(crate) next_partition_start: Option<String>,
    pub(crate) next_partition_end: Option<String>,
    pub(crate) report: RunReport,
}

impl<'a> RefreshRun<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        db: &'a Database,
        config: &'a RefreshConfig,
        engine: &'a dyn ExecutionEngine,
        scheduler: &'a dyn TaskScheduler,
        edit_log: &'a dyn EditLog,
        external_meta: Option<&'a dyn ExternalMetaProvider>,
        metrics: Arc<MvRefreshMetrics>,
        ctx: &'a TaskRunContext,
    ) -> Self {
        Self {
            db,
            config,
            engine,
            scheduler,
            edit_log,
            external_meta,
            metrics,
            ctx,
            mv_name: String::new(),
            definition: String::new(),
            resource_group: None,
            partition_refresh_number: -1,
            next_partition_start: None,
            next_partition_end: None,
            report: RunReport::default(),
        }
    }

    /// Run the whole refresh: prepare, retry-governed execution, and the
    /// continuation run when the scope was truncated.
    pub(crate) fn execute(&mut self) -> Result<RefreshJobStatus> {
        self.prepare()?;
        let status = self.refresh_with_retry()?;

        self.report.next_partition_start = self.next_partition_start.clone();
        self.report.next_partition_end = self.next_partition_end.clone();
        // never generate a continuation for a killed run
        if self.has_next_batch() && !self.ctx.is_killed() {
            self.generate_continuation()?;
        }
        Ok(status)
    }

    pub(crate) fn has_next_batch(&self) -> bool {
        self.next_partition_start.is_some() || self.next_partition_end.is_some()
    }

    /// Resolve the view, attempting a best-effort reactivation of an
    /// inactive view before giving up on it.
    fn prepare(&mut self) -> Result<()> {
        let mv_id = self.ctx.mv_id();
        let (active, inactive_reason, base_ids) = {
            let state = self.db.try_read(self.config.lock_timeout)?;
            let view = state.view(mv_id).ok_or_else(|| {
                CinderError::catalog(format!(
                    "materialized view {} in database {} not exist",
                    mv_id,
                    self.db.name()
                ))
            })?;
            self.mv_name = view.name().to_string();
            self.definition = view.definition().to_string();
            self.resource_group = view.properties().resource_group.clone();
            self.partition_refresh_number = view.properties().partition_refresh_number;
            (
                view.is_active(),
                view.inactive_reason().map(str::to_string),
                view.base_table_ids().to_vec(),
            )
        };

        if !active {
            let reason = inactive_reason.unwrap_or_else(|| "unknown".to_string());
            self.try_activate(&base_ids, &reason)?;
        }

        self.report.force = self.ctx.is_force();
        self.report.partition_start = self.ctx.partition_start().map(str::to_string);
        self.report.partition_end = self.ctx.partition_end().map(str::to_string);
        Ok(())
    }

    /// Reactivate the view when every base table it depends on exists
    /// again; abort with the recorded reason otherwise.
    fn try_activate(&self, base_ids: &[TableId], reason: &str) -> Result<()> {
        let mut state = self.db.try_write(self.config.lock_timeout)?;
        if !base_ids.iter().all(|id| state.base_table(*id).is_some()) {
            return Err(CinderError::inactive_mv(reason));
        }
        let view = state.view_mut(self.ctx.mv_id()).ok_or_else(|| {
            CinderError::catalog(format!("materialized view {} not exist", self.mv_name))
        })?;
        view.activate();
        info!(mv = %self.mv_name, "activated the materialized view before refreshing");
        Ok(())
    }

    /// The dual-budget retry loop around one refresh attempt.
    ///
    /// Lock-timeout failures consume their own budget and never the
    /// general one; terminal kinds are surfaced immediately; when either
    /// budget runs out the last failure is surfaced, truncated for
    /// persistence.
    fn refresh_with_retry(&mut self) -> Result<RefreshJobStatus> {
        let max_general = self
            .config
            .max_refresh_failure_retry_times
            .max(self.ctx.max_retry_override().unwrap_or(1))
            .max(1);
        let max_lock = self.config.max_lock_retry_times.max(1);

        let mut lock_failed = 0u32;
        let mut general_failed = 0u32;
        let mut last_error: Option<CinderError> = None;
        while general_failed < max_general && lock_failed < max_lock {
            match self.do_refresh() {
                Ok(status) => return Ok(status),
                Err(e) if e.is_lock_timeout() => {
                    lock_failed += 1;
                    self.metrics.inc_lock_retry();
                    warn!(
                        mv = %self.mv_name, attempt = lock_failed,
                        "refresh failed because try lock failed: {e}"
                    );
                    last_error = Some(e);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    general_failed += 1;
                    self.metrics.inc_general_retry();
                    warn!(
                        mv = %self.mv_name, attempt = general_failed,
                        "refresh failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
            std::thread::sleep(self.config.retry_delay);
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Err(CinderError::execution(truncate_message(
            &format!(
                "Refresh materialized view {} failed after retrying {} times(try-lock {} times), error-msg : {}",
                self.mv_name, general_failed, lock_failed, last
            ),
            self.config.max_error_message_len,
        )))
    }

    /// One refresh attempt: stabilize, resolve scope, execute, commit.
    fn do_refresh(&mut self) -> Result<RefreshJobStatus> {
        // a failed earlier attempt must not leak its continuation window
        self.next_partition_start = None;
        self.next_partition_end = None;

        let sync = self.sync_and_check_partitions()?;

        let to_refresh = self.check_to_refresh_partitions(&sync)?;
        if to_refresh.is_empty() {
            return Ok(RefreshJobStatus::Empty);
        }

        // the ref base partitions this scope consumes, in logical names
        let mut ref_logical: BTreeSet<String> = BTreeSet::new();
        for mv_partition in &to_refresh {
            if let Some(bases) = sync.mv_to_base.get(mv_partition) {
                ref_logical.extend(bases.iter().cloned());
            }
        }

        self.report.mv_partitions_refreshed = to_refresh.clone();
        if let Some(ref_snapshot) = sync.ref_snapshot() {
            let reals: BTreeSet<String> = ref_logical
                .iter()
                .flat_map(|logical| sync.real_base_names(logical))
                .collect();
            self.report.ref_base_partitions =
                BTreeMap::from([(ref_snapshot.info.name.clone(), reals)]);
        }

        if self.ctx.is_killed() {
            warn!(mv = %self.mv_name, "refresh is killed");
            return Err(CinderError::Cancelled);
        }

        let statement = self.build_rebuild_statement(&sync, &to_refresh);
        debug!(
            mv = %self.mv_name,
            query_id = %statement.query_id,
            targets = ?statement.target_partitions,
            sources = ?statement.source_partitions,
            "executing rebuild plan"
        );
        let exec_report = self.engine.execute(&statement)?;

        self.update_meta(&sync, &to_refresh, &ref_logical, &exec_report)?;
        Ok(RefreshJobStatus::Success)
    }

    /// Build the insert-overwrite rebuild statement scoped to the
    /// resolved target partitions.
    fn build_rebuild_statement(
        &self,
        sync: &SyncState,
        to_refresh: &BTreeSet<String>,
    ) -> RebuildStatement {
        let mut source_partitions = BTreeMap::new();
        if let Some(ref_snapshot) = sync.ref_snapshot() {
            if let Some(partitions) = self.report.ref_base_partitions.get(&ref_snapshot.info.name)
            {
                source_partitions.insert(ref_snapshot.info.name.clone(), partitions.clone());
            }
        }
        RebuildStatement {
            query_id: Uuid::new_v4(),
            mv_name: self.mv_name.clone(),
            definition: self.definition.clone(),
            target_partitions: to_refresh.clone(),
            source_partitions,
            resource_group: self.resource_group.clone(),
        }
    }

    /// Hand the remainder of a truncated scope to the scheduler as a
    /// highest-priority follow-up run, so a started round of partition
    /// refreshing cannot be starved.
    fn generate_continuation(&mut self) -> Result<()> {
        let request = ContinuationRequest {
            mv_id: self.ctx.mv_id(),
            next_partition_start: self.next_partition_start.clone(),
            next_partition_end: self.next_partition_end.clone(),
            priority: TaskRunPriority::Highest,
        };
        self.scheduler.schedule_continuation(request)?;
        info!(
            mv = %self.mv_name,
            start = ?self.next_partition_start,
            end = ?self.next_partition_end,
            "generated a task run to refresh the next partition batch"
        );
        Ok(())
    }
}
