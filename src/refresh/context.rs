//! Per-run parameters and the run report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::catalog::TableId;

/// Property key carrying the materialized view id of a task.
pub const PROP_MV_ID: &str = "mv_id";
/// Property key carrying the refresh window start bound.
pub const PROP_PARTITION_START: &str = "partition_start";
/// Property key carrying the refresh window end bound.
pub const PROP_PARTITION_END: &str = "partition_end";
/// Property key carrying the force flag.
pub const PROP_FORCE: &str = "force";

/// How a task run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Explicit `REFRESH MATERIALIZED VIEW` or a continuation run.
    Manual,
    /// Scheduled periodic refresh.
    Periodic,
}

impl TaskType {
    /// Whether the auto-refresh partition limit applies to this run.
    pub fn is_auto_refresh(&self) -> bool {
        matches!(self, TaskType::Periodic)
    }
}

/// Parameters of one refresh task run; lifetime is one run.
#[derive(Debug, Clone)]
pub struct TaskRunContext {
    mv_id: TableId,
    partition_start: Option<String>,
    partition_end: Option<String>,
    force: bool,
    task_type: TaskType,
    max_retry_override: Option<u32>,
    properties: BTreeMap<String, String>,
    kill_flag: Arc<AtomicBool>,
}

impl TaskRunContext {
    /// Create a run context for a view.
    pub fn new(mv_id: TableId) -> Self {
        Self {
            mv_id,
            partition_start: None,
            partition_end: None,
            force: false,
            task_type: TaskType::Manual,
            max_retry_override: None,
            properties: BTreeMap::new(),
            kill_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a run context from a task property bag, as the scheduler
    /// hands continuation runs back.
    pub fn from_properties(mv_id: TableId, properties: &BTreeMap<String, String>) -> Self {
        let mut ctx = Self::new(mv_id);
        ctx.partition_start = properties.get(PROP_PARTITION_START).cloned();
        ctx.partition_end = properties.get(PROP_PARTITION_END).cloned();
        ctx.force = properties
            .get(PROP_FORCE)
            .map(|v| v == "true")
            .unwrap_or(false);
        ctx.properties = properties.clone();
        ctx
    }

    /// Bound the refresh window to `[start, end)`.
    pub fn with_partition_range(
        mut self,
        start: Option<impl Into<String>>,
        end: Option<impl Into<String>>,
    ) -> Self {
        self.partition_start = start.map(Into::into);
        self.partition_end = end.map(Into::into);
        self
    }

    /// Refresh regardless of change detection.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    /// Session-requested general-failure retry maximum; the executor uses
    /// the larger of this and the configured minimum.
    pub fn with_max_retry_override(mut self, max_retries: u32) -> Self {
        self.max_retry_override = Some(max_retries);
        self
    }

    /// Attach an opaque property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn mv_id(&self) -> TableId {
        self.mv_id
    }

    pub fn partition_start(&self) -> Option<&str> {
        self.partition_start.as_deref()
    }

    pub fn partition_end(&self) -> Option<&str> {
        self.partition_end.as_deref()
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn max_retry_override(&self) -> Option<u32> {
        self.max_retry_override
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Shared kill flag; the run checks it before executing the rebuild
    /// plan and before scheduling a continuation.
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        self.kill_flag.clone()
    }

    /// Request cancellation of the run.
    pub fn kill(&self) {
        self.kill_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.kill_flag.load(Ordering::SeqCst)
    }
}

/// What one run did, for status queries and tracing.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub force: bool,
    pub partition_start: Option<String>,
    pub partition_end: Option<String>,
    /// View partitions this run rebuilt.
    pub mv_partitions_refreshed: BTreeSet<String>,
    /// Ref base-table partitions consumed, by base table name.
    pub ref_base_partitions: BTreeMap<String, BTreeSet<String>>,
    /// Base-table partitions the executed plan reported scanning.
    pub plan_scanned_partitions: BTreeMap<TableId, BTreeSet<String>>,
    /// Continuation window when the scope was truncated.
    pub next_partition_start: Option<String>,
    pub next_partition_end: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_properties() {
        let mut props = BTreeMap::new();
        props.insert(PROP_PARTITION_START.to_string(), "2024-01-03".to_string());
        props.insert(PROP_PARTITION_END.to_string(), "2024-01-05".to_string());
        props.insert(PROP_FORCE.to_string(), "true".to_string());

        let ctx = TaskRunContext::from_properties(7, &props);
        assert_eq!(ctx.mv_id(), 7);
        assert_eq!(ctx.partition_start(), Some("2024-01-03"));
        assert_eq!(ctx.partition_end(), Some("2024-01-05"));
        assert!(ctx.is_force());
    }

    #[test]
    fn test_kill_flag_is_shared() {
        let ctx = TaskRunContext::new(1);
        let flag = ctx.kill_flag();
        assert!(!ctx.is_killed());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_killed());
    }
}
