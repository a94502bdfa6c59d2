//! External collaborator interfaces.
//!
//! The orchestrator treats query execution, task scheduling, and external
//! metastores as black boxes behind these narrow traits: it builds a
//! rebuild statement, hands it to the engine, and consumes a pass/fail
//! outcome plus the partitions the plan actually scanned.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::catalog::TableId;
use crate::error::Result;

/// A logical insert-overwrite rebuild scoped to a set of target
/// partitions.
#[derive(Debug, Clone)]
pub struct RebuildStatement {
    /// Query id for tracing the rebuild.
    pub query_id: Uuid,
    /// Name of the materialized view being rebuilt.
    pub mv_name: String,
    /// The view's defining query.
    pub definition: String,
    /// View partitions to overwrite.
    pub target_partitions: BTreeSet<String>,
    /// Base-table partitions the rebuild should read, by table name.
    pub source_partitions: BTreeMap<String, BTreeSet<String>>,
    /// Resource group the plan executes under, if any.
    pub resource_group: Option<String>,
}

/// Outcome of a successful rebuild execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Base-table partitions the executed plan actually scanned,
    /// by table id.
    pub scanned_partitions: BTreeMap<TableId, BTreeSet<String>>,
}

/// The query execution engine: plans and executes a rebuild statement.
pub trait ExecutionEngine: Send + Sync {
    fn execute(&self, statement: &RebuildStatement) -> Result<ExecutionReport>;
}

/// Priority of a scheduled task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskRunPriority {
    Lowest,
    Normal,
    High,
    /// Continuation runs use the highest priority so a started round of
    /// partition refreshing cannot be starved by other tasks.
    Highest,
}

/// A follow-up run covering the remainder of a truncated refresh scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationRequest {
    pub mv_id: TableId,
    pub next_partition_start: Option<String>,
    pub next_partition_end: Option<String>,
    pub priority: TaskRunPriority,
}

/// The external task scheduler the orchestrator hands continuation runs
/// to.
pub trait TaskScheduler: Send + Sync {
    fn schedule_continuation(&self, request: ContinuationRequest) -> Result<()>;
}

/// Metadata provider for external base tables.
///
/// Partition names, ranges, and modified times are read from the catalog's
/// table entry, which this provider keeps current: `refresh_cache` is
/// invoked before every snapshot attempt so the entry reflects the
/// external source.
pub trait ExternalMetaProvider: Send + Sync {
    fn refresh_cache(&self, table_id: TableId) -> Result<()>;
}
