//! The partition-based materialized view refresh orchestrator.
//!
//! One scheduled task run flows through here: stabilize a snapshot of the
//! base tables, reconcile the view's partition catalog with the ref base
//! table, resolve exactly which view partitions are stale, execute a
//! bounded retryable rebuild of only those partitions, and atomically
//! record which base-table partition versions were consumed so the next
//! run's staleness check is correct.

mod context;
mod executor;
mod meta;
mod metrics;
mod scope;
mod sync;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

pub use context::{
    RunReport, TaskRunContext, TaskType, PROP_FORCE, PROP_MV_ID, PROP_PARTITION_END,
    PROP_PARTITION_START,
};
pub use metrics::{MetricsRegistry, MvRefreshMetrics};

use crate::catalog::{Database, EditLog, TableId};
use crate::config::RefreshConfig;
use crate::error::{truncate_message, CinderError, Result};
use crate::exec::{ExecutionEngine, ExternalMetaProvider, TaskScheduler};
use executor::RefreshRun;

/// Terminal outcome of one refresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshJobStatus {
    /// The rebuild executed and provenance was committed.
    Success,
    /// The run failed after exhausting its retry budgets, or on a
    /// terminal error.
    Failed,
    /// Nothing was stale; no rebuild was executed.
    Empty,
}

impl fmt::Display for RefreshJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshJobStatus::Success => write!(f, "SUCCESS"),
            RefreshJobStatus::Failed => write!(f, "FAILED"),
            RefreshJobStatus::Empty => write!(f, "EMPTY"),
        }
    }
}

/// Registry entry for one view's refresh job.
#[derive(Debug, Clone, Default)]
pub struct JobState {
    /// Whether a run is currently executing.
    pub running: bool,
    /// Terminal status of the last finished run.
    pub last_status: Option<RefreshJobStatus>,
    /// Truncated message of the last terminal error.
    pub last_error: Option<String>,
    /// What the last finished run did.
    pub last_report: Option<RunReport>,
}

/// The refresh orchestrator: owns the job registry and drives one run per
/// invocation.
///
/// Constructed once at process start and passed by reference to callers;
/// at most one run executes concurrently per materialized view, enforced
/// by the registry.
pub struct RefreshManager {
    database: Arc<Database>,
    engine: Arc<dyn ExecutionEngine>,
    scheduler: Arc<dyn TaskScheduler>,
    edit_log: Arc<dyn EditLog>,
    external_meta: Option<Arc<dyn ExternalMetaProvider>>,
    config: RefreshConfig,
    jobs: RwLock<HashMap<TableId, JobState>>,
    metrics: MetricsRegistry,
}

impl RefreshManager {
    /// Create a manager over a database and its collaborators.
    pub fn new(
        database: Arc<Database>,
        engine: Arc<dyn ExecutionEngine>,
        scheduler: Arc<dyn TaskScheduler>,
        edit_log: Arc<dyn EditLog>,
    ) -> Self {
        Self {
            database,
            engine,
            scheduler,
            edit_log,
            external_meta: None,
            config: RefreshConfig::default(),
            jobs: RwLock::new(HashMap::new()),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Override the default configuration.
    pub fn with_config(mut self, config: RefreshConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a metadata provider for external base tables.
    pub fn with_external_meta_provider(mut self, provider: Arc<dyn ExternalMetaProvider>) -> Self {
        self.external_meta = Some(provider);
        self
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Execute one refresh run for the context's materialized view.
    ///
    /// Idempotent on retry: metadata is committed only after a fully
    /// successful rebuild, so re-invoking after a failure never leaves
    /// the view in a state requiring manual repair.
    pub fn run(&self, ctx: &TaskRunContext) -> Result<RefreshJobStatus> {
        let mv_id = ctx.mv_id();
        {
            let mut jobs = self.jobs.write();
            let job = jobs.entry(mv_id).or_default();
            if job.running {
                return Err(CinderError::invalid_argument(format!(
                    "refresh is already running for materialized view {}",
                    mv_id
                )));
            }
            job.running = true;
        }

        let metrics = self.metrics.entity(mv_id);
        let started = Instant::now();
        let mut run = RefreshRun::new(
            self.database.as_ref(),
            &self.config,
            self.engine.as_ref(),
            self.scheduler.as_ref(),
            self.edit_log.as_ref(),
            self.external_meta.as_deref(),
            metrics.clone(),
            ctx,
        );
        let result = run.execute();

        metrics.record_duration_ms(started.elapsed().as_millis() as u64);
        let status = match &result {
            Ok(status) => *status,
            Err(_) => RefreshJobStatus::Failed,
        };
        metrics.record_status(status);

        let mut jobs = self.jobs.write();
        let job = jobs.entry(mv_id).or_default();
        job.running = false;
        job.last_status = Some(status);
        job.last_error = result
            .as_ref()
            .err()
            .map(|e| truncate_message(&e.to_string(), self.config.max_error_message_len));
        job.last_report = Some(run.report.clone());

        result
    }

    /// Whether a run is currently executing for the view.
    pub fn is_running(&self, mv_id: TableId) -> bool {
        self.jobs
            .read()
            .get(&mv_id)
            .map(|j| j.running)
            .unwrap_or(false)
    }

    /// The registry entry for the view's job, if any run was started.
    pub fn job_state(&self, mv_id: TableId) -> Option<JobState> {
        self.jobs.read().get(&mv_id).cloned()
    }

    /// The refresh metrics entity for the view.
    pub fn metrics(&self, mv_id: TableId) -> Arc<MvRefreshMetrics> {
        self.metrics.entity(mv_id)
    }
}
