//! Cinder - Incremental Refresh Orchestrator for Materialized Views
//!
//! Cinder keeps partitioned materialized views consistent with their base
//! tables inside a distributed analytical database, without re-computing
//! the whole view on every change. Given base tables that are natively
//! versioned or externally sourced, it decides exactly which view
//! partitions are stale, reconciles the view's partition set with the
//! partition-determining base table, executes a bounded retryable rebuild
//! of only the stale partitions, and atomically records the consumed
//! base-table partition versions.
//!
//! # Features
//!
//! - **Partition-range diffing**: reconcile a view's partition catalog
//!   with its ref base table by key-range comparison, bounded by a
//!   retention window
//! - **Staleness resolution**: force/windowed/changed-partition refresh
//!   scopes, expanded to a fixed point over many-to-many partition
//!   associations
//! - **Optimistic snapshots**: point-in-time base table copies verified
//!   against concurrent partition layout changes instead of long-held
//!   locks
//! - **Dual retry budgets**: lock-timeout failures retried separately
//!   from general failures
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cinder::catalog::{Database, MemoryEditLog};
//! use cinder::exec::{ExecutionEngine, TaskScheduler};
//! use cinder::refresh::{RefreshManager, TaskRunContext};
//!
//! fn main() -> cinder::Result<()> {
//!     # fn engine() -> Arc<dyn ExecutionEngine> { unimplemented!() }
//!     # fn scheduler() -> Arc<dyn TaskScheduler> { unimplemented!() }
//!     let database = Arc::new(Database::new("analytics"));
//!     let manager = RefreshManager::new(
//!         database,
//!         engine(),      // the query execution engine
//!         scheduler(),   // the task scheduler
//!         Arc::new(MemoryEditLog::new()),
//!     );
//!
//!     // one scheduled task run for materialized view 42
//!     let status = manager.run(&TaskRunContext::new(42))?;
//!     println!("refresh finished: {}", status);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod exec;
pub mod partition;
pub mod refresh;

// Re-export commonly used types
pub use config::RefreshConfig;
pub use error::{CinderError, Result};
pub use refresh::{RefreshJobStatus, RefreshManager, TaskRunContext};

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::catalog::{
        BaseTable, Database, MaterializedView, MemoryEditLog, MvTableProperties, Partition,
        PartitionScheme, TableKind,
    };
    pub use crate::error::{CinderError, Result};
    pub use crate::exec::{ExecutionEngine, TaskScheduler};
    pub use crate::partition::{PartitionKey, PartitionKeyRange, PartitionValue};
    pub use crate::refresh::{RefreshJobStatus, RefreshManager, TaskRunContext, TaskType};
    pub use crate::RefreshConfig;
}
