//! Edit log for persisted refresh metadata changes.
//!
//! Every successful metadata update appends exactly one change record so
//! the refresh provenance can be replayed on recovery.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::catalog::table::{RefreshContext, TableId};
use crate::error::{CinderError, Result};

/// The persisted record of one refresh-scheme change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshSchemeChange {
    pub mv_id: TableId,
    pub mv_name: String,
    pub last_refresh_time: i64,
    pub refresh_context: RefreshContext,
}

/// Sink for refresh-scheme change records.
pub trait EditLog: Send + Sync {
    /// Append one change record.
    fn log_refresh_scheme_change(&self, change: &RefreshSchemeChange) -> Result<()>;
}

/// In-memory edit log keeping serialized records, for embedded use and
/// tests.
#[derive(Debug, Default)]
pub struct MemoryEditLog {
    records: Mutex<Vec<String>>,
}

impl MemoryEditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of appended records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Deserialize all appended records.
    pub fn records(&self) -> Vec<RefreshSchemeChange> {
        self.records
            .lock()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl EditLog for MemoryEditLog {
    fn log_refresh_scheme_change(&self, change: &RefreshSchemeChange) -> Result<()> {
        let line = serde_json::to_string(change)
            .map_err(|e| CinderError::internal(format!("serialize edit log record: {}", e)))?;
        self.records.lock().push(line);
        Ok(())
    }
}
