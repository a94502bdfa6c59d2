//! Catalog management for Cinder.
//!
//! The catalog owns the database object and its tables. The database is a
//! shared resource guarded by a reader/writer lock; every acquisition in
//! the refresh path uses an explicit timeout and raises a distinguished
//! lock-timeout error so the executor's retry policy can apply the right
//! budget.

mod journal;
mod table;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use journal::{EditLog, MemoryEditLog, RefreshSchemeChange};
pub use table::{
    BasePartitionInfo, BaseTable, BaseTableInfo, MaterializedView, MvTableProperties, Partition,
    PartitionScheme, RefreshContext, TableId, TableKind,
};

use crate::error::{CinderError, Result};
use crate::partition::PartitionKeyRange;

/// A table registered in the database.
#[derive(Debug, Clone)]
pub enum TableEntry {
    Base(BaseTable),
    View(MaterializedView),
}

/// The tables of a database, accessed through the database lock.
#[derive(Debug, Default)]
pub struct DatabaseState {
    tables: BTreeMap<TableId, TableEntry>,
}

impl DatabaseState {
    /// Get a base table by id.
    pub fn base_table(&self, id: TableId) -> Option<&BaseTable> {
        match self.tables.get(&id) {
            Some(TableEntry::Base(t)) => Some(t),
            _ => None,
        }
    }

    /// Get a mutable base table by id.
    pub fn base_table_mut(&mut self, id: TableId) -> Option<&mut BaseTable> {
        match self.tables.get_mut(&id) {
            Some(TableEntry::Base(t)) => Some(t),
            _ => None,
        }
    }

    /// Get a materialized view by id.
    pub fn view(&self, id: TableId) -> Option<&MaterializedView> {
        match self.tables.get(&id) {
            Some(TableEntry::View(v)) => Some(v),
            _ => None,
        }
    }

    /// Get a mutable materialized view by id.
    pub fn view_mut(&mut self, id: TableId) -> Option<&mut MaterializedView> {
        match self.tables.get_mut(&id) {
            Some(TableEntry::View(v)) => Some(v),
            _ => None,
        }
    }

    /// Whether any table with this id exists.
    pub fn table_exists(&self, id: TableId) -> bool {
        self.tables.contains_key(&id)
    }

    /// Register a table, replacing any previous entry with the same id.
    pub fn insert(&mut self, entry: TableEntry) {
        let id = match &entry {
            TableEntry::Base(t) => t.id(),
            TableEntry::View(v) => v.id(),
        };
        self.tables.insert(id, entry);
    }

    /// Remove a table by id.
    pub fn remove(&mut self, id: TableId) -> Option<TableEntry> {
        self.tables.remove(&id)
    }
}

/// A database: the shared resource every refresh run locks around.
#[derive(Debug)]
pub struct Database {
    name: String,
    exists: AtomicBool,
    next_partition_id: AtomicI64,
    state: RwLock<DatabaseState>,
}

impl Database {
    /// Create an empty database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: AtomicBool::new(true),
            next_partition_id: AtomicI64::new(10_000),
            state: RwLock::new(DatabaseState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the database dropped; subsequent checked lock acquisitions
    /// fail with a concurrent-drop error.
    pub fn mark_dropped(&self) {
        self.exists.store(false, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        !self.exists.load(Ordering::SeqCst)
    }

    /// Acquire the shared read lock within `timeout`.
    pub fn try_read(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, DatabaseState>> {
        self.state.try_read_for(timeout).ok_or_else(|| {
            CinderError::lock_timeout(format!("Failed to lock database: {}", self.name))
        })
    }

    /// Acquire the exclusive write lock within `timeout`.
    pub fn try_write(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, DatabaseState>> {
        self.state.try_write_for(timeout).ok_or_else(|| {
            CinderError::lock_timeout(format!("Failed to lock database: {}", self.name))
        })
    }

    /// Acquire the write lock and re-validate the database still exists.
    pub fn try_write_checked(
        &self,
        timeout: Duration,
    ) -> Result<RwLockWriteGuard<'_, DatabaseState>> {
        let guard = self.try_write(timeout)?;
        if self.is_dropped() {
            return Err(CinderError::concurrent_drop(format!(
                "database {} not exist",
                self.name
            )));
        }
        Ok(guard)
    }

    /// Register a base table.
    pub fn register_base_table(&self, table: BaseTable) {
        self.state.write().insert(TableEntry::Base(table));
    }

    /// Register a materialized view.
    pub fn register_view(&self, view: MaterializedView) {
        self.state.write().insert(TableEntry::View(view));
    }

    /// Remove a table, simulating a concurrent drop in tests.
    pub fn drop_table(&self, id: TableId) -> Option<TableEntry> {
        self.state.write().remove(id)
    }

    /// Allocate a partition id for a created view partition.
    pub fn allocate_partition_id(&self) -> i64 {
        self.next_partition_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Create one batch of view partitions under the write lock.
    ///
    /// An existing partition with the same name and range is left alone so
    /// a retried run does not fail on its own earlier progress.
    pub fn add_view_partitions(
        &self,
        view_id: TableId,
        adds: &[(String, PartitionKeyRange)],
        timeout: Duration,
    ) -> Result<()> {
        if adds.is_empty() {
            return Ok(());
        }
        let mut state = self.try_write_checked(timeout)?;
        let ids: Vec<i64> = adds.iter().map(|_| self.allocate_partition_id()).collect();
        let view = state.view_mut(view_id).ok_or_else(|| {
            CinderError::concurrent_drop(format!("materialized view {} not exist", view_id))
        })?;
        for ((name, range), id) in adds.iter().zip(ids) {
            match view.partition(name) {
                Some(existing) if existing.range.as_ref() == Some(range) => {}
                _ => view.put_partition(name.clone(), Partition::new(id, Some(range.clone()))),
            }
        }
        Ok(())
    }

    /// Drop one view partition under the write lock, re-validating that
    /// the view and the partition still exist.
    pub fn drop_view_partition(
        &self,
        view_id: TableId,
        partition_name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut state = self.try_write_checked(timeout)?;
        let view = state.view_mut(view_id).ok_or_else(|| {
            CinderError::concurrent_drop(format!("materialized view {} not exist", view_id))
        })?;
        view.remove_partition(partition_name).ok_or_else(|| {
            CinderError::catalog(format!(
                "drop partition failed. partition: {} not exist",
                partition_name
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionKey, PartitionValue};

    fn day_range(from: u32, to: u32) -> PartitionKeyRange {
        PartitionKeyRange::new(
            PartitionKey::single(PartitionValue::date(2024, 1, from)),
            PartitionKey::single(PartitionValue::date(2024, 1, to)),
        )
        .unwrap()
    }

    fn db_with_view() -> Database {
        let db = Database::new("db1");
        db.register_view(MaterializedView::new(
            10,
            "mv1",
            "SELECT * FROM orders",
            vec![1],
            PartitionScheme::RangePartitioned {
                ref_table: 1,
                ref_column: "dt".to_string(),
                transform: crate::partition::PartitionTransform::Identity,
            },
        ));
        db
    }

    #[test]
    fn test_timed_read_lock() {
        let db = Database::new("db1");
        let guard = db.try_read(Duration::from_millis(10)).unwrap();
        drop(guard);
    }

    #[test]
    fn test_write_lock_timeout_is_distinguished() {
        let db = Database::new("db1");
        let _read = db.try_read(Duration::from_millis(10)).unwrap();
        let err = db.try_write(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn test_checked_write_after_drop() {
        let db = Database::new("db1");
        db.mark_dropped();
        let err = db.try_write_checked(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CinderError::ConcurrentDrop { .. }));
    }

    #[test]
    fn test_add_and_drop_view_partitions() {
        let db = db_with_view();
        let timeout = Duration::from_millis(50);
        db.add_view_partitions(
            10,
            &[
                ("p1".to_string(), day_range(1, 2)),
                ("p2".to_string(), day_range(2, 3)),
            ],
            timeout,
        )
        .unwrap();

        {
            let state = db.try_read(timeout).unwrap();
            let view = state.view(10).unwrap();
            assert_eq!(view.visible_partition_names().len(), 2);
            assert!(view.partition("p1").unwrap().id >= 10_000);
        }

        db.drop_view_partition(10, "p1", timeout).unwrap();
        let state = db.try_read(timeout).unwrap();
        assert_eq!(state.view(10).unwrap().visible_partition_names().len(), 1);
    }

    #[test]
    fn test_add_partitions_is_idempotent() {
        let db = db_with_view();
        let timeout = Duration::from_millis(50);
        let adds = vec![("p1".to_string(), day_range(1, 2))];
        db.add_view_partitions(10, &adds, timeout).unwrap();
        let first_id = {
            let state = db.try_read(timeout).unwrap();
            state.view(10).unwrap().partition("p1").unwrap().id
        };
        db.add_view_partitions(10, &adds, timeout).unwrap();
        let state = db.try_read(timeout).unwrap();
        assert_eq!(state.view(10).unwrap().partition("p1").unwrap().id, first_id);
    }

    #[test]
    fn test_drop_partition_of_dropped_view() {
        let db = db_with_view();
        db.drop_table(10);
        let err = db
            .drop_view_partition(10, "p1", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, CinderError::ConcurrentDrop { .. }));
    }
}
