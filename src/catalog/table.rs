//! Table entities: base tables, materialized views, and their partitions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::partition::{
    range_partition_name, sorted_by_range, PartitionKeyRange, PartitionTransform, RangeMap,
};

/// Identifier of a table within its database.
pub type TableId = u64;

/// How a base table is backed, which determines its snapshot and change
/// semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Transactionally versioned table owned by this catalog; snapshots
    /// are deep copies and staleness is tracked by visible version.
    Native,
    /// Table backed by an external metastore; staleness is tracked by
    /// partition modified time.
    External,
    /// Logical view; never snapshotted, unsupported for partition refresh.
    View,
}

/// One partition of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Partition id, unique within the database.
    pub id: i64,
    /// Key range; `None` for the implicit partition of an unpartitioned
    /// table.
    pub range: Option<PartitionKeyRange>,
    /// Visible transactional version (native tables).
    pub visible_version: i64,
    /// Time of the visible version; doubles as the modified time for
    /// external tables.
    pub visible_version_time: i64,
}

impl Partition {
    /// Create a partition at version 1.
    pub fn new(id: i64, range: Option<PartitionKeyRange>) -> Self {
        Self {
            id,
            range,
            visible_version: 1,
            visible_version_time: 0,
        }
    }

    /// Set the visible version and its time.
    pub fn with_version(mut self, version: i64, version_time: i64) -> Self {
        self.visible_version = version;
        self.visible_version_time = version_time;
        self
    }

    /// Modified time of an external partition.
    pub fn modified_time(&self) -> i64 {
        self.visible_version_time
    }
}

/// Identifying info of a base table, captured into snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTableInfo {
    pub id: TableId,
    pub name: String,
    pub kind: TableKind,
}

/// Persisted provenance marker for one consumed base-table partition.
///
/// For external tables `partition_id` is `-1` and both version fields
/// carry the partition's modified time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasePartitionInfo {
    pub partition_id: i64,
    pub version: i64,
    pub version_time: i64,
}

impl BasePartitionInfo {
    /// Build the marker for a partition of the given table kind.
    pub fn of(kind: TableKind, partition: &Partition) -> Self {
        match kind {
            TableKind::External => Self {
                partition_id: -1,
                version: partition.modified_time(),
                version_time: partition.modified_time(),
            },
            _ => Self {
                partition_id: partition.id,
                version: partition.visible_version,
                version_time: partition.visible_version_time,
            },
        }
    }
}

/// A base table of a materialized view.
#[derive(Debug, Clone)]
pub struct BaseTable {
    id: TableId,
    name: String,
    kind: TableKind,
    partitions: BTreeMap<String, Partition>,
}

impl BaseTable {
    /// Create an empty table.
    pub fn new(id: TableId, name: impl Into<String>, kind: TableKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            partitions: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Identifying info for snapshots.
    pub fn info(&self) -> BaseTableInfo {
        BaseTableInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
        }
    }

    /// Whether per-partition staleness tracking applies to this table.
    pub fn supports_partition_refresh(&self) -> bool {
        !matches!(self.kind, TableKind::View)
    }

    /// Add or replace a partition.
    pub fn put_partition(&mut self, name: impl Into<String>, partition: Partition) {
        self.partitions.insert(name.into(), partition);
    }

    /// Builder-style partition insertion for fixtures.
    pub fn with_partition(mut self, name: impl Into<String>, partition: Partition) -> Self {
        self.put_partition(name, partition);
        self
    }

    /// Remove a partition by name.
    pub fn remove_partition(&mut self, name: &str) -> Option<Partition> {
        self.partitions.remove(name)
    }

    /// Rename a partition, keeping its id and versions.
    pub fn rename_partition(&mut self, from: &str, to: impl Into<String>) {
        if let Some(p) = self.partitions.remove(from) {
            self.partitions.insert(to.into(), p);
        }
    }

    /// Advance a partition's visible version.
    pub fn bump_partition_version(&mut self, name: &str, version: i64, version_time: i64) {
        if let Some(p) = self.partitions.get_mut(name) {
            p.visible_version = version;
            p.visible_version_time = version_time;
        }
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(name)
    }

    pub fn partitions(&self) -> &BTreeMap<String, Partition> {
        &self.partitions
    }

    /// Names of all visible partitions.
    pub fn visible_partition_names(&self) -> BTreeSet<String> {
        self.partitions.keys().cloned().collect()
    }

    /// The table's ranged partitions keyed by name.
    pub fn range_partition_map(&self) -> RangeMap {
        self.partitions
            .iter()
            .filter_map(|(name, p)| p.range.clone().map(|r| (name.clone(), r)))
            .collect()
    }

    /// The table's partition ranges grouped into logical partitions,
    /// with the logical-name → real-name association.
    ///
    /// External tables can hold several real partitions over the same key
    /// range (multiple partition columns collapsed onto the one the view
    /// partitions by); those are grouped under one synthetic logical name.
    /// Native partitions map to themselves.
    pub fn logical_range_map(&self) -> (RangeMap, BTreeMap<String, BTreeSet<String>>) {
        match self.kind {
            TableKind::External => {
                let mut by_range: BTreeMap<PartitionKeyRange, BTreeSet<String>> = BTreeMap::new();
                for (name, p) in &self.partitions {
                    if let Some(range) = &p.range {
                        by_range
                            .entry(range.clone())
                            .or_default()
                            .insert(name.clone());
                    }
                }
                let mut ranges = RangeMap::new();
                let mut names = BTreeMap::new();
                for (range, real_names) in by_range {
                    let logical = range_partition_name(&range);
                    ranges.insert(logical.clone(), range);
                    names.insert(logical, real_names);
                }
                (ranges, names)
            }
            _ => {
                let ranges = self.range_partition_map();
                let names = ranges
                    .keys()
                    .map(|n| (n.clone(), BTreeSet::from([n.clone()])))
                    .collect();
                (ranges, names)
            }
        }
    }
}

/// How a materialized view is partitioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionScheme {
    /// A single implicit partition.
    Unpartitioned,
    /// Range partitions derived from a column of the ref base table,
    /// possibly through a transform expression.
    RangePartitioned {
        /// The partition-determining base table.
        ref_table: TableId,
        /// Its partition column.
        ref_column: String,
        /// How view partitions derive from the column.
        transform: PartitionTransform,
    },
}

/// Refresh-related table properties of a materialized view.
#[derive(Debug, Clone)]
pub struct MvTableProperties {
    /// Keep at most this many most-recent partitions in the refresh
    /// window; non-positive means unlimited.
    pub partition_ttl_number: i32,
    /// Refresh at most this many partitions per run, scheduling a
    /// continuation run for the rest; non-positive means unlimited.
    pub partition_refresh_number: i32,
    /// Additional window cap applied only to periodic (auto) refreshes;
    /// non-positive means unlimited.
    pub auto_refresh_partitions_limit: i32,
    /// Resource group the rebuild plan executes under.
    pub resource_group: Option<String>,
}

impl Default for MvTableProperties {
    fn default() -> Self {
        Self {
            partition_ttl_number: -1,
            partition_refresh_number: -1,
            auto_refresh_partitions_limit: -1,
            resource_group: None,
        }
    }
}

/// Persisted refresh provenance of a materialized view.
///
/// Records, per base table, the partition versions the last successful
/// rebuild consumed, and the view-partition → base-partition association.
/// Mutated only by the metadata updater under the database write lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshContext {
    /// table id → partition name → consumed version marker.
    pub base_table_versions: BTreeMap<TableId, BTreeMap<String, BasePartitionInfo>>,
    /// view partition name → consumed ref-base partition names.
    pub mv_to_base_partitions: BTreeMap<String, BTreeSet<String>>,
    /// Time of the newest consumed partition version.
    pub last_refresh_time: i64,
}

/// A materialized view: a persisted, partitioned query result kept
/// consistent with its base tables by the refresh orchestrator.
#[derive(Debug, Clone)]
pub struct MaterializedView {
    id: TableId,
    name: String,
    definition: String,
    base_table_ids: Vec<TableId>,
    partition_scheme: PartitionScheme,
    partitions: BTreeMap<String, Partition>,
    properties: MvTableProperties,
    refresh_context: RefreshContext,
    active: bool,
    inactive_reason: Option<String>,
}

impl MaterializedView {
    /// Create a view. An unpartitioned view gets its single implicit
    /// partition immediately.
    pub fn new(
        id: TableId,
        name: impl Into<String>,
        definition: impl Into<String>,
        base_table_ids: Vec<TableId>,
        partition_scheme: PartitionScheme,
    ) -> Self {
        let name = name.into();
        let mut partitions = BTreeMap::new();
        if matches!(partition_scheme, PartitionScheme::Unpartitioned) {
            partitions.insert(name.clone(), Partition::new(0, None));
        }
        Self {
            id,
            name,
            definition: definition.into(),
            base_table_ids,
            partition_scheme,
            partitions,
            properties: MvTableProperties::default(),
            refresh_context: RefreshContext::default(),
            active: true,
            inactive_reason: None,
        }
    }

    /// Set the refresh-related table properties.
    pub fn with_properties(mut self, properties: MvTableProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn base_table_ids(&self) -> &[TableId] {
        &self.base_table_ids
    }

    pub fn partition_scheme(&self) -> &PartitionScheme {
        &self.partition_scheme
    }

    pub fn properties(&self) -> &MvTableProperties {
        &self.properties
    }

    pub fn refresh_context(&self) -> &RefreshContext {
        &self.refresh_context
    }

    pub(crate) fn refresh_context_mut(&mut self) -> &mut RefreshContext {
        &mut self.refresh_context
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn inactive_reason(&self) -> Option<&str> {
        self.inactive_reason.as_deref()
    }

    /// Mark the view inactive with a reason.
    pub fn set_inactive(&mut self, reason: impl Into<String>) {
        self.active = false;
        self.inactive_reason = Some(reason.into());
    }

    /// Mark the view active again.
    pub fn activate(&mut self) {
        self.active = true;
        self.inactive_reason = None;
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(name)
    }

    pub(crate) fn put_partition(&mut self, name: impl Into<String>, partition: Partition) {
        self.partitions.insert(name.into(), partition);
    }

    pub(crate) fn remove_partition(&mut self, name: &str) -> Option<Partition> {
        self.partitions.remove(name)
    }

    /// Names of all visible partitions.
    pub fn visible_partition_names(&self) -> BTreeSet<String> {
        self.partitions.keys().cloned().collect()
    }

    /// The view's ranged partitions keyed by name.
    pub fn range_partition_map(&self) -> RangeMap {
        self.partitions
            .iter()
            .filter_map(|(name, p)| p.range.clone().map(|r| (name.clone(), r)))
            .collect()
    }

    /// The `ttl_number` most recent ranged partitions; all of them when
    /// `ttl_number` is non-positive.
    pub fn valid_partition_map(&self, ttl_number: i32) -> RangeMap {
        let all = self.range_partition_map();
        if ttl_number <= 0 || all.len() <= ttl_number as usize {
            return all;
        }
        sorted_by_range(&all)
            .into_iter()
            .rev()
            .take(ttl_number as usize)
            .map(|(name, range)| (name.clone(), range.clone()))
            .collect()
    }

    /// Names of `table`'s partitions updated since the last recorded
    /// refresh: unseen partitions, advanced native versions, or newer
    /// external modified times.
    pub fn updated_partition_names(&self, table: &BaseTable) -> BTreeSet<String> {
        let recorded = self.refresh_context.base_table_versions.get(&table.id());
        table
            .partitions()
            .iter()
            .filter(|(name, p)| match recorded.and_then(|m| m.get(*name)) {
                None => true,
                Some(info) => match table.kind() {
                    TableKind::External => p.modified_time() > info.version_time,
                    _ => p.visible_version != info.version,
                },
            })
            .map(|(name, _)| name.clone())
            .collect()
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

    fn native_table() -> BaseTable {
        BaseTable::new(1, "orders", TableKind::Native)
            .with_partition(
                "p1",
                Partition::new(101, Some(day_range(1, 2))).with_version(2, 10),
            )
            .with_partition(
                "p2",
                Partition::new(102, Some(day_range(2, 3))).with_version(3, 20),
            )
    }

    #[test]
    fn test_unpartitioned_view_has_implicit_partition() {
        let mv = MaterializedView::new(
            10,
            "mv1",
            "SELECT * FROM orders",
            vec![1],
            PartitionScheme::Unpartitioned,
        );
        assert_eq!(
            mv.visible_partition_names(),
            BTreeSet::from(["mv1".to_string()])
        );
        assert!(mv.range_partition_map().is_empty());
    }

    #[test]
    fn test_updated_partitions_without_history() {
        let mv = MaterializedView::new(
            10,
            "mv1",
            "SELECT * FROM orders",
            vec![1],
            PartitionScheme::Unpartitioned,
        );
        // nothing recorded yet: everything counts as updated
        assert_eq!(mv.updated_partition_names(&native_table()).len(), 2);
    }

    #[test]
    fn test_updated_partitions_by_version() {
        let table = native_table();
        let mut mv = MaterializedView::new(
            10,
            "mv1",
            "SELECT * FROM orders",
            vec![1],
            PartitionScheme::Unpartitioned,
        );
        let mut versions = BTreeMap::new();
        versions.insert(
            "p1".to_string(),
            BasePartitionInfo::of(TableKind::Native, table.partition("p1").unwrap()),
        );
        versions.insert(
            "p2".to_string(),
            BasePartitionInfo {
                partition_id: 102,
                version: 2, // stale: table is at version 3
                version_time: 5,
            },
        );
        mv.refresh_context_mut()
            .base_table_versions
            .insert(table.id(), versions);

        assert_eq!(
            mv.updated_partition_names(&table),
            BTreeSet::from(["p2".to_string()])
        );
    }

    #[test]
    fn test_updated_partitions_external_by_modified_time() {
        let mut table = BaseTable::new(2, "hive_sales", TableKind::External).with_partition(
            "d1",
            Partition::new(-1, Some(day_range(1, 2))).with_version(0, 100),
        );
        let mut mv = MaterializedView::new(
            10,
            "mv1",
            "SELECT * FROM hive_sales",
            vec![2],
            PartitionScheme::Unpartitioned,
        );
        mv.refresh_context_mut().base_table_versions.insert(
            2,
            BTreeMap::from([(
                "d1".to_string(),
                BasePartitionInfo {
                    partition_id: -1,
                    version: 100,
                    version_time: 100,
                },
            )]),
        );
        assert!(mv.updated_partition_names(&table).is_empty());

        table.bump_partition_version("d1", 0, 200);
        assert_eq!(
            mv.updated_partition_names(&table),
            BTreeSet::from(["d1".to_string()])
        );
    }

    #[test]
    fn test_valid_partition_map_ttl() {
        let mut mv = MaterializedView::new(
            10,
            "mv1",
            "SELECT * FROM orders",
            vec![1],
            PartitionScheme::RangePartitioned {
                ref_table: 1,
                ref_column: "dt".to_string(),
                transform: PartitionTransform::Identity,
            },
        );
        for d in 1..=5u32 {
            mv.put_partition(
                format!("p{}", d),
                Partition::new(d as i64, Some(day_range(d, d + 1))),
            );
        }
        let windowed = mv.valid_partition_map(2);
        assert_eq!(
            windowed.keys().cloned().collect::<Vec<_>>(),
            vec!["p4".to_string(), "p5".to_string()]
        );
        assert_eq!(mv.valid_partition_map(-1).len(), 5);
    }

    #[test]
    fn test_external_logical_grouping() {
        // two real external partitions over the same date range collapse
        // onto one logical partition
        let table = BaseTable::new(3, "hive_multi", TableKind::External)
            .with_partition(
                "par_col=0/par_date=2024-01-01",
                Partition::new(-1, Some(day_range(1, 2))),
            )
            .with_partition(
                "par_col=1/par_date=2024-01-01",
                Partition::new(-1, Some(day_range(1, 2))),
            );
        let (ranges, names) = table.logical_range_map();
        assert_eq!(ranges.len(), 1);
        let reals = names.get("p20240101_20240102").unwrap();
        assert_eq!(reals.len(), 2);
    }
}
