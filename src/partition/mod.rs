//! Partition key ranges and range-map algebra.
//!
//! Provides the value types for partition keys and half-open key ranges,
//! the partition-transform expressions used by expression-partitioned
//! materialized views, and the range-map diff/intersection computations
//! the refresh orchestrator is built on.

mod diff;
mod range;
mod transform;

pub use diff::{
    apply_diff, diff_range_maps, expand_potential_refresh, has_partition_change,
    intersected_partitions, RangeDiff,
};
pub use range::{
    range_partition_name, ranges_overlap, sorted_by_range, PartitionKey, PartitionKeyRange,
    PartitionValue, RangeMap,
};
pub use transform::{PartitionTransform, TruncUnit};
