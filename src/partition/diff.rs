//! Range-map diffing, intersection maps, and refresh-scope expansion.

use std::collections::{BTreeMap, BTreeSet};

use crate::partition::range::{sorted_by_range, RangeMap};

/// The add/delete sets between a materialized view's range map and its
/// target range map, keyed by partition name.
///
/// Deletes must be applied before adds: a deleted range's key space may be
/// immediately reused by a differently-bounded add.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeDiff {
    /// Partitions to create, absent from the view.
    pub adds: RangeMap,
    /// Partitions to drop, absent from the target.
    pub deletes: RangeMap,
}

impl RangeDiff {
    /// Whether the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty()
    }
}

/// Compute the diff that reconciles `current` (the view's range map) with
/// `target` (the transformed base table range map).
///
/// A partition is deleted when its name is gone from the target or its
/// range changed under the same name; the replacement range then shows up
/// as an add. When `ttl_number > 0`, only the `ttl_number` most recent
/// target ranges are eligible as adds: the retention window bounds what
/// gets created, it never forces deletion of older partitions the view
/// already has.
pub fn diff_range_maps(current: &RangeMap, target: &RangeMap, ttl_number: i32) -> RangeDiff {
    let mut diff = RangeDiff::default();

    for (name, range) in current {
        if target.get(name) != Some(range) {
            diff.deletes.insert(name.clone(), range.clone());
        }
    }

    let add_window: BTreeSet<&String> = if ttl_number > 0 && target.len() > ttl_number as usize {
        sorted_by_range(target)
            .into_iter()
            .rev()
            .take(ttl_number as usize)
            .map(|(name, _)| name)
            .collect()
    } else {
        target.keys().collect()
    };

    for (name, range) in target {
        if current.get(name) != Some(range) && add_window.contains(name) {
            diff.adds.insert(name.clone(), range.clone());
        }
    }

    diff
}

/// Apply a diff to a range map: deletes first, then adds.
pub fn apply_diff(map: &mut RangeMap, diff: &RangeDiff) {
    for name in diff.deletes.keys() {
        map.remove(name);
    }
    for (name, range) in &diff.adds {
        map.insert(name.clone(), range.clone());
    }
}

/// Whether two range maps differ in any partition name or bound.
pub fn has_partition_change(a: &RangeMap, b: &RangeMap) -> bool {
    a != b
}

/// For every partition of `from`, the names of `to` partitions whose
/// ranges overlap it.
///
/// Association is by interval overlap, not name equality, because
/// materialized view partition names are synthetic and one partition can derive from
/// several base partitions (and vice versa). Partitions with no overlap
/// still get an empty entry so lookups never distinguish "absent" from
/// "unrelated".
pub fn intersected_partitions(
    from: &RangeMap,
    to: &RangeMap,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut result = BTreeMap::new();
    for (from_name, from_range) in from {
        let overlapping: BTreeSet<String> = to
            .iter()
            .filter(|(_, to_range)| from_range.intersects(to_range))
            .map(|(to_name, _)| to_name.clone())
            .collect();
        result.insert(from_name.clone(), overlapping);
    }
    result
}

/// Expand a refresh candidate set to its fixed point over the partition
/// intersection maps.
///
/// The relation between view and base partitions is n:m, so a changed base
/// partition can pull in a view partition whose other base partitions then
/// pull in further view partitions. Alternates mapping base→view and
/// view→base until neither set grows; terminates because both sets grow
/// monotonically and are bounded by the total partition count.
pub fn expand_potential_refresh(
    mv_names: &mut BTreeSet<String>,
    base_names: &mut BTreeSet<String>,
    base_to_mv: &BTreeMap<String, BTreeSet<String>>,
    mv_to_base: &BTreeMap<String, BTreeSet<String>>,
) {
    loop {
        let mut grew = false;
        for base in base_names.iter().cloned().collect::<Vec<_>>() {
            if let Some(mvs) = base_to_mv.get(&base) {
                for mv in mvs {
                    grew |= mv_names.insert(mv.clone());
                }
            }
        }
        for mv in mv_names.iter().cloned().collect::<Vec<_>>() {
            if let Some(bases) = mv_to_base.get(&mv) {
                for base in bases {
                    grew |= base_names.insert(base.clone());
                }
            }
        }
        if !grew {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::range::{ranges_overlap, PartitionKey, PartitionKeyRange, PartitionValue};

    fn day_range(from: u32, to: u32) -> PartitionKeyRange {
        PartitionKeyRange::new(
            PartitionKey::single(PartitionValue::date(2024, 1, from)),
            PartitionKey::single(PartitionValue::date(2024, 1, to)),
        )
        .unwrap()
    }

    fn day_map(days: &[u32]) -> RangeMap {
        days.iter()
            .map(|d| (format!("p{}", d), day_range(*d, d + 1)))
            .collect()
    }

    #[test]
    fn test_diff_adds_and_deletes() {
        let current = day_map(&[1, 2, 3]);
        let target = day_map(&[2, 3, 4]);
        let diff = diff_range_maps(&current, &target, 0);
        assert_eq!(diff.adds.keys().collect::<Vec<_>>(), vec!["p4"]);
        assert_eq!(diff.deletes.keys().collect::<Vec<_>>(), vec!["p1"]);
    }

    #[test]
    fn test_diff_detects_rebounded_range() {
        let current = day_map(&[1]);
        let mut target = RangeMap::new();
        // same name, different bounds: must delete then re-add
        target.insert("p1".to_string(), day_range(1, 3));
        let diff = diff_range_maps(&current, &target, 0);
        assert_eq!(diff.deletes.get("p1"), Some(&day_range(1, 2)));
        assert_eq!(diff.adds.get("p1"), Some(&day_range(1, 3)));
    }

    #[test]
    fn test_apply_diff_reaches_target() {
        let mut current = day_map(&[1, 2, 3]);
        let target = day_map(&[2, 3, 4, 5]);
        let diff = diff_range_maps(&current, &target, 0);
        apply_diff(&mut current, &diff);
        assert_eq!(current, target);
        assert!(!ranges_overlap(&current));
    }

    #[test]
    fn test_ttl_bounds_adds_without_forcing_eviction() {
        // TTL=3, base has days 1..=5, view has days 1..=3: the window is
        // {3,4,5}, so only 4 and 5 are added; day 1 stays because the
        // retention window never evicts what the view already holds.
        let current = day_map(&[1, 2, 3]);
        let target = day_map(&[1, 2, 3, 4, 5]);
        let diff = diff_range_maps(&current, &target, 3);
        assert_eq!(diff.adds.keys().collect::<Vec<_>>(), vec!["p4", "p5"]);
        assert!(diff.deletes.is_empty());
    }

    #[test]
    fn test_ttl_does_not_shield_dropped_partitions() {
        // a partition gone from the target is deleted even when it is
        // outside the TTL window
        let current = day_map(&[1, 4, 5]);
        let target = day_map(&[4, 5]);
        let diff = diff_range_maps(&current, &target, 1);
        assert_eq!(diff.deletes.keys().collect::<Vec<_>>(), vec!["p1"]);
    }

    #[test]
    fn test_diff_idempotent() {
        let mut current = day_map(&[1, 2]);
        let target = day_map(&[2, 3]);
        let diff = diff_range_maps(&current, &target, 0);
        apply_diff(&mut current, &diff);
        let rediff = diff_range_maps(&current, &target, 0);
        assert!(rediff.is_empty());
    }

    #[test]
    fn test_intersected_partitions_by_overlap() {
        // one monthly view partition covering two daily base partitions
        let mut mv = RangeMap::new();
        mv.insert("m1".to_string(), day_range(1, 10));
        let base = day_map(&[1, 2, 20]);

        let mv_to_base = intersected_partitions(&mv, &base);
        let expected: BTreeSet<String> = ["p1", "p2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(mv_to_base.get("m1").unwrap(), &expected);

        let base_to_mv = intersected_partitions(&base, &mv);
        assert_eq!(base_to_mv.get("p1").unwrap().len(), 1);
        assert!(base_to_mv.get("p20").unwrap().is_empty());
    }

    #[test]
    fn test_expand_potential_refresh_fixed_point() {
        // p1 and p2 both derive from b1; b1 changed, so selecting p1 must
        // pull in p2 through the shared base partition.
        let mut base_to_mv = BTreeMap::new();
        base_to_mv.insert(
            "b1".to_string(),
            ["p1", "p2"].iter().map(|s| s.to_string()).collect(),
        );
        let mut mv_to_base = BTreeMap::new();
        mv_to_base.insert(
            "p1".to_string(),
            ["b1"].iter().map(|s| s.to_string()).collect(),
        );
        mv_to_base.insert(
            "p2".to_string(),
            ["b1"].iter().map(|s| s.to_string()).collect(),
        );

        let mut mv_names: BTreeSet<String> = ["p1".to_string()].into_iter().collect();
        let mut base_names: BTreeSet<String> = ["b1".to_string()].into_iter().collect();
        expand_potential_refresh(&mut mv_names, &mut base_names, &base_to_mv, &mv_to_base);

        assert!(mv_names.contains("p1") && mv_names.contains("p2"));

        // idempotent: re-running on its own output changes nothing
        let before = (mv_names.clone(), base_names.clone());
        expand_potential_refresh(&mut mv_names, &mut base_names, &base_to_mv, &mv_to_base);
        assert_eq!((mv_names, base_names), before);
    }

    #[test]
    fn test_expand_chains_across_partitions() {
        // b1 -> {p1}, p1 -> {b1, b2}, b2 -> {p2}: starting from b1 the
        // expansion must reach p2 transitively.
        let mut base_to_mv = BTreeMap::new();
        base_to_mv.insert("b1".to_string(), BTreeSet::from(["p1".to_string()]));
        base_to_mv.insert("b2".to_string(), BTreeSet::from(["p2".to_string()]));
        let mut mv_to_base = BTreeMap::new();
        mv_to_base.insert(
            "p1".to_string(),
            BTreeSet::from(["b1".to_string(), "b2".to_string()]),
        );
        mv_to_base.insert("p2".to_string(), BTreeSet::from(["b2".to_string()]));

        let mut mv_names = BTreeSet::new();
        let mut base_names = BTreeSet::from(["b1".to_string()]);
        expand_potential_refresh(&mut mv_names, &mut base_names, &base_to_mv, &mv_to_base);

        assert_eq!(
            mv_names,
            BTreeSet::from(["p1".to_string(), "p2".to_string()])
        );
    }
}
