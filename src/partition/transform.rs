//! Partition transform expressions.
//!
//! An expression-partitioned materialized view derives its partitions from
//! a transform of the ref base table's partition column, e.g.
//! `date_trunc('month', dt)`. Applying the transform to the base table's
//! range map produces the target range map the view is synced against.

use chrono::{Datelike, NaiveDate};

use crate::error::{CinderError, Result};
use crate::partition::range::{
    range_partition_name, PartitionKey, PartitionKeyRange, PartitionValue, RangeMap,
};

/// Granularity of a date truncation transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncUnit {
    Day,
    Month,
    Year,
}

impl TruncUnit {
    fn trunc(&self, d: NaiveDate) -> NaiveDate {
        match self {
            TruncUnit::Day => d,
            TruncUnit::Month => NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap(),
            TruncUnit::Year => NaiveDate::from_ymd_opt(d.year(), 1, 1).unwrap(),
        }
    }

    fn next_boundary(&self, d: NaiveDate) -> NaiveDate {
        let floor = self.trunc(d);
        match self {
            TruncUnit::Day => floor.succ_opt().unwrap(),
            TruncUnit::Month => {
                if floor.month() == 12 {
                    NaiveDate::from_ymd_opt(floor.year() + 1, 1, 1).unwrap()
                } else {
                    NaiveDate::from_ymd_opt(floor.year(), floor.month() + 1, 1).unwrap()
                }
            }
            TruncUnit::Year => NaiveDate::from_ymd_opt(floor.year() + 1, 1, 1).unwrap(),
        }
    }

    /// Round up to the nearest unit boundary; a date already on a
    /// boundary is returned unchanged.
    fn ceil(&self, d: NaiveDate) -> NaiveDate {
        let floor = self.trunc(d);
        if floor == d {
            d
        } else {
            self.next_boundary(d)
        }
    }
}

/// How a materialized view's partition key is derived from the ref base
/// table's partition column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionTransform {
    /// Partition directly on the base column: base ranges map through
    /// unchanged, names included.
    Identity,
    /// Partition on a date truncation of the base column.
    DateTrunc(TruncUnit),
}

impl PartitionTransform {
    /// Whether the transform can associate several base partitions with
    /// one view partition (or vice versa).
    pub fn is_many_to_many(&self) -> bool {
        matches!(self, PartitionTransform::DateTrunc(_))
    }

    /// Apply the transform to a base table's range map, producing the
    /// target range map for the materialized view.
    ///
    /// For `DateTrunc`, every base range is widened to unit boundaries,
    /// overlapping results are coalesced, and partition names are
    /// synthesized from the transformed bounds (view partition names are
    /// synthetic, never the base table's).
    pub fn apply(&self, base: &RangeMap) -> Result<RangeMap> {
        match self {
            PartitionTransform::Identity => Ok(base.clone()),
            PartitionTransform::DateTrunc(unit) => {
                let mut transformed: Vec<PartitionKeyRange> = Vec::with_capacity(base.len());
                for range in base.values() {
                    transformed.push(trunc_range(range, *unit)?);
                }
                transformed.sort();

                // Coalesce ranges that collapsed onto overlapping intervals.
                let mut merged: Vec<PartitionKeyRange> = Vec::with_capacity(transformed.len());
                for range in transformed {
                    match merged.last_mut() {
                        Some(last) if last.intersects(&range) => {
                            if range.upper() > last.upper() {
                                *last = PartitionKeyRange::new(
                                    last.lower().clone(),
                                    range.upper().clone(),
                                )?;
                            }
                        }
                        _ => merged.push(range),
                    }
                }

                let mut result = RangeMap::new();
                for range in merged {
                    result.insert(range_partition_name(&range), range);
                }
                Ok(result)
            }
        }
    }
}

fn trunc_range(range: &PartitionKeyRange, unit: TruncUnit) -> Result<PartitionKeyRange> {
    let lower = trunc_key_down(range.lower(), unit)?;
    let upper = if range.upper().is_max() {
        PartitionKey::max()
    } else {
        trunc_key_up(range.upper(), unit)?
    };
    PartitionKeyRange::new(lower, upper)
}

fn trunc_key_down(key: &PartitionKey, unit: TruncUnit) -> Result<PartitionKey> {
    let d = date_of(key)?;
    Ok(PartitionKey::single(PartitionValue::Date(unit.trunc(d))))
}

fn trunc_key_up(key: &PartitionKey, unit: TruncUnit) -> Result<PartitionKey> {
    let d = date_of(key)?;
    Ok(PartitionKey::single(PartitionValue::Date(unit.ceil(d))))
}

fn date_of(key: &PartitionKey) -> Result<NaiveDate> {
    match key.values().first() {
        Some(PartitionValue::Date(d)) => Ok(*d),
        other => Err(CinderError::analysis(format!(
            "date_trunc transform requires a date partition column, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date_range(from: (i32, u32, u32), to: (i32, u32, u32)) -> PartitionKeyRange {
        PartitionKeyRange::new(
            PartitionKey::single(PartitionValue::date(from.0, from.1, from.2)),
            PartitionKey::single(PartitionValue::date(to.0, to.1, to.2)),
        )
        .unwrap()
    }

    #[test]
    fn test_identity_keeps_names_and_ranges() {
        let mut base = RangeMap::new();
        base.insert("p20240101".to_string(), date_range((2024, 1, 1), (2024, 1, 2)));
        let target = PartitionTransform::Identity.apply(&base).unwrap();
        assert_eq!(target, base);
    }

    #[test]
    fn test_month_trunc_merges_days() {
        let mut base = RangeMap::new();
        base.insert("d1".to_string(), date_range((2024, 1, 1), (2024, 1, 2)));
        base.insert("d2".to_string(), date_range((2024, 1, 15), (2024, 1, 16)));
        base.insert("d3".to_string(), date_range((2024, 2, 1), (2024, 2, 2)));

        let target = PartitionTransform::DateTrunc(TruncUnit::Month)
            .apply(&base)
            .unwrap();
        assert_eq!(target.len(), 2);
        assert!(target.contains_key("p20240101_20240201"));
        assert!(target.contains_key("p20240201_20240301"));
    }

    #[test]
    fn test_trunc_preserves_boundary_upper() {
        let mut base = RangeMap::new();
        base.insert("q".to_string(), date_range((2024, 3, 1), (2024, 4, 1)));
        let target = PartitionTransform::DateTrunc(TruncUnit::Month)
            .apply(&base)
            .unwrap();
        let range = target.get("p20240301_20240401").unwrap();
        assert_eq!(
            range.upper(),
            &PartitionKey::single(PartitionValue::date(2024, 4, 1))
        );
    }

    #[test]
    fn test_year_trunc_december_rollover() {
        let mut base = RangeMap::new();
        base.insert("d".to_string(), date_range((2023, 12, 15), (2023, 12, 16)));
        let target = PartitionTransform::DateTrunc(TruncUnit::Year)
            .apply(&base)
            .unwrap();
        assert!(target.contains_key("p20230101_20240101"));
    }

    #[test]
    fn test_trunc_keeps_max_sentinel() {
        let mut base = RangeMap::new();
        base.insert(
            "tail".to_string(),
            PartitionKeyRange::new(
                PartitionKey::single(PartitionValue::date(2024, 6, 10)),
                PartitionKey::max(),
            )
            .unwrap(),
        );
        let target = PartitionTransform::DateTrunc(TruncUnit::Month)
            .apply(&base)
            .unwrap();
        let range = target.get("p20240601_MAX").unwrap();
        assert!(range.upper().is_max());
    }

    #[test]
    fn test_trunc_rejects_non_date_column() {
        let mut base = RangeMap::new();
        base.insert(
            "p0".to_string(),
            PartitionKeyRange::new(
                PartitionKey::single(PartitionValue::Int64(0)),
                PartitionKey::single(PartitionValue::Int64(10)),
            )
            .unwrap(),
        );
        let err = PartitionTransform::DateTrunc(TruncUnit::Day).apply(&base);
        assert!(matches!(err, Err(CinderError::Analysis { .. })));
    }
}
