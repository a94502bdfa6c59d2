//! Partition key values, keys, and half-open key ranges.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CinderError, Result};

/// A typed scalar used as a partition key bound.
///
/// `MaxValue` is the unbounded upper sentinel; it sorts above every other
/// value. Values of different types never appear in the same well-formed
/// table; the cross-type ordering exists only to keep the order total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionValue {
    /// 64-bit signed integer
    Int64(i64),
    /// Calendar date
    Date(NaiveDate),
    /// UTF-8 string
    Utf8(String),
    /// Unbounded maximum sentinel
    MaxValue,
}

impl PartitionValue {
    /// Create a date value, panicking on an invalid calendar date.
    /// Intended for literals in tests and fixtures.
    pub fn date(year: i32, month: u32, day: u32) -> Self {
        Self::Date(NaiveDate::from_ymd_opt(year, month, day).expect("invalid date literal"))
    }

    /// Whether this is the unbounded maximum sentinel.
    pub fn is_max(&self) -> bool {
        matches!(self, Self::MaxValue)
    }

    /// Parse a partition bound literal.
    ///
    /// Tries `MAXVALUE`, then an ISO date, then an integer; anything else
    /// is kept as a string value. Used for the `partition_start` /
    /// `partition_end` run parameters and continuation markers, which
    /// travel as strings.
    pub fn parse(s: &str) -> Self {
        if s == "MAXVALUE" {
            return Self::MaxValue;
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Self::Date(d);
        }
        if let Ok(i) = s.parse::<i64>() {
            return Self::Int64(i);
        }
        Self::Utf8(s.to_string())
    }

    /// Compact rendering used when synthesizing partition names,
    /// e.g. `2020-01-01` becomes `20200101`.
    pub fn name_fragment(&self) -> String {
        match self {
            Self::Int64(v) => v.to_string(),
            Self::Date(d) => d.format("%Y%m%d").to_string(),
            Self::Utf8(s) => s.clone(),
            Self::MaxValue => "MAX".to_string(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Self::Int64(_) => 0,
            Self::Date(_) => 1,
            Self::Utf8(_) => 2,
            Self::MaxValue => 3,
        }
    }
}

impl Ord for PartitionValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            (Self::MaxValue, Self::MaxValue) => Ordering::Equal,
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl PartialOrd for PartitionValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64(v) => write!(f, "{}", v),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Utf8(s) => write!(f, "{}", s),
            Self::MaxValue => write!(f, "MAXVALUE"),
        }
    }
}

/// A partition key over one or more typed columns, ordered
/// lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    values: Vec<PartitionValue>,
}

impl PartitionKey {
    /// Create a key from column values.
    pub fn new(values: Vec<PartitionValue>) -> Self {
        Self { values }
    }

    /// Create a single-column key.
    pub fn single(value: PartitionValue) -> Self {
        Self {
            values: vec![value],
        }
    }

    /// Create the unbounded maximum key.
    pub fn max() -> Self {
        Self::single(PartitionValue::MaxValue)
    }

    /// The key's column values.
    pub fn values(&self) -> &[PartitionValue] {
        &self.values
    }

    /// Whether the key is the unbounded maximum sentinel.
    pub fn is_max(&self) -> bool {
        self.values.first().map(PartitionValue::is_max).unwrap_or(false)
    }

    /// Compact rendering for synthesized partition names.
    pub fn name_fragment(&self) -> String {
        self.values
            .iter()
            .map(PartitionValue::name_fragment)
            .collect::<Vec<_>>()
            .join("")
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// A half-open partition key range `[lower, upper)`.
///
/// Ranges within one table's range map are pairwise non-overlapping by
/// invariant; ordering is by lower bound then upper bound.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    lower: PartitionKey,
    upper: PartitionKey,
}

impl PartitionKeyRange {
    /// Create a range, rejecting empty or inverted bounds.
    pub fn new(lower: PartitionKey, upper: PartitionKey) -> Result<Self> {
        if lower >= upper {
            return Err(CinderError::invalid_argument(format!(
                "partition range lower bound {} is not below upper bound {}",
                lower, upper
            )));
        }
        Ok(Self { lower, upper })
    }

    /// The inclusive lower bound.
    pub fn lower(&self) -> &PartitionKey {
        &self.lower
    }

    /// The exclusive upper bound.
    pub fn upper(&self) -> &PartitionKey {
        &self.upper
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &PartitionKey) -> bool {
        &self.lower <= key && key < &self.upper
    }

    /// Whether two half-open ranges share any key.
    pub fn intersects(&self, other: &Self) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }
}

impl fmt::Display for PartitionKeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)
    }
}

/// A table's partition ranges keyed by partition name.
pub type RangeMap = BTreeMap<String, PartitionKeyRange>;

/// Synthesize a partition name from a range, e.g. `p20200101_20200102`.
pub fn range_partition_name(range: &PartitionKeyRange) -> String {
    format!(
        "p{}_{}",
        range.lower().name_fragment(),
        range.upper().name_fragment()
    )
}

/// Entries of a range map sorted by the range comparator.
pub fn sorted_by_range(map: &RangeMap) -> Vec<(&String, &PartitionKeyRange)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.1.cmp(b.1));
    entries
}

/// Whether any two ranges in the map overlap.
pub fn ranges_overlap(map: &RangeMap) -> bool {
    let sorted = sorted_by_range(map);
    sorted
        .windows(2)
        .any(|pair| pair[0].1.intersects(pair[1].1))
}
