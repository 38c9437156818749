//! C1 — range algebra primitives (spec §4.1).
//!
//! Half-open interval semantics `[from, until)` throughout. Boundary values
//! are carried as the text SPI already hands back (`types::temporal_cmp`'s
//! representation), compared either lexicographically (dates/timestamps) or
//! numerically (`is_numeric`), mirroring `AllenRelation::compute`. An empty
//! range (`from == until`) is treated as non-existent; `"infinity"` on the
//! upper bound is the canonical open-ended present and compares as `+∞`.

use std::cmp::Ordering;

use crate::types::temporal_cmp;

/// Whether a range's subtype has a canonical minimal step (integers, dates)
/// or is dense (timestamps, `numeric`). Only discrete domains make
/// adjacency-by-step meaningful for `covers_without_gaps` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Integer ranges (`int4range`/`int8range`) and date ranges: the
    /// minimal step is a well-defined "next value".
    DiscreteInt,
    DiscreteDate,
    /// `numrange`, timestamp ranges: no minimal step, only boundary
    /// equality counts as contiguous.
    Continuous,
}

impl Domain {
    /// Derive from the era's `range_subtype_category` ('N' numeric, 'D'
    /// date-like) the way `reader::build_until_expr` already branches, plus
    /// the int-vs-numeric distinction the teacher's single `is_numeric`
    /// bool collapses. `subtype` is the Postgres type name
    /// (`EraMetadata::range_subtype`, e.g. `"integer"`, `"bigint"`,
    /// `"numeric"`, `"date"`, `"timestamp with time zone"`).
    pub fn from_subtype(category: char, subtype: &str) -> Self {
        match category {
            'N' => match subtype {
                "integer" | "int4" | "bigint" | "int8" | "smallint" | "int2" => Self::DiscreteInt,
                _ => Self::Continuous,
            },
            'D' => match subtype {
                "date" => Self::DiscreteDate,
                _ => Self::Continuous,
            },
            _ => Self::Continuous,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::DiscreteInt)
    }
}

/// A half-open interval over a totally ordered domain, boundaries as text.
#[derive(Debug, Clone, Copy)]
pub struct Interval<'a> {
    pub from: &'a str,
    pub until: &'a str,
}

impl<'a> Interval<'a> {
    pub fn new(from: &'a str, until: &'a str) -> Self {
        Self { from, until }
    }

    /// Empty range (`from == until`, or malformed `from > until`) is treated
    /// as non-existent per spec §4.1.
    pub fn is_empty(&self, is_numeric: bool) -> bool {
        temporal_cmp(self.from, self.until, is_numeric) != Ordering::Less
    }

    pub fn contains_point(&self, point: &str, is_numeric: bool) -> bool {
        if self.is_empty(is_numeric) {
            return false;
        }
        temporal_cmp(self.from, point, is_numeric) != Ordering::Greater
            && temporal_cmp(point, self.until, is_numeric) == Ordering::Less
    }

    /// `self` entirely contains `other` (`other` may be empty; an empty
    /// interval is vacuously contained at any point within `self`, but per
    /// spec §4.1 empty ranges don't exist, so callers should filter those
    /// first — `covers_without_gaps` does via C2's NULL/malformed handling).
    pub fn contains_interval(&self, other: &Interval, is_numeric: bool) -> bool {
        temporal_cmp(self.from, other.from, is_numeric) != Ordering::Greater
            && temporal_cmp(other.until, self.until, is_numeric) != Ordering::Greater
    }

    /// Any shared instant between the two intervals (touching at a single
    /// boundary doesn't count — that's `adjacent`, not `overlaps`).
    pub fn overlaps(&self, other: &Interval, is_numeric: bool) -> bool {
        temporal_cmp(self.from, other.until, is_numeric) == Ordering::Less
            && temporal_cmp(other.from, self.until, is_numeric) == Ordering::Less
    }

    /// `self.until == other.from`: the intervals touch but do not overlap.
    pub fn adjacent(&self, other: &Interval, is_numeric: bool) -> bool {
        temporal_cmp(self.until, other.from, is_numeric) == Ordering::Equal
    }

    /// `self` entirely before `other`, with a gap (not merely meeting).
    pub fn precedes(&self, other: &Interval, is_numeric: bool) -> bool {
        temporal_cmp(self.until, other.from, is_numeric) == Ordering::Less
    }

    /// `self` entirely after `other`, with a gap.
    pub fn succeeds(&self, other: &Interval, is_numeric: bool) -> bool {
        temporal_cmp(other.until, self.from, is_numeric) == Ordering::Less
    }
}

/// Whether `until` and `next_from` describe the same instant (continuous
/// contiguity) or are exactly one canonical step apart (discrete
/// contiguity), per spec §4.2's "Contiguity must respect the discreteness
/// of the domain".
pub fn is_contiguous(until: &str, next_from: &str, domain: Domain) -> bool {
    if until == next_from {
        return true;
    }
    match domain {
        Domain::Continuous => false,
        Domain::DiscreteInt => succ_int(until).map_or(false, |s| s == next_from),
        Domain::DiscreteDate => succ_date(until).map_or(false, |s| s == next_from),
    }
}

/// `+∞`/`-∞` literal recognition, matching `types::parse_temporal_numeric`'s
/// `"infinity"`/`"-infinity"` spellings (the canonical text SPI produces for
/// an unbounded range endpoint).
pub fn is_pos_infinity(value: &str) -> bool {
    value == "infinity"
}

pub fn is_neg_infinity(value: &str) -> bool {
    value == "-infinity"
}

fn succ_int(value: &str) -> Option<String> {
    if is_pos_infinity(value) || is_neg_infinity(value) {
        return None;
    }
    let n: i64 = value.parse().ok()?;
    Some((n + 1).to_string())
}

/// One calendar day after `date_str` ("YYYY-MM-DD"). Inverse of
/// `sweep::date_minus_one`, duplicated rather than shared because the two
/// serve unrelated features (valid_to synchronization vs. coverage
/// contiguity) that happen to need the same calendar arithmetic.
fn succ_date(date_str: &str) -> Option<String> {
    if is_pos_infinity(date_str) || is_neg_infinity(date_str) {
        return None;
    }
    let parts: Vec<&str> = date_str.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let y: i32 = parts[0].parse().ok()?;
    let m: u32 = parts[1].parse().ok()?;
    let d: u32 = parts[2].parse().ok()?;
    let days_in_month = match m {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (y % 4 == 0 && y % 100 != 0) || (y % 400 == 0) {
                29
            } else {
                28
            }
        }
        _ => return None,
    };
    if d < days_in_month {
        Some(format!("{:04}-{:02}-{:02}", y, m, d + 1))
    } else {
        let (ny, nm) = if m < 12 { (y, m + 1) } else { (y + 1, 1) };
        Some(format!("{:04}-{:02}-{:02}", ny, nm, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_range_is_non_existent() {
        let r = Interval::new("2024-01-01", "2024-01-01");
        assert!(r.is_empty(false));
        let malformed = Interval::new("2024-06-01", "2024-01-01");
        assert!(malformed.is_empty(false));
    }

    #[test]
    fn contains_point_half_open() {
        let r = Interval::new("2024-01-01", "2024-06-01");
        assert!(r.contains_point("2024-01-01", false));
        assert!(!r.contains_point("2024-06-01", false));
        assert!(r.contains_point("2024-03-01", false));
    }

    #[test]
    fn contains_interval_boundaries() {
        let outer = Interval::new("2024-01-01", "2025-01-01");
        let inner = Interval::new("2024-06-01", "2024-09-01");
        assert!(outer.contains_interval(&inner, false));
        assert!(!inner.contains_interval(&outer, false));
        // Exact match counts as contained.
        assert!(outer.contains_interval(&outer, false));
    }

    #[test]
    fn adjacent_not_overlapping() {
        let a = Interval::new("2024-01-01", "2024-06-01");
        let b = Interval::new("2024-06-01", "2024-09-01");
        assert!(a.adjacent(&b, false));
        assert!(!a.overlaps(&b, false));
        assert!(!a.precedes(&b, false)); // meets, not a gap
    }

    #[test]
    fn precedes_requires_gap() {
        let a = Interval::new("2024-01-01", "2024-06-01");
        let b = Interval::new("2024-07-01", "2024-09-01");
        assert!(a.precedes(&b, false));
        assert!(b.succeeds(&a, false));
    }

    #[test]
    fn overlap_detection() {
        let a = Interval::new("2024-01-01", "2024-06-01");
        let b = Interval::new("2024-03-01", "2024-09-01");
        assert!(a.overlaps(&b, false));
        assert!(b.overlaps(&a, false));
    }

    #[test]
    fn infinity_is_open_ended_present() {
        let r = Interval::new("2024-01-01", "infinity");
        assert!(r.contains_point("2099-01-01", false));
        assert!(!r.is_empty(false));
    }

    #[test]
    fn discrete_date_contiguity_respects_minimal_step() {
        // Boundary equality always counts.
        assert!(is_contiguous("2024-06-01", "2024-06-01", Domain::DiscreteDate));
        // Two intervals [.., 2024-06-01) and [2024-06-02, ..) are contiguous
        // under date discreteness (no integer date exists between them).
        assert!(is_contiguous("2024-06-01", "2024-06-02", Domain::DiscreteDate));
        assert!(!is_contiguous("2024-06-01", "2024-06-03", Domain::DiscreteDate));
    }

    #[test]
    fn discrete_int_contiguity_respects_minimal_step() {
        assert!(is_contiguous("5", "5", Domain::DiscreteInt));
        assert!(is_contiguous("5", "6", Domain::DiscreteInt));
        assert!(!is_contiguous("5", "7", Domain::DiscreteInt));
    }

    #[test]
    fn continuous_domain_only_boundary_equality_counts() {
        assert!(is_contiguous("2024-06-01 00:00:00", "2024-06-01 00:00:00", Domain::Continuous));
        assert!(!is_contiguous("2024-06-01 00:00:00", "2024-06-01 00:00:01", Domain::Continuous));
    }

    #[test]
    fn succ_date_crosses_month_and_year_boundaries() {
        assert_eq!(succ_date("2024-01-31").as_deref(), Some("2024-02-01"));
        assert_eq!(succ_date("2024-12-31").as_deref(), Some("2025-01-01"));
        // 2024 is a leap year.
        assert_eq!(succ_date("2024-02-28").as_deref(), Some("2024-02-29"));
        assert_eq!(succ_date("2023-02-28").as_deref(), Some("2023-03-01"));
    }
}
