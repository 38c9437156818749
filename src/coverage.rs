//! C2 — `covers_without_gaps` streaming coverage aggregate (spec §4.2).
//!
//! Mirrors the watermark-sweep `sweep.rs` already runs for eclipse detection
//! (`multirange_add`/`multirange_contains`, see the eclipse-detection pass
//! in `plan_match_source_rows`) but generalized into a public SQL aggregate:
//! one state-transition call per contributing child row, a single finalizer
//! that checks the merged multirange covers the target range with no gaps.
//!
//! Unlike the sweep's internal use, the target range is carried in every
//! transition call (the standard `covers_without_gaps`-style contract: a
//! caller `LEFT JOIN`s target rows against child rows so that a target with
//! zero children still produces one aggregate input row, with a NULL child
//! range, per spec §4.2's "a target interval with no contributing child rows
//! never silently reports covered"). `child_from`/`child_until` are nullable
//! for exactly that reason; `target_from`/`target_until` are not.

use pgrx::prelude::*;
use serde::{Deserialize, Serialize};

use crate::range::{is_contiguous, Domain, Interval};

/// Domain discriminant passed over SQL as a plain integer — matches
/// `range::Domain` one-for-one. Kept separate from the enum itself so the
/// aggregate's SQL signature (`integer`) is simple and storable in a
/// transition-state column without a custom enum type.
fn domain_from_code(code: i32) -> Domain {
    match code {
        1 => Domain::DiscreteInt,
        2 => Domain::DiscreteDate,
        _ => Domain::Continuous,
    }
}

/// Transition state for `covers_without_gaps`. JSON-serialized by pgrx's
/// default `PostgresType` strategy, the same "just serde it" approach the
/// teacher uses for `JsonB` plan columns rather than a hand-rolled binary
/// `inoutfuncs` layout.
#[derive(Debug, Clone, Serialize, Deserialize, PostgresType)]
pub struct CoverageState {
    /// Sorted, merged, non-overlapping (and non-contiguous, once merged)
    /// child intervals accumulated so far.
    intervals: Vec<(String, String)>,
    target_from: String,
    target_until: String,
    is_numeric: bool,
    domain_code: i32,
}

impl CoverageState {
    fn new(target_from: String, target_until: String, is_numeric: bool, domain_code: i32) -> Self {
        Self {
            intervals: Vec::new(),
            target_from,
            target_until,
            is_numeric,
            domain_code,
        }
    }

    fn domain(&self) -> Domain {
        domain_from_code(self.domain_code)
    }

    /// Insert `[from, until)`, keeping `intervals` sorted and merging any
    /// overlap or discreteness-aware adjacency, exactly as
    /// `sweep::multirange_add` merges but using `range::is_contiguous`
    /// instead of plain boundary equality so an integer/date domain treats
    /// `[.., 5)` + `[6, ..)` as one contiguous block (spec §4.2).
    fn add(&mut self, from: String, until: String) {
        if Interval::new(&from, &until).is_empty(self.is_numeric) {
            return;
        }
        self.intervals.push((from, until));
        self.intervals
            .sort_by(|a, b| crate::types::temporal_cmp(&a.0, &b.0, self.is_numeric));

        let domain = self.domain();
        let mut merged: Vec<(String, String)> = Vec::new();
        for interval in self.intervals.drain(..) {
            if let Some(last) = merged.last_mut() {
                let touches = crate::types::temporal_cmp(&interval.0, &last.1, self.is_numeric)
                    != std::cmp::Ordering::Greater
                    || is_contiguous(&last.1, &interval.0, domain);
                if touches {
                    if crate::types::temporal_cmp(&interval.1, &last.1, self.is_numeric)
                        == std::cmp::Ordering::Greater
                    {
                        last.1 = interval.1;
                    }
                    continue;
                }
            }
            merged.push(interval);
        }
        self.intervals = merged;
    }

    /// `true` iff the merged intervals span `[target_from, target_until)`
    /// with no gap, where "no gap" is domain-aware: two blocks separated by
    /// less than one discrete step still count as touching.
    fn covers(&self) -> bool {
        let target = Interval::new(&self.target_from, &self.target_until);
        if target.is_empty(self.is_numeric) {
            // An empty target is vacuously covered.
            return true;
        }
        self.intervals
            .iter()
            .any(|(f, u)| Interval::new(f, u).contains_interval(&target, self.is_numeric))
    }
}

#[pg_extern(immutable, parallel_safe)]
fn covers_without_gaps_transition(
    state: Option<CoverageState>,
    child_from: Option<&str>,
    child_until: Option<&str>,
    target_from: &str,
    target_until: &str,
    is_numeric: bool,
    domain_code: i32,
) -> CoverageState {
    let mut state = state.unwrap_or_else(|| {
        CoverageState::new(
            target_from.to_string(),
            target_until.to_string(),
            is_numeric,
            domain_code,
        )
    });
    if let (Some(from), Some(until)) = (child_from, child_until) {
        state.add(from.to_string(), until.to_string());
    }
    state
}

#[pg_extern(immutable, parallel_safe)]
fn covers_without_gaps_final(state: Option<CoverageState>) -> bool {
    state.map(|s| s.covers()).unwrap_or(false)
}

extension_sql!(
    r#"
    CREATE AGGREGATE temporal.covers_without_gaps(
        child_from text,
        child_until text,
        target_from text,
        target_until text,
        is_numeric boolean,
        domain_code integer
    ) (
        SFUNC = covers_without_gaps_transition,
        STYPE = CoverageState,
        FINALFUNC = covers_without_gaps_final,
        PARALLEL = SAFE
    );
    "#,
    name = "covers_without_gaps_aggregate",
    requires = [covers_without_gaps_transition, covers_without_gaps_final]
);

#[cfg(test)]
mod tests {
    use super::*;

    fn state(target_from: &str, target_until: &str) -> CoverageState {
        CoverageState::new(target_from.to_string(), target_until.to_string(), false, 2)
    }

    #[test]
    fn fully_covered_no_gap() {
        let mut s = state("2024-01-01", "2025-01-01");
        s.add("2024-01-01".into(), "2024-06-01".into());
        s.add("2024-06-01".into(), "2025-01-01".into());
        assert!(s.covers());
    }

    #[test]
    fn gap_not_covered() {
        let mut s = state("2024-01-01", "2025-01-01");
        s.add("2024-01-01".into(), "2024-06-01".into());
        s.add("2024-07-01".into(), "2025-01-01".into());
        assert!(!s.covers());
    }

    #[test]
    fn discrete_date_one_day_gap_still_covers() {
        // [.., 2024-06-01) and [2024-06-02, ..) are contiguous for dates:
        // there is no valid date strictly between them.
        let mut s = state("2024-01-01", "2025-01-01");
        s.add("2024-01-01".into(), "2024-06-01".into());
        s.add("2024-06-02".into(), "2025-01-01".into());
        assert!(s.covers());
    }

    #[test]
    fn overlapping_children_still_cover() {
        let mut s = state("2024-01-01", "2025-01-01");
        s.add("2024-01-01".into(), "2024-08-01".into());
        s.add("2024-05-01".into(), "2025-01-01".into());
        assert!(s.covers());
    }

    #[test]
    fn no_children_does_not_cover_nonempty_target() {
        let s = state("2024-01-01", "2025-01-01");
        assert!(!s.covers());
    }

    #[test]
    fn empty_target_is_vacuously_covered() {
        let s = state("2024-01-01", "2024-01-01");
        assert!(s.covers());
    }

    #[test]
    fn out_of_order_inputs_still_merge_correctly() {
        let mut s = state("2024-01-01", "2025-01-01");
        s.add("2024-09-01".into(), "2025-01-01".into());
        s.add("2024-01-01".into(), "2024-03-01".into());
        s.add("2024-03-01".into(), "2024-09-01".into());
        assert!(s.covers());
    }
}
