//! Snapshot diffing: classifies every job identity into created, modified or
//! offlined between two record collections.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{RawJobRecord, RunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Modified,
    Offlined,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Modified, EventKind::Offlined];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Offlined => "offlined",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(EventKind::Created),
            "modified" => Ok(EventKind::Modified),
            "offlined" => Ok(EventKind::Offlined),
            other => Err(format!("unknown event kind {other:?}")),
        }
    }
}

/// One detected transition of a job between two snapshots.
///
/// `created` has no previous state, `offlined` has no new state, `modified`
/// has both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub job_id: String,
    pub event_type: EventKind,
    pub event_date: NaiveDate,
    pub previous_state: Option<RawJobRecord>,
    pub new_state: Option<RawJobRecord>,
    pub run_id: RunId,
}

impl LifecycleEvent {
    /// The state classification fields are copied from: new if present, else previous.
    pub fn reference_state(&self) -> Option<&RawJobRecord> {
        self.new_state.as_ref().or(self.previous_state.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub created: Vec<LifecycleEvent>,
    pub modified: Vec<LifecycleEvent>,
    pub offlined: Vec<LifecycleEvent>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> usize {
        self.created.len() + self.modified.len() + self.offlined.len()
    }

    pub fn bucket(&self, kind: EventKind) -> &[LifecycleEvent] {
        match kind {
            EventKind::Created => &self.created,
            EventKind::Modified => &self.modified,
            EventKind::Offlined => &self.offlined,
        }
    }

    /// All events, created first, then modified, then offlined.
    pub fn iter(&self) -> impl Iterator<Item = &LifecycleEvent> {
        self.created.iter().chain(&self.modified).chain(&self.offlined)
    }
}

/// Diffs `previous` against `current`.
///
/// Records without an identity are dropped from both sides. A job present on
/// both sides counts as modified only when both change markers are non-empty
/// and differ as strings; no structural comparison of the records is made.
/// When a collection repeats an identity the last occurrence wins. Buckets are
/// ordered by job id, so the result does not depend on input order.
pub fn compute_diff(
    previous: &[RawJobRecord],
    current: &[RawJobRecord],
    run_id: RunId,
    event_date: NaiveDate,
) -> DiffResult {
    let previous = index_by_job_id(previous);
    let current = index_by_job_id(current);
    let mut result = DiffResult::default();

    for (job_id, new_job) in &current {
        match previous.get(job_id) {
            None => result.created.push(LifecycleEvent {
                job_id: job_id.clone(),
                event_type: EventKind::Created,
                event_date,
                previous_state: None,
                new_state: Some((*new_job).clone()),
                run_id,
            }),
            Some(old_job) if has_modified(old_job, new_job) => result.modified.push(LifecycleEvent {
                job_id: job_id.clone(),
                event_type: EventKind::Modified,
                event_date,
                previous_state: Some((*old_job).clone()),
                new_state: Some((*new_job).clone()),
                run_id,
            }),
            Some(_) => {}
        }
    }

    for (job_id, old_job) in &previous {
        if !current.contains_key(job_id) {
            result.offlined.push(LifecycleEvent {
                job_id: job_id.clone(),
                event_type: EventKind::Offlined,
                event_date,
                previous_state: Some((*old_job).clone()),
                new_state: None,
                run_id,
            });
        }
    }

    result
}

fn index_by_job_id(records: &[RawJobRecord]) -> BTreeMap<String, &RawJobRecord> {
    records
        .iter()
        .filter_map(|record| record.job_id().map(|id| (id, record)))
        .collect()
}

fn has_modified(old_job: &RawJobRecord, new_job: &RawJobRecord) -> bool {
    match (old_job.change_marker(), new_job.change_marker()) {
        (Some(old), Some(new)) => old != new,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn job(id: &str, marker: &str) -> RawJobRecord {
        record(json!({"Stellennummer": id, "Aenderungsdatum": marker}))
    }

    fn ids(events: &[LifecycleEvent]) -> Vec<&str> {
        events.iter().map(|e| e.job_id.as_str()).collect()
    }

    #[test]
    fn simple_modification() {
        let diff = compute_diff(&[job("A", "1")], &[job("A", "2")], 7, day());
        assert!(diff.created.is_empty());
        assert!(diff.offlined.is_empty());
        assert_eq!(ids(&diff.modified), vec!["A"]);
        let event = &diff.modified[0];
        assert_eq!(event.previous_state, Some(job("A", "1")));
        assert_eq!(event.new_state, Some(job("A", "2")));
        assert_eq!(event.run_id, 7);
    }

    #[test]
    fn full_replacement() {
        let diff = compute_diff(&[job("A", "1")], &[job("B", "1")], 3, day());
        assert_eq!(ids(&diff.created), vec!["B"]);
        assert_eq!(ids(&diff.offlined), vec!["A"]);
        assert!(diff.modified.is_empty());
        assert!(diff.created[0].previous_state.is_none());
        assert!(diff.offlined[0].new_state.is_none());
    }

    #[test]
    fn identical_snapshots_produce_no_events() {
        let snapshot = vec![job("A", "1"), job("B", "5"), job("C", "")];
        assert!(compute_diff(&snapshot, &snapshot, 1, day()).is_empty());
    }

    #[test]
    fn missing_or_empty_markers_never_count_as_modified() {
        let previous = vec![job("A", ""), record(json!({"Stellennummer": "B"})), job("C", "1")];
        let current = vec![job("A", "9"), job("B", "9"), record(json!({"Stellennummer": "C"}))];
        assert!(compute_diff(&previous, &current, 1, day()).is_empty());
    }

    #[test]
    fn numeric_and_string_markers_compare_as_text() {
        let previous = vec![record(json!({"Stellennummer": 1, "Aenderungsdatum": 1700000000}))];
        let current = vec![record(json!({"Stellennummer": "1", "Aenderungsdatum": "1700000000"}))];
        assert!(compute_diff(&previous, &current, 1, day()).is_empty());
    }

    #[test]
    fn records_without_identity_are_ignored() {
        let previous = vec![record(json!({"Titel": "no id"})), job("A", "1")];
        let current = vec![record(json!({"Stellennummer": "", "Titel": "blank"})), job("A", "1")];
        assert!(compute_diff(&previous, &current, 1, day()).is_empty());
    }

    #[test]
    fn every_identity_lands_in_at_most_one_bucket() {
        let previous = vec![job("A", "1"), job("B", "1"), job("C", "1"), job("D", "1")];
        let current = vec![job("B", "2"), job("C", "1"), job("E", "1"), job("F", "1")];
        let diff = compute_diff(&previous, &current, 1, day());

        assert_eq!(ids(&diff.created), vec!["E", "F"]);
        assert_eq!(ids(&diff.modified), vec!["B"]);
        assert_eq!(ids(&diff.offlined), vec!["A", "D"]);

        let mut seen = BTreeSet::new();
        for event in diff.iter() {
            assert!(seen.insert(event.job_id.clone()), "{} appears twice", event.job_id);
            assert_eq!(event.event_date, day());
        }
    }

    #[test]
    fn result_is_independent_of_input_order() {
        let previous = vec![job("A", "1"), job("B", "1"), job("C", "1")];
        let current = vec![job("D", "1"), job("B", "2"), job("E", "1")];
        let mut previous_rev = previous.clone();
        previous_rev.reverse();
        let mut current_rev = current.clone();
        current_rev.reverse();
        assert_eq!(
            compute_diff(&previous, &current, 1, day()),
            compute_diff(&previous_rev, &current_rev, 1, day())
        );
    }

    #[test]
    fn event_kind_round_trips_through_text() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert!("deleted".parse::<EventKind>().is_err());
    }
}
