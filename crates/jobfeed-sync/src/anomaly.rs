//! Advisory checks run around a publish. Nothing here blocks a sync.

use chrono::{DateTime, Utc};
use jobfeed_storage::FacilityGroup;
use serde::{Deserialize, Serialize};

/// Share of the previous snapshot that may go offline in one sync before an
/// anomaly is recorded.
pub const MASS_DISAPPEARANCE_THRESHOLD: f64 = 0.5;

pub const MAX_COLLISION_EXAMPLES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub detected_at: DateTime<Utc>,
    pub kind: String,
    pub details: String,
    pub offlined: usize,
    pub previous_total: usize,
}

/// Returns an anomaly when strictly more than half of `previous_total` jobs
/// went offline.
pub fn mass_disappearance(previous_total: usize, offlined: usize, now: DateTime<Utc>) -> Option<Anomaly> {
    if previous_total == 0 {
        return None;
    }
    let ratio = offlined as f64 / previous_total as f64;
    if ratio <= MASS_DISAPPEARANCE_THRESHOLD {
        return None;
    }
    Some(Anomaly {
        detected_at: now,
        kind: "mass_disappearance".to_string(),
        details: format!(
            "{offlined} of {previous_total} jobs ({:.0}%) went offline in one sync",
            ratio * 100.0
        ),
        offlined,
        previous_total,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollisionReport {
    pub detected_at: DateTime<Utc>,
    pub count: usize,
    pub examples: Vec<FacilityGroup>,
}

/// Summarises colliding facility ids; `None` when there are none.
///
/// Examples are the groups with the most variants first, ties broken by id.
pub fn collision_report(mut groups: Vec<FacilityGroup>, now: DateTime<Utc>) -> Option<CollisionReport> {
    if groups.is_empty() {
        return None;
    }
    let count = groups.len();
    groups.sort_by(|a, b| {
        b.variants
            .len()
            .cmp(&a.variants.len())
            .then_with(|| a.facility_id.cmp(&b.facility_id))
    });
    groups.truncate(MAX_COLLISION_EXAMPLES);
    Some(CollisionReport {
        detected_at: now,
        count,
        examples: groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobfeed_storage::FacilityVariant;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap()
    }

    fn group(id: &str, variants: usize) -> FacilityGroup {
        FacilityGroup {
            facility_id: id.to_string(),
            variants: (0..variants)
                .map(|i| FacilityVariant {
                    name: format!("Kita {i}"),
                    address: "Hauptstr. 1, 10115 Berlin".to_string(),
                    job_count: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn half_offline_is_not_an_anomaly() {
        assert!(mass_disappearance(4, 2, now()).is_none());
        assert!(mass_disappearance(0, 0, now()).is_none());
    }

    #[test]
    fn more_than_half_offline_is_recorded() {
        let anomaly = mass_disappearance(1, 1, now()).unwrap();
        assert_eq!(anomaly.kind, "mass_disappearance");
        assert_eq!(anomaly.offlined, 1);
        assert_eq!(anomaly.previous_total, 1);
        assert!(anomaly.details.contains("100%"));
    }

    #[test]
    fn collision_examples_are_bounded_and_ordered() {
        assert!(collision_report(Vec::new(), now()).is_none());

        let mut groups: Vec<_> = (0..25).map(|i| group(&format!("f{i:02}"), 2)).collect();
        groups.push(group("zz", 4));
        let report = collision_report(groups, now()).unwrap();
        assert_eq!(report.count, 26);
        assert_eq!(report.examples.len(), MAX_COLLISION_EXAMPLES);
        assert_eq!(report.examples[0].facility_id, "zz");
        assert_eq!(report.examples[1].facility_id, "f00");
    }
}
