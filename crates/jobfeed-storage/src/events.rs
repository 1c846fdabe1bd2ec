//! Lifecycle event persistence and listing.

use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Days, NaiveDate, Utc};
use jobfeed_core::{DiffResult, EventKind, JobClassification, RawJobRecord, RunId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::{parse_timestamp, timestamp_text, JobStore};

pub const DEFAULT_EVENT_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_EVENT_PAGE_SIZE: u32 = 25;

const EVENT_COLUMNS: &str = "e.id, e.job_id, e.event_type, e.event_date, e.detected_at, e.run_id, \
     e.previous_state, e.new_state, e.facility_id, e.jobfamily_id, e.department_api_id, e.department_custom";

/// An event as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    pub job_id: String,
    pub event_type: EventKind,
    pub event_date: NaiveDate,
    pub detected_at: DateTime<Utc>,
    pub run_id: RunId,
    pub previous_state: Option<RawJobRecord>,
    pub new_state: Option<RawJobRecord>,
    pub facility_id: String,
    pub jobfamily_id: String,
    pub department_api_id: String,
    pub department_custom: String,
}

impl EventRow {
    pub(crate) fn from_row(row: &SqliteRow) -> anyhow::Result<Self> {
        let event_type: String = row.try_get("event_type")?;
        let event_date: String = row.try_get("event_date")?;
        let detected_at: String = row.try_get("detected_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            event_type: EventKind::from_str(&event_type).map_err(|err| anyhow!(err))?,
            event_date: NaiveDate::from_str(&event_date)
                .with_context(|| format!("invalid event date {event_date:?}"))?,
            detected_at: parse_timestamp(&detected_at)?,
            run_id: row.try_get("run_id")?,
            previous_state: decode_state(row.try_get("previous_state")?)?,
            new_state: decode_state(row.try_get("new_state")?)?,
            facility_id: row.try_get("facility_id")?,
            jobfamily_id: row.try_get("jobfamily_id")?,
            department_api_id: row.try_get("department_api_id")?,
            department_custom: row.try_get("department_custom")?,
        })
    }
}

fn decode_state(text: Option<String>) -> anyhow::Result<Option<RawJobRecord>> {
    text.map(|t| serde_json::from_str(&t).context("decoding stored job state"))
        .transpose()
}

fn encode_state(state: Option<&RawJobRecord>) -> anyhow::Result<Option<String>> {
    state
        .map(|s| serde_json::to_string(s).context("encoding job state"))
        .transpose()
}

/// An event with display names resolved from the facility registry and the live view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventListing {
    #[serde(flatten)]
    pub event: EventRow,
    pub facility_name: Option<String>,
    pub jobfamily_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub created: i64,
    pub modified: i64,
    pub offlined: i64,
}

impl EventSummary {
    pub fn count(&self, kind: EventKind) -> i64 {
        match kind {
            EventKind::Created => self.created,
            EventKind::Modified => self.modified,
            EventKind::Offlined => self.offlined,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    pub kind: Option<EventKind>,
    /// Look-back window in days; 0 selects [`DEFAULT_EVENT_WINDOW_DAYS`].
    pub days: u32,
    pub page: u32,
    pub page_size: u32,
}

impl EventQuery {
    pub fn days(&self) -> u32 {
        if self.days == 0 {
            DEFAULT_EVENT_WINDOW_DAYS
        } else {
            self.days
        }
    }

    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn page_size(&self) -> u32 {
        if self.page_size == 0 {
            DEFAULT_EVENT_PAGE_SIZE
        } else {
            self.page_size.min(500)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<EventListing>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub since: NaiveDate,
    /// Counts per kind over the whole window, ignoring the kind filter.
    pub summary: EventSummary,
}

impl JobStore {
    /// Stores every event of `diff` in one transaction. Classification
    /// fields come from the new state, or the previous one for offlined jobs.
    pub async fn persist_events(&self, diff: &DiffResult, detected_at: DateTime<Utc>) -> anyhow::Result<usize> {
        if diff.is_empty() {
            return Ok(0);
        }
        let detected_at = timestamp_text(detected_at);
        let mut tx = self.pool.begin().await.context("starting event transaction")?;
        for event in diff.iter() {
            let classification = event
                .reference_state()
                .map(JobClassification::of)
                .unwrap_or_default();
            sqlx::query(
                r#"
                INSERT INTO events (job_id, event_type, event_date, detected_at, run_id, previous_state, new_state,
                                    facility_id, jobfamily_id, department_api_id, department_custom)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )
            .bind(&event.job_id)
            .bind(event.event_type.as_str())
            .bind(event.event_date.to_string())
            .bind(&detected_at)
            .bind(event.run_id)
            .bind(encode_state(event.previous_state.as_ref())?)
            .bind(encode_state(event.new_state.as_ref())?)
            .bind(&classification.facility_id)
            .bind(&classification.jobfamily_id)
            .bind(&classification.department_api_id)
            .bind(&classification.department_custom)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("storing {} event for job {}", event.event_type, event.job_id))?;
        }
        tx.commit().await.context("committing events")?;
        debug!(count = diff.total(), "events persisted");
        Ok(diff.total())
    }

    /// Events of the last `query.days()` days up to `today`, newest first.
    pub async fn list_events(&self, query: &EventQuery, today: NaiveDate) -> anyhow::Result<EventPage> {
        let since = today
            .checked_sub_days(Days::new(u64::from(query.days())))
            .unwrap_or(NaiveDate::MIN);
        let since_text = since.to_string();
        let page = query.page();
        let page_size = query.page_size();

        let summary_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT event_type, COUNT(*) FROM events WHERE event_date >= ?1 GROUP BY event_type",
        )
        .bind(&since_text)
        .fetch_all(&self.pool)
        .await
        .context("summarizing events")?;
        let mut summary = EventSummary::default();
        for (kind, count) in summary_rows {
            match kind.parse::<EventKind>() {
                Ok(EventKind::Created) => summary.created = count,
                Ok(EventKind::Modified) => summary.modified = count,
                Ok(EventKind::Offlined) => summary.offlined = count,
                Err(_) => {}
            }
        }
        let total = match query.kind {
            Some(kind) => summary.count(kind),
            None => summary.created + summary.modified + summary.offlined,
        };

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            r#"
            SELECT {EVENT_COLUMNS},
                COALESCE(
                    (SELECT f.canonical_name FROM facilities f WHERE f.facility_id = e.facility_id),
                    (SELECT MIN(c.facility_name) FROM jobs_current c WHERE c.facility_id = e.facility_id)
                ) AS facility_name,
                (SELECT MIN(c.jobfamily_name) FROM jobs_current c WHERE c.jobfamily_id = e.jobfamily_id) AS jobfamily_name
            FROM events e
            WHERE e.event_date >= "#
        ));
        select.push_bind(since_text);
        if let Some(kind) = query.kind {
            select.push(" AND e.event_type = ").push_bind(kind.as_str());
        }
        select
            .push(" ORDER BY e.event_date DESC, e.id DESC LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(i64::from(page - 1) * i64::from(page_size));

        let rows = select.build().fetch_all(&self.pool).await.context("listing events")?;
        let events = rows
            .iter()
            .map(|row| {
                Ok(EventListing {
                    event: EventRow::from_row(row)?,
                    facility_name: non_empty(row.try_get("facility_name")?),
                    jobfamily_name: non_empty(row.try_get("jobfamily_name")?),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(EventPage {
            events,
            total,
            page,
            page_size,
            since,
            summary,
        })
    }

    /// Full event history of one job, oldest first.
    pub async fn job_events(&self, job_id: &str) -> anyhow::Result<Vec<EventRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events e WHERE e.job_id = ?1 ORDER BY e.event_date, e.id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading events of job {job_id}"))?;
        rows.iter().map(EventRow::from_row).collect()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job, record};
    use chrono::TimeZone;
    use jobfeed_core::compute_diff;
    use serde_json::json;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, 6, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn events_keep_states_and_classification() {
        let store = JobStore::in_memory().await.unwrap();
        let previous = vec![record(json!({
            "Stellennummer": "A", "Aenderungsdatum": "1", "Einrichtung": "Kita Nord",
            "Stellenbezeichnung-IDs": {"112": "Erzieher/in"}, "Fachbereich-IDs": {"30": "Kita"}
        }))];
        let current = vec![job("B", "1")];
        let diff = compute_diff(&previous, &current, 5, date(2));
        assert_eq!(store.persist_events(&diff, at(2)).await.unwrap(), 2);

        let history = store.job_events("A").await.unwrap();
        assert_eq!(history.len(), 1);
        let offlined = &history[0];
        assert_eq!(offlined.event_type, EventKind::Offlined);
        assert!(offlined.new_state.is_none());
        assert_eq!(offlined.previous_state.as_ref(), Some(&previous[0]));
        assert_eq!(offlined.jobfamily_id, "112");
        assert_eq!(offlined.department_api_id, "30");
        assert_eq!(offlined.run_id, 5);
        assert_eq!(offlined.detected_at, at(2));

        let created = &store.job_events("B").await.unwrap()[0];
        assert_eq!(created.event_type, EventKind::Created);
        assert!(created.previous_state.is_none());
    }

    #[tokio::test]
    async fn listing_filters_by_window_and_kind() {
        let store = JobStore::in_memory().await.unwrap();
        let old = compute_diff(&[], &[job("OLD", "1")], 1, date(1));
        store.persist_events(&old, at(1)).await.unwrap();
        let recent = compute_diff(
            &[job("A", "1"), job("B", "1")],
            &[job("A", "2"), job("C", "1")],
            2,
            date(20),
        );
        store.persist_events(&recent, at(20)).await.unwrap();

        let query = EventQuery {
            days: 7,
            ..EventQuery::default()
        };
        let page = store.list_events(&query, date(21)).await.unwrap();
        assert_eq!(page.since, date(14));
        assert_eq!(page.total, 3);
        assert_eq!(page.summary, EventSummary { created: 1, modified: 1, offlined: 1 });

        let page = store.list_events(&EventQuery::default(), date(21)).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.events.last().unwrap().event.job_id, "OLD");

        let only_modified = EventQuery {
            kind: Some(EventKind::Modified),
            ..EventQuery::default()
        };
        let page = store.list_events(&only_modified, date(21)).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].event.job_id, "A");
        assert_eq!(page.summary.created, 2);
    }

    #[tokio::test]
    async fn listing_resolves_names_from_the_live_view() {
        let store = JobStore::in_memory().await.unwrap();
        let rec = record(json!({
            "Stellennummer": "A", "Einrichtung": "Kita Nord", "Ort": "Wesel",
            "Stellenbezeichnung-IDs": {"112": "Erzieher/in"}
        }));
        let diff = compute_diff(&[], std::slice::from_ref(&rec), 1, date(2));
        store.persist_events(&diff, at(2)).await.unwrap();
        store.publish_current(1, &[rec], at(2)).await.unwrap();

        let page = store.list_events(&EventQuery::default(), date(2)).await.unwrap();
        assert_eq!(page.events[0].facility_name.as_deref(), Some("Kita Nord"));
        assert_eq!(page.events[0].jobfamily_name.as_deref(), Some("Erzieher/in"));
    }

    #[tokio::test]
    async fn empty_diff_writes_nothing() {
        let store = JobStore::in_memory().await.unwrap();
        let diff = compute_diff(&[job("A", "1")], &[job("A", "1")], 1, date(2));
        assert_eq!(store.persist_events(&diff, at(2)).await.unwrap(), 0);
        assert_eq!(store.list_events(&EventQuery::default(), date(2)).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn pages_are_bounded() {
        let store = JobStore::in_memory().await.unwrap();
        let current: Vec<_> = (0..30).map(|i| job(&format!("J{i:02}"), "1")).collect();
        let diff = compute_diff(&[], &current, 1, date(2));
        store.persist_events(&diff, at(2)).await.unwrap();

        let first = store.list_events(&EventQuery::default(), date(2)).await.unwrap();
        assert_eq!(first.events.len(), 25);
        assert_eq!(first.total, 30);
        let second = store
            .list_events(&EventQuery { page: 2, ..EventQuery::default() }, date(2))
            .await
            .unwrap();
        assert_eq!(second.events.len(), 5);
    }
}
