//! Run snapshots: one row per calendar date, upserted in place.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use chrono::{DateTime, NaiveDate, Utc};
use jobfeed_core::{RawJobRecord, RunId};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, warn};

use crate::{parse_timestamp, sha256_hex, timestamp_text, JobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow!("unknown run status {other:?}")),
        }
    }
}

/// A run as stored, without its snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub run_date: NaiveDate,
    pub run_timestamp: DateTime<Utc>,
    pub snapshot_checksum: String,
    pub jobs_count: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl RunRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> anyhow::Result<Self> {
        let run_date: String = row.try_get("run_date")?;
        let run_timestamp: String = row.try_get("run_timestamp")?;
        let status: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            run_date: NaiveDate::from_str(&run_date)
                .with_context(|| format!("invalid run date {run_date:?}"))?,
            run_timestamp: parse_timestamp(&run_timestamp)?,
            snapshot_checksum: row.try_get("snapshot_checksum")?,
            jobs_count: row.try_get("jobs_count")?,
            status: status.parse()?,
            error_message: row.try_get("error_message")?,
        })
    }
}

/// A run about to be persisted.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub run_date: NaiveDate,
    pub run_timestamp: DateTime<Utc>,
    pub snapshot: &'a [RawJobRecord],
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl<'a> NewRun<'a> {
    pub fn success(run_timestamp: DateTime<Utc>, snapshot: &'a [RawJobRecord]) -> Self {
        Self {
            run_date: run_timestamp.date_naive(),
            run_timestamp,
            snapshot,
            status: RunStatus::Success,
            error_message: None,
        }
    }

    /// A failed attempt carries no snapshot and a record count of zero.
    pub fn failed(run_timestamp: DateTime<Utc>, error_message: impl Into<String>) -> Self {
        Self {
            run_date: run_timestamp.date_naive(),
            run_timestamp,
            snapshot: &[],
            status: RunStatus::Failed,
            error_message: Some(error_message.into()),
        }
    }
}

impl JobStore {
    /// Upserts the run for `run.run_date` and returns its id.
    ///
    /// An existing row for the same date is updated in place and keeps its id,
    /// so events that reference it stay valid. A failed attempt never
    /// overwrites a successful snapshot of the same date; the id of the kept
    /// row is returned in that case.
    pub async fn persist_run(&self, run: NewRun<'_>) -> anyhow::Result<RunId> {
        let snapshot_json = serde_json::to_string(run.snapshot).context("serializing snapshot")?;
        let checksum = match run.status {
            RunStatus::Success => sha256_hex(snapshot_json.as_bytes()),
            RunStatus::Failed => String::new(),
        };
        let run_date = run.run_date.to_string();

        let id: Option<RunId> = sqlx::query_scalar(
            r#"
            INSERT INTO runs (run_date, run_timestamp, snapshot_checksum, snapshot_json, jobs_count, status, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(run_date) DO UPDATE SET
                run_timestamp = excluded.run_timestamp,
                snapshot_checksum = excluded.snapshot_checksum,
                snapshot_json = excluded.snapshot_json,
                jobs_count = excluded.jobs_count,
                status = excluded.status,
                error_message = excluded.error_message
            WHERE runs.status <> 'success' OR excluded.status = 'success'
            RETURNING id
            "#,
        )
        .bind(&run_date)
        .bind(timestamp_text(run.run_timestamp))
        .bind(&checksum)
        .bind(&snapshot_json)
        .bind(run.snapshot.len() as i64)
        .bind(run.status.as_str())
        .bind(run.error_message.as_deref())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("persisting run for {run_date}"))?;

        match id {
            Some(id) => {
                debug!(run_id = id, %run_date, status = %run.status, jobs = run.snapshot.len(), "run persisted");
                Ok(id)
            }
            None => {
                warn!(%run_date, "kept the successful snapshot of this date over a failed attempt");
                sqlx::query_scalar("SELECT id FROM runs WHERE run_date = ?1")
                    .bind(&run_date)
                    .fetch_one(&self.pool)
                    .await
                    .with_context(|| format!("loading run id for {run_date}"))
            }
        }
    }

    /// Most recent successful run and its records.
    pub async fn last_successful_snapshot(&self) -> anyhow::Result<Option<(RunRecord, Vec<RawJobRecord>)>> {
        let row = sqlx::query(
            r#"
            SELECT id, run_date, run_timestamp, snapshot_checksum, jobs_count, status, error_message, snapshot_json
            FROM runs
            WHERE status = 'success'
            ORDER BY run_date DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("loading last successful snapshot")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run = RunRecord::from_row(&row)?;
        let snapshot_json: String = row.try_get("snapshot_json")?;
        let records: Vec<RawJobRecord> = serde_json::from_str(&snapshot_json)
            .with_context(|| format!("decoding snapshot of run {}", run.id))?;
        Ok(Some((run, records)))
    }

    /// Newest runs first.
    pub async fn recent_runs(&self, limit: u32) -> anyhow::Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_date, run_timestamp, snapshot_checksum, jobs_count, status, error_message
            FROM runs
            ORDER BY run_date DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("listing runs")?;
        rows.iter().map(RunRecord::from_row).collect()
    }

    pub async fn run_by_id(&self, id: RunId) -> anyhow::Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, run_date, run_timestamp, snapshot_checksum, jobs_count, status, error_message
            FROM runs WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading run {id}"))?;
        row.as_ref().map(RunRecord::from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::job;
    use chrono::TimeZone;

    fn day(d: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn same_day_resync_keeps_the_run_id() {
        let store = JobStore::in_memory().await.unwrap();
        let first = vec![job("A", "1")];
        let second = vec![job("A", "2"), job("B", "1")];

        let id1 = store.persist_run(NewRun::success(day(1, 6), &first)).await.unwrap();
        let id2 = store.persist_run(NewRun::success(day(1, 18), &second)).await.unwrap();
        assert_eq!(id1, id2);

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].jobs_count, 2);
        assert_eq!(runs[0].run_timestamp, day(1, 18));

        let (run, records) = store.last_successful_snapshot().await.unwrap().unwrap();
        assert_eq!(run.id, id1);
        assert_eq!(records, second);
        assert_eq!(
            run.snapshot_checksum,
            sha256_hex(serde_json::to_string(&second).unwrap().as_bytes())
        );
    }

    #[tokio::test]
    async fn failed_attempt_does_not_replace_successful_snapshot() {
        let store = JobStore::in_memory().await.unwrap();
        let records = vec![job("A", "1")];
        let id = store.persist_run(NewRun::success(day(1, 6), &records)).await.unwrap();
        let failed_id = store
            .persist_run(NewRun::failed(day(1, 18), "http status 503"))
            .await
            .unwrap();
        assert_eq!(id, failed_id);

        let run = store.run_by_id(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.jobs_count, 1);
    }

    #[tokio::test]
    async fn failed_run_on_a_new_date_is_recorded_with_zero_jobs() {
        let store = JobStore::in_memory().await.unwrap();
        let records = vec![job("A", "1")];
        store.persist_run(NewRun::success(day(1, 6), &records)).await.unwrap();
        let id = store
            .persist_run(NewRun::failed(day(2, 6), "feed body is not valid JSON"))
            .await
            .unwrap();

        let run = store.run_by_id(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.jobs_count, 0);
        assert_eq!(run.error_message.as_deref(), Some("feed body is not valid JSON"));

        let (last, _) = store.last_successful_snapshot().await.unwrap().unwrap();
        assert_eq!(last.run_date, day(1, 6).date_naive());

        // A later success on the failed date takes over the same row.
        let retry = store.persist_run(NewRun::success(day(2, 18), &records)).await.unwrap();
        assert_eq!(retry, id);
        assert_eq!(store.run_by_id(id).await.unwrap().unwrap().status, RunStatus::Success);
    }

    #[tokio::test]
    async fn no_snapshot_before_first_success() {
        let store = JobStore::in_memory().await.unwrap();
        assert!(store.last_successful_snapshot().await.unwrap().is_none());
        store.persist_run(NewRun::failed(day(1, 6), "boom")).await.unwrap();
        assert!(store.last_successful_snapshot().await.unwrap().is_none());
    }
}
