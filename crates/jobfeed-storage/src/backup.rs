//! Full-fidelity JSON export and import of the persistent tables.

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobfeed_core::JobProjection;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;
use tracing::info;

use crate::events::EventRow;
use crate::publish::{bind_job, insert_job_sql};
use crate::query::projection_from_row;
use crate::runs::RunRecord;
use crate::{meta_keys, timestamp_text, JobStore, CURRENT_TABLE, JOB_COLUMNS};

pub const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("unsupported backup format version {found} (expected {BACKUP_FORMAT_VERSION})")]
    UnsupportedVersion { found: u64 },
    #[error("malformed backup document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("database error during import: {0:#}")]
    Database(#[from] anyhow::Error),
}

/// A run including its raw snapshot text, so checksums stay verifiable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    #[serde(flatten)]
    pub run: RunRecord,
    pub snapshot_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub id: i64,
    pub facility_id: String,
    pub canonical_name: String,
    pub normalized_address: String,
    pub manual_override: bool,
    pub notes: Option<String>,
    pub created_at: String,
}

impl FacilityRecord {
    fn from_row(row: &SqliteRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            facility_id: row.try_get("facility_id")?,
            canonical_name: row.try_get("canonical_name")?,
            normalized_address: row.try_get("normalized_address")?,
            manual_override: row.try_get("manual_override")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupTables {
    pub runs: Vec<BackupRun>,
    pub jobs_current: Vec<JobProjection>,
    pub events: Vec<EventRow>,
    pub facilities: Vec<FacilityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub tables: BackupTables,
}

impl Backup {
    /// Parses a backup document, checking the format version before anything else.
    pub fn from_json(text: &str) -> Result<Self, BackupError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let found = value.get("version").and_then(serde_json::Value::as_u64).unwrap_or(0);
        if found != u64::from(BACKUP_FORMAT_VERSION) {
            return Err(BackupError::UnsupportedVersion { found });
        }
        Ok(serde_json::from_value(value)?)
    }
}

impl JobStore {
    pub async fn facilities(&self) -> anyhow::Result<Vec<FacilityRecord>> {
        let rows = sqlx::query(
            "SELECT id, facility_id, canonical_name, normalized_address, manual_override, notes, created_at \
             FROM facilities ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing facilities")?;
        rows.iter().map(FacilityRecord::from_row).collect()
    }

    pub async fn export_backup(&self, exported_at: DateTime<Utc>) -> anyhow::Result<Backup> {
        let run_rows = sqlx::query(
            "SELECT id, run_date, run_timestamp, snapshot_checksum, snapshot_json, jobs_count, status, error_message \
             FROM runs ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("exporting runs")?;
        let runs = run_rows
            .iter()
            .map(|row| {
                Ok(BackupRun {
                    run: RunRecord::from_row(row)?,
                    snapshot_json: row.try_get("snapshot_json")?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let job_rows = sqlx::query(&format!(
            "SELECT {} FROM {CURRENT_TABLE} ORDER BY job_id",
            JOB_COLUMNS.join(", ")
        ))
        .fetch_all(&self.pool)
        .await
        .context("exporting live jobs")?;
        let jobs_current = job_rows
            .iter()
            .map(projection_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let event_rows = sqlx::query(
            "SELECT e.id, e.job_id, e.event_type, e.event_date, e.detected_at, e.run_id, e.previous_state, \
             e.new_state, e.facility_id, e.jobfamily_id, e.department_api_id, e.department_custom \
             FROM events e ORDER BY e.id",
        )
        .fetch_all(&self.pool)
        .await
        .context("exporting events")?;
        let events = event_rows
            .iter()
            .map(EventRow::from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let backup = Backup {
            version: BACKUP_FORMAT_VERSION,
            exported_at,
            tables: BackupTables {
                runs,
                jobs_current,
                events,
                facilities: self.facilities().await?,
            },
        };
        info!(
            runs = backup.tables.runs.len(),
            jobs = backup.tables.jobs_current.len(),
            events = backup.tables.events.len(),
            "backup exported"
        );
        Ok(backup)
    }

    /// Replaces runs, live view, events and facilities with the backup's
    /// contents in one transaction. Ids are preserved so events keep
    /// pointing at their runs.
    pub async fn import_backup(&self, backup: &Backup) -> Result<(), BackupError> {
        if backup.version != BACKUP_FORMAT_VERSION {
            return Err(BackupError::UnsupportedVersion {
                found: u64::from(backup.version),
            });
        }
        self.replace_tables(&backup.tables).await?;
        self.invalidate_filter_cache().await?;
        Ok(())
    }

    async fn replace_tables(&self, tables: &BackupTables) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting import")?;
        for table in [CURRENT_TABLE, "events", "runs", "facilities"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clearing {table}"))?;
        }

        for entry in &tables.runs {
            let run = &entry.run;
            sqlx::query(
                r#"
                INSERT INTO runs (id, run_date, run_timestamp, snapshot_checksum, snapshot_json, jobs_count, status, error_message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(run.id)
            .bind(run.run_date.to_string())
            .bind(timestamp_text(run.run_timestamp))
            .bind(&run.snapshot_checksum)
            .bind(&entry.snapshot_json)
            .bind(run.jobs_count)
            .bind(run.status.as_str())
            .bind(run.error_message.as_deref())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("importing run {}", run.id))?;
        }

        let insert_job = insert_job_sql(CURRENT_TABLE);
        for job in &tables.jobs_current {
            bind_job(sqlx::query(&insert_job), job)?
                .execute(&mut *tx)
                .await
                .with_context(|| format!("importing job {}", job.job_id))?;
        }

        for event in &tables.events {
            let previous_state = event.previous_state.as_ref().map(serde_json::to_string).transpose()?;
            let new_state = event.new_state.as_ref().map(serde_json::to_string).transpose()?;
            sqlx::query(
                r#"
                INSERT INTO events (id, job_id, event_type, event_date, detected_at, run_id, previous_state, new_state,
                                    facility_id, jobfamily_id, department_api_id, department_custom)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(event.id)
            .bind(&event.job_id)
            .bind(event.event_type.as_str())
            .bind(event.event_date.to_string())
            .bind(timestamp_text(event.detected_at))
            .bind(event.run_id)
            .bind(previous_state)
            .bind(new_state)
            .bind(&event.facility_id)
            .bind(&event.jobfamily_id)
            .bind(&event.department_api_id)
            .bind(&event.department_custom)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("importing event {}", event.id))?;
        }

        for facility in &tables.facilities {
            sqlx::query(
                r#"
                INSERT INTO facilities (id, facility_id, canonical_name, normalized_address, manual_override, notes, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(facility.id)
            .bind(&facility.facility_id)
            .bind(&facility.canonical_name)
            .bind(&facility.normalized_address)
            .bind(facility.manual_override)
            .bind(facility.notes.as_deref())
            .bind(&facility.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("importing facility {}", facility.facility_id))?;
        }

        sqlx::query("DELETE FROM sync_meta WHERE key IN (?1, ?2)")
            .bind(meta_keys::ANOMALY)
            .bind(meta_keys::FACILITY_COLLISIONS)
            .execute(&mut *tx)
            .await
            .context("clearing advisories")?;

        tx.commit().await.context("committing import")?;
        info!(
            runs = tables.runs.len(),
            jobs = tables.jobs_current.len(),
            events = tables.events.len(),
            facilities = tables.facilities.len(),
            "backup imported"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::NewRun;
    use crate::test_support::job;
    use crate::{EventQuery, JobQuery};
    use chrono::TimeZone;
    use jobfeed_core::compute_diff;

    fn at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, 6, 0, 0).unwrap()
    }

    async fn populated() -> JobStore {
        let store = JobStore::in_memory().await.unwrap();
        let first = vec![job("A", "1"), job("B", "1")];
        let second = vec![job("A", "2"), job("C", "1")];
        store.persist_run(NewRun::success(at(1), &first)).await.unwrap();
        let run = store.persist_run(NewRun::success(at(2), &second)).await.unwrap();
        let diff = compute_diff(&first, &second, run, at(2).date_naive());
        store.persist_events(&diff, at(2)).await.unwrap();
        store.publish_current(run, &second, at(2)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn export_then_import_into_fresh_store_restores_everything() {
        let source = populated().await;
        let backup = source.export_backup(at(3)).await.unwrap();
        assert_eq!(backup.version, 1);
        assert_eq!(backup.tables.runs.len(), 2);
        assert_eq!(backup.tables.events.len(), 3);
        assert_eq!(backup.tables.jobs_current.len(), 2);

        let text = serde_json::to_string_pretty(&backup).unwrap();
        let parsed = Backup::from_json(&text).unwrap();

        let target = JobStore::in_memory().await.unwrap();
        target.set_meta("filter_opts:location", "[]").await.unwrap();
        target.import_backup(&parsed).await.unwrap();

        let restored = target.export_backup(at(3)).await.unwrap();
        assert_eq!(restored.tables, backup.tables);
        assert_eq!(target.meta("filter_opts:location").await.unwrap(), None);

        let events = target.list_events(&EventQuery::default(), at(3).date_naive()).await.unwrap();
        let run_ids: Vec<_> = restored.tables.runs.iter().map(|r| r.run.id).collect();
        assert!(events.events.iter().all(|e| run_ids.contains(&e.event.run_id)));

        let (last, records) = target.last_successful_snapshot().await.unwrap().unwrap();
        assert_eq!(last.run_date, at(2).date_naive());
        assert_eq!(records, vec![job("A", "2"), job("C", "1")]);
    }

    #[tokio::test]
    async fn import_replaces_existing_rows() {
        let source = populated().await;
        let backup = source.export_backup(at(3)).await.unwrap();

        let target = populated().await;
        target.publish_current(99, &[job("Z", "1")], at(4)).await.unwrap();
        target.import_backup(&backup).await.unwrap();

        let page = target.query_jobs(&JobQuery::default(), Default::default()).await.unwrap();
        let ids: Vec<_> = page.jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn wrong_version_is_rejected_before_parsing_tables() {
        let err = Backup::from_json(r#"{"version": 2, "tables": "whatever"}"#).unwrap_err();
        assert!(matches!(err, BackupError::UnsupportedVersion { found: 2 }));
        let err = Backup::from_json(r#"{"tables": {}}"#).unwrap_err();
        assert!(matches!(err, BackupError::UnsupportedVersion { found: 0 }));
    }

    #[test]
    fn malformed_documents_are_reported() {
        assert!(matches!(Backup::from_json("not json"), Err(BackupError::Malformed(_))));
        let err = Backup::from_json(r#"{"version": 1, "exported_at": "2026-03-01T00:00:00Z", "tables": {"runs": 5}}"#)
            .unwrap_err();
        assert!(matches!(err, BackupError::Malformed(_)));
    }
}
