//! Rebuild and atomic republish of the live job view.
//!
//! The new projection is written into `jobs_staging`, then a single
//! transaction renames `jobs_current` to `jobs_old` and `jobs_staging` to
//! `jobs_current`. Readers see either the old or the new table, never an
//! empty one. The old table is only dropped after the swap committed.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobfeed_core::{JobProjection, RawJobRecord, RunId};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    create_job_table, meta_keys, timestamp_text, JobStore, CURRENT_TABLE, JOB_COLUMNS, OLD_TABLE,
    STAGING_TABLE,
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("building the staging table failed: {0:#}")]
    Staging(anyhow::Error),
    #[error("swapping the staging table into place failed: {0}")]
    Swap(#[source] sqlx::Error),
}

/// Distinct (name, address) pairs observed under one facility id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityGroup {
    pub facility_id: String,
    pub variants: Vec<FacilityVariant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityVariant {
    pub name: String,
    pub address: String,
    pub job_count: i64,
}

/// `INSERT` statement for one job row; a repeated job id overwrites the earlier row.
pub(crate) fn insert_job_sql(table: &str) -> String {
    let columns = JOB_COLUMNS.join(", ");
    let placeholders = (1..=JOB_COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = JOB_COLUMNS[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({columns}) VALUES ({placeholders}) ON CONFLICT(job_id) DO UPDATE SET {updates}"
    )
}

/// Binds `job` in [`JOB_COLUMNS`] order.
pub(crate) fn bind_job<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    job: &'q JobProjection,
) -> anyhow::Result<Query<'q, Sqlite, SqliteArguments<'q>>> {
    let raw_json = serde_json::to_string(&job.raw).context("serializing raw record")?;
    Ok(query
        .bind(job.job_id.as_str())
        .bind(job.facility_id.as_str())
        .bind(job.facility_name.as_str())
        .bind(job.facility_address.as_str())
        .bind(job.plz_einsatzort.as_str())
        .bind(job.strasse_einsatzort.as_str())
        .bind(job.einsatzort.as_str())
        .bind(job.department_api.as_str())
        .bind(job.department_api_id.as_str())
        .bind(job.department_custom.as_str())
        .bind(job.jobfamily_id.as_str())
        .bind(job.jobfamily_name.as_str())
        .bind(job.contract_type.as_str())
        .bind(job.employment_type.as_str())
        .bind(job.work_time_model.as_str())
        .bind(job.is_minijob)
        .bind(job.created_at)
        .bind(job.modified_at)
        .bind(job.published_at)
        .bind(job.expires_at)
        .bind(job.last_seen_run_id)
        .bind(raw_json))
}

impl JobStore {
    /// Replaces the live view with the projection of `records`.
    ///
    /// Records without an identity are skipped. On a failed swap the live
    /// view is untouched, the failure time is recorded under
    /// `publish_failed_at` and [`PublishError::Swap`] is returned.
    pub async fn publish_current(
        &self,
        run_id: RunId,
        records: &[RawJobRecord],
        now: DateTime<Utc>,
    ) -> Result<usize, PublishError> {
        let jobs: Vec<JobProjection> = records
            .iter()
            .filter_map(|record| JobProjection::from_record(record, run_id))
            .collect();
        let skipped = records.len() - jobs.len();
        if skipped > 0 {
            warn!(skipped, "records without job id left out of the live view");
        }

        self.fill_staging(&jobs).await.map_err(PublishError::Staging)?;

        if let Err(err) = self.swap_staging().await {
            if let Err(meta_err) = self.set_meta(meta_keys::PUBLISH_FAILED_AT, &timestamp_text(now)).await {
                warn!(error = %meta_err, "could not record publish failure time");
            }
            return Err(PublishError::Swap(err));
        }

        let published = self.count_current().await.unwrap_or(jobs.len() as i64);
        info!(run_id, published, "live job view republished");

        if let Err(err) = self.after_swap(now).await {
            warn!(error = %err, "post-publish maintenance failed");
        }
        Ok(published as usize)
    }

    async fn fill_staging(&self, jobs: &[JobProjection]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting staging transaction")?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
            .execute(&mut *tx)
            .await
            .context("clearing staging table")?;
        create_job_table(&mut tx, STAGING_TABLE)
            .await
            .context("creating staging table")?;

        let sql = insert_job_sql(STAGING_TABLE);
        for job in jobs {
            bind_job(sqlx::query(&sql), job)?
                .execute(&mut *tx)
                .await
                .with_context(|| format!("staging job {}", job.job_id))?;
        }
        tx.commit().await.context("committing staging table")?;
        Ok(())
    }

    async fn swap_staging(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let renamed = async {
            sqlx::query(&format!("ALTER TABLE {CURRENT_TABLE} RENAME TO {OLD_TABLE}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("ALTER TABLE {STAGING_TABLE} RENAME TO {CURRENT_TABLE}"))
                .execute(&mut *tx)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        match renamed {
            Ok(()) => tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed swap also failed");
                }
                Err(err)
            }
        }
    }

    async fn after_swap(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {OLD_TABLE}"))
            .execute(&mut *conn)
            .await
            .context("dropping previous live table")?;
        create_job_table(&mut conn, STAGING_TABLE)
            .await
            .context("recreating staging table")?;
        drop(conn);

        self.sync_facilities(now).await?;
        self.invalidate_filter_cache().await
    }

    async fn count_current(&self) -> anyhow::Result<i64> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {CURRENT_TABLE}"))
            .fetch_one(&self.pool)
            .await
            .context("counting live jobs")
    }

    /// Upserts one registry row per facility id of the live view. Rows marked
    /// as manual overrides keep their curated name and address.
    pub async fn sync_facilities(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO facilities (facility_id, canonical_name, normalized_address, manual_override, created_at)
            SELECT facility_id, MIN(facility_name), MIN(facility_address), 0, ?1
            FROM jobs_current
            WHERE facility_id <> ''
            GROUP BY facility_id
            ON CONFLICT(facility_id) DO UPDATE SET
                canonical_name = excluded.canonical_name,
                normalized_address = excluded.normalized_address
            WHERE facilities.manual_override = 0
            "#,
        )
        .bind(timestamp_text(now))
        .execute(&self.pool)
        .await
        .context("syncing facility registry")?;
        Ok(result.rows_affected())
    }

    /// Pins a curated name and address for a facility; later syncs leave it alone.
    pub async fn override_facility(
        &self,
        facility_id: &str,
        canonical_name: &str,
        normalized_address: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO facilities (facility_id, canonical_name, normalized_address, manual_override, notes, created_at)
            VALUES (?1, ?2, ?3, 1, ?4, ?5)
            ON CONFLICT(facility_id) DO UPDATE SET
                canonical_name = excluded.canonical_name,
                normalized_address = excluded.normalized_address,
                manual_override = 1,
                notes = excluded.notes
            "#,
        )
        .bind(facility_id)
        .bind(canonical_name)
        .bind(normalized_address)
        .bind(notes)
        .bind(timestamp_text(now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("overriding facility {facility_id}"))?;
        Ok(())
    }

    /// Facility ids of the live view that carry more than one distinct
    /// (name, address) pair, ordered by facility id.
    pub async fn colliding_facilities(&self) -> anyhow::Result<Vec<FacilityGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT facility_id, facility_name, facility_address, COUNT(*) AS job_count
            FROM jobs_current
            WHERE facility_id <> ''
            GROUP BY facility_id, facility_name, facility_address
            ORDER BY facility_id, facility_name, facility_address
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("grouping live jobs by facility")?;

        let mut groups: BTreeMap<String, Vec<FacilityVariant>> = BTreeMap::new();
        for row in rows {
            groups
                .entry(row.try_get("facility_id")?)
                .or_default()
                .push(FacilityVariant {
                    name: row.try_get("facility_name")?,
                    address: row.try_get("facility_address")?,
                    job_count: row.try_get("job_count")?,
                });
        }
        Ok(groups
            .into_iter()
            .filter(|(_, variants)| variants.len() > 1)
            .map(|(facility_id, variants)| FacilityGroup { facility_id, variants })
            .collect())
    }
}
