//! SQLite-backed persistence and HTTPS fetch utilities for the job feed.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

pub mod backup;
pub mod events;
pub mod fetch;
pub mod lock;
pub mod publish;
pub mod query;
pub mod runs;

pub use backup::{Backup, BackupError, BackupRun, BackupTables, FacilityRecord, BACKUP_FORMAT_VERSION};
pub use events::{EventListing, EventPage, EventQuery, EventRow, EventSummary};
pub use fetch::{decode_feed_body, validate_feed_url, FeedSource, FetchError, HttpClientConfig, HttpFetcher};
pub use lock::{LockGuard, LOCK_KEY};
pub use publish::{FacilityGroup, FacilityVariant, PublishError};
pub use query::{DepartmentSource, FilterFacet, FilterOption, JobPage, JobQuery};
pub use runs::{NewRun, RunRecord, RunStatus};

pub const CRATE_NAME: &str = "jobfeed-storage";

/// Keys of the `sync_meta` table.
pub mod meta_keys {
    pub const LAST_SYNC_STATUS: &str = "last_sync_status";
    pub const LAST_SYNC_MESSAGE: &str = "last_sync_message";
    pub const LAST_SYNC_ERROR: &str = "last_sync_error";
    pub const LAST_SYNC_ERROR_KIND: &str = "last_sync_error_kind";
    pub const LAST_SYNC_AT: &str = "last_sync_at";
    pub const LAST_SYNC_DURATION_MS: &str = "last_sync_duration_ms";
    pub const LAST_SYNC_JOBS_COUNT: &str = "last_sync_jobs_count";
    pub const PUBLISH_FAILED_AT: &str = "publish_failed_at";
    pub const ANOMALY: &str = "anomaly";
    pub const FACILITY_COLLISIONS: &str = "facility_collisions";
    pub const SCHEMA_REPORT: &str = "schema_report";
    pub const FILTER_CACHE_PREFIX: &str = "filter_opts:";
    /// Changes whenever cached filter options go stale; a cache write only
    /// lands while the generation it was computed under is still current.
    pub const FILTER_GENERATION: &str = "filter_generation";
}

pub(crate) const CURRENT_TABLE: &str = "jobs_current";
pub(crate) const STAGING_TABLE: &str = "jobs_staging";
pub(crate) const OLD_TABLE: &str = "jobs_old";

const JOB_COLUMNS_DDL: &str = r#"
    job_id TEXT NOT NULL UNIQUE,
    facility_id TEXT NOT NULL DEFAULT '',
    facility_name TEXT NOT NULL DEFAULT '',
    facility_address TEXT NOT NULL DEFAULT '',
    plz_einsatzort TEXT NOT NULL DEFAULT '',
    strasse_einsatzort TEXT NOT NULL DEFAULT '',
    einsatzort TEXT NOT NULL DEFAULT '',
    department_api TEXT NOT NULL DEFAULT '',
    department_api_id TEXT NOT NULL DEFAULT '',
    department_custom TEXT NOT NULL DEFAULT '',
    jobfamily_id TEXT NOT NULL DEFAULT '',
    jobfamily_name TEXT NOT NULL DEFAULT '',
    contract_type TEXT NOT NULL DEFAULT '',
    employment_type TEXT NOT NULL DEFAULT '',
    work_time_model TEXT NOT NULL DEFAULT '',
    is_minijob INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT 0,
    modified_at INTEGER NOT NULL DEFAULT 0,
    published_at INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER NOT NULL DEFAULT 0,
    last_seen_run_id INTEGER NOT NULL DEFAULT 0,
    raw_json TEXT NOT NULL DEFAULT '{}'
"#;

/// Column order of the job tables, matching [`JOB_COLUMNS_DDL`].
pub(crate) const JOB_COLUMNS: &[&str] = &[
    "job_id",
    "facility_id",
    "facility_name",
    "facility_address",
    "plz_einsatzort",
    "strasse_einsatzort",
    "einsatzort",
    "department_api",
    "department_api_id",
    "department_custom",
    "jobfamily_id",
    "jobfamily_name",
    "contract_type",
    "employment_type",
    "work_time_model",
    "is_minijob",
    "created_at",
    "modified_at",
    "published_at",
    "expires_at",
    "last_seen_run_id",
    "raw_json",
];

const JOB_INDEX_COLUMNS: &[&str] = &[
    "facility_id",
    "department_api_id",
    "department_custom",
    "jobfamily_id",
    "contract_type",
];

const BASE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_date TEXT NOT NULL UNIQUE,
        run_timestamp TEXT NOT NULL,
        snapshot_checksum TEXT NOT NULL DEFAULT '',
        snapshot_json TEXT NOT NULL DEFAULT '[]',
        jobs_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        error_message TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        event_date TEXT NOT NULL,
        detected_at TEXT NOT NULL,
        run_id INTEGER NOT NULL,
        previous_state TEXT,
        new_state TEXT,
        facility_id TEXT NOT NULL DEFAULT '',
        jobfamily_id TEXT NOT NULL DEFAULT '',
        department_api_id TEXT NOT NULL DEFAULT '',
        department_custom TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_date ON events (event_date)",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type)",
    "CREATE INDEX IF NOT EXISTS idx_events_job ON events (job_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_run ON events (run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS facilities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        facility_id TEXT NOT NULL UNIQUE,
        canonical_name TEXT NOT NULL DEFAULT '',
        normalized_address TEXT NOT NULL DEFAULT '',
        manual_override INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Timestamps are stored as second-precision RFC 3339 text in UTC so that
/// they compare correctly as strings.
pub fn timestamp_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(text: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid stored timestamp {text:?}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Runs, live view, events, facility registry and metadata.
    Everything,
    /// Only the live view and events, forcing the next sync to rebuild them.
    LiveViewAndEvents,
}

/// Handle to the job database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens (creating if needed) the database at `database_url` and applies the schema.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite database at {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, mainly for tests.
    ///
    /// A single connection that never expires, since every new connection to
    /// `sqlite::memory:` would see an empty database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory SQLite database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup. Also cleans up after an interrupted publish.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        for ddl in BASE_SCHEMA {
            sqlx::query(ddl)
                .execute(&mut *conn)
                .await
                .context("applying schema")?;
        }

        if !table_exists(&mut conn, CURRENT_TABLE).await? {
            create_job_table(&mut conn, CURRENT_TABLE)
                .await
                .context("creating live job table")?;
        }

        if table_exists(&mut conn, OLD_TABLE).await? {
            warn!(table = OLD_TABLE, "dropping leftover table from an interrupted publish");
            sqlx::query(&format!("DROP TABLE {OLD_TABLE}"))
                .execute(&mut *conn)
                .await
                .context("dropping leftover old job table")?;
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
            .execute(&mut *conn)
            .await
            .context("dropping staging table")?;
        create_job_table(&mut conn, STAGING_TABLE)
            .await
            .context("creating staging table")?;

        info!("database schema ready");
        Ok(())
    }

    pub async fn meta(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_meta WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading meta key {key}"))?;
        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(Into::into)
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(timestamp_text(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing meta key {key}"))?;
        Ok(())
    }

    pub async fn delete_meta(&self, key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sync_meta WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting meta key {key}"))?;
        Ok(())
    }

    pub async fn meta_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.meta(key).await? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .with_context(|| format!("decoding meta key {key}")),
            None => Ok(None),
        }
    }

    pub async fn set_meta_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let text = serde_json::to_string(value).with_context(|| format!("encoding meta key {key}"))?;
        self.set_meta(key, &text).await
    }

    /// Drops every cached filter option list and starts a new cache
    /// generation.
    pub async fn invalidate_filter_cache(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting filter cache invalidation")?;
        clear_filter_cache(&mut tx).await?;
        tx.commit().await.context("committing filter cache invalidation")?;
        Ok(())
    }

    /// Clears persisted data. The sync lock row is left alone so a running
    /// sync keeps its claim.
    pub async fn reset(&self, scope: ResetScope) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting reset")?;
        let tables: &[&str] = match scope {
            ResetScope::Everything => &[CURRENT_TABLE, "events", "runs", "facilities"],
            ResetScope::LiveViewAndEvents => &[CURRENT_TABLE, "events"],
        };
        for table in tables {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clearing {table}"))?;
        }
        if scope == ResetScope::Everything {
            sqlx::query("DELETE FROM sync_meta WHERE key <> ?1")
                .bind(LOCK_KEY)
                .execute(&mut *tx)
                .await
                .context("clearing metadata")?;
        }
        clear_filter_cache(&mut tx).await?;
        tx.commit().await.context("committing reset")?;
        warn!(?scope, "stored data reset");
        Ok(())
    }

    /// Row counts of the persistent tables, for status displays.
    pub async fn table_counts(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let mut counts = Vec::new();
        for table in ["runs", CURRENT_TABLE, "events", "facilities"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("counting {table}"))?;
            counts.push((table.to_string(), count));
        }
        Ok(counts)
    }
}

async fn clear_filter_cache(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM sync_meta WHERE substr(key, 1, length(?1)) = ?1")
        .bind(meta_keys::FILTER_CACHE_PREFIX)
        .execute(&mut *conn)
        .await
        .context("invalidating filter cache")?;
    sqlx::query(
        r#"
        INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(meta_keys::FILTER_GENERATION)
    .bind(Uuid::new_v4().to_string())
    .bind(timestamp_text(Utc::now()))
    .execute(&mut *conn)
    .await
    .context("starting filter cache generation")?;
    Ok(())
}

pub(crate) async fn table_exists(conn: &mut SqliteConnection, table: &str) -> anyhow::Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
        .bind(table)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("checking for table {table}"))?;
    Ok(count > 0)
}

/// Creates a job table with its indexes. Index names carry a random suffix so
/// they stay unique after the table is renamed by a publish.
pub(crate) async fn create_job_table(conn: &mut SqliteConnection, table: &str) -> sqlx::Result<()> {
    sqlx::query(&format!("CREATE TABLE {table} ({JOB_COLUMNS_DDL})"))
        .execute(&mut *conn)
        .await?;
    let suffix = Uuid::new_v4().simple().to_string();
    for column in JOB_INDEX_COLUMNS {
        sqlx::query(&format!(
            "CREATE INDEX idx_{table}_{column}_{suffix} ON {table} ({column})"
        ))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn timestamps_are_second_precision_utc() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T10:15:30.250+02:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp_text(at), "2026-03-01T08:15:30Z");
        assert_eq!(parse_timestamp("2026-03-01T08:15:30Z").unwrap(), at.with_nanosecond(0).unwrap());
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = JobStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
        let counts = store.table_counts().await.unwrap();
        assert!(counts.iter().all(|(_, n)| *n == 0));
    }

    #[tokio::test]
    async fn migrate_removes_leftover_old_table() {
        let store = JobStore::in_memory().await.unwrap();
        sqlx::query("CREATE TABLE jobs_old (x INTEGER)")
            .execute(store.pool())
            .await
            .unwrap();
        store.migrate().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        assert!(!table_exists(&mut conn, OLD_TABLE).await.unwrap());
        assert!(table_exists(&mut conn, STAGING_TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn meta_round_trips_text_and_json() {
        let store = JobStore::in_memory().await.unwrap();
        assert_eq!(store.meta("k").await.unwrap(), None);
        store.set_meta("k", "v1").await.unwrap();
        store.set_meta("k", "v2").await.unwrap();
        assert_eq!(store.meta("k").await.unwrap().as_deref(), Some("v2"));
        store.set_meta_json("j", &vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.meta_json::<Vec<i32>>("j").await.unwrap(), Some(vec![1, 2, 3]));
        store.delete_meta("k").await.unwrap();
        assert_eq!(store.meta("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn filter_cache_invalidation_only_touches_cache_keys() {
        let store = JobStore::in_memory().await.unwrap();
        store.set_meta("filter_opts:contract_type", "[]").await.unwrap();
        store.set_meta("filter_opts:location", "[]").await.unwrap();
        store.set_meta(meta_keys::LAST_SYNC_STATUS, "success").await.unwrap();
        let before = store.meta(meta_keys::FILTER_GENERATION).await.unwrap();
        store.invalidate_filter_cache().await.unwrap();
        let after = store.meta(meta_keys::FILTER_GENERATION).await.unwrap();
        assert!(after.is_some());
        assert_ne!(before, after);
        assert_eq!(store.meta("filter_opts:contract_type").await.unwrap(), None);
        assert_eq!(store.meta("filter_opts:location").await.unwrap(), None);
        assert_eq!(store.meta(meta_keys::LAST_SYNC_STATUS).await.unwrap().as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn file_backed_store_persists_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        {
            let store = JobStore::connect(&url).await.unwrap();
            store.set_meta("k", "kept").await.unwrap();
            store.pool().close().await;
        }
        let store = JobStore::connect(&url).await.unwrap();
        assert_eq!(store.meta("k").await.unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn reset_scopes() {
        use crate::test_support::job;
        use chrono::TimeZone;

        let now = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap();
        let store = JobStore::in_memory().await.unwrap();
        let records = vec![job("A", "1")];
        let run = store.persist_run(NewRun::success(now, &records)).await.unwrap();
        store.publish_current(run, &records, now).await.unwrap();
        let diff = jobfeed_core::compute_diff(&[], &records, run, now.date_naive());
        store.persist_events(&diff, now).await.unwrap();
        store.set_meta(meta_keys::LAST_SYNC_STATUS, "success").await.unwrap();
        let lock = store.try_acquire_lock(now, Duration::from_secs(600)).await.unwrap().unwrap();

        store.reset(ResetScope::LiveViewAndEvents).await.unwrap();
        let counts: std::collections::HashMap<_, _> = store.table_counts().await.unwrap().into_iter().collect();
        assert_eq!(counts["jobs_current"], 0);
        assert_eq!(counts["events"], 0);
        assert_eq!(counts["runs"], 1);
        assert!(store.meta(meta_keys::LAST_SYNC_STATUS).await.unwrap().is_some());

        store.reset(ResetScope::Everything).await.unwrap();
        assert!(store.table_counts().await.unwrap().iter().all(|(_, n)| *n == 0));
        assert!(store.meta(meta_keys::LAST_SYNC_STATUS).await.unwrap().is_none());
        assert!(store.lock_holder().await.unwrap().is_some());
        lock.release().await.unwrap();
    }
}
