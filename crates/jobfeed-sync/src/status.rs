//! Operator-facing view of the last sync and the store's advisories.

use anyhow::Result;
use jobfeed_core::SchemaReport;
use jobfeed_storage::{meta_keys, JobStore, RunRecord};
use serde::{Deserialize, Serialize};

use crate::anomaly::{Anomaly, CollisionReport};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSync {
    pub status: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub at: Option<String>,
    pub duration_ms: Option<u64>,
    pub jobs_count: Option<u64>,
}

impl LastSync {
    pub async fn load(store: &JobStore) -> Result<Self> {
        Ok(Self {
            status: store.meta(meta_keys::LAST_SYNC_STATUS).await?,
            message: store.meta(meta_keys::LAST_SYNC_MESSAGE).await?,
            error: store.meta(meta_keys::LAST_SYNC_ERROR).await?,
            error_kind: store.meta(meta_keys::LAST_SYNC_ERROR_KIND).await?,
            at: store.meta(meta_keys::LAST_SYNC_AT).await?,
            duration_ms: parse_number(store.meta(meta_keys::LAST_SYNC_DURATION_MS).await?),
            jobs_count: parse_number(store.meta(meta_keys::LAST_SYNC_JOBS_COUNT).await?),
        })
    }
}

fn parse_number(value: Option<String>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub token: String,
    pub acquired_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub last_sync: LastSync,
    pub lock: Option<LockInfo>,
    pub anomaly: Option<Anomaly>,
    pub collisions: Option<CollisionReport>,
    pub publish_failed_at: Option<String>,
    pub table_counts: Vec<(String, i64)>,
    pub recent_runs: Vec<RunRecord>,
}

pub async fn status_report(store: &JobStore, runs: u32) -> Result<StatusReport> {
    let lock = store
        .lock_holder()
        .await?
        .map(|(token, acquired_at)| LockInfo { token, acquired_at });
    Ok(StatusReport {
        last_sync: LastSync::load(store).await?,
        lock,
        anomaly: store.meta_json(meta_keys::ANOMALY).await?,
        collisions: store.meta_json(meta_keys::FACILITY_COLLISIONS).await?,
        publish_failed_at: store.meta(meta_keys::PUBLISH_FAILED_AT).await?,
        table_counts: store.table_counts().await?,
        recent_runs: store.recent_runs(runs).await?,
    })
}

/// The schema report stored by the last successful fetch.
pub async fn last_schema_report(store: &JobStore) -> Result<Option<SchemaReport>> {
    store.meta_json(meta_keys::SCHEMA_REPORT).await
}
