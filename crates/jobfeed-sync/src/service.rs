//! The sync orchestrator: one attempt takes the single-flight lock, fetches
//! the feed, records the run, diffs against the last successful snapshot,
//! publishes the live view and reports a single outcome.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use jobfeed_core::{analyze, compute_diff, unwrap_feed, DiffResult, RawJobRecord, RunId};
use jobfeed_storage::{
    meta_keys, timestamp_text, Backup, BackupError, FeedSource, FetchError, HttpClientConfig, HttpFetcher,
    JobStore, LockGuard, NewRun, PublishError, ResetScope,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::anomaly::{collision_report, mass_disappearance};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the running attempt currently is. `Failed` is shown until the lock
/// has been released, then the phase returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Locked,
    Fetching,
    Diffing,
    Publishing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Failed,
    Skipped,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("another sync is already running")]
    Skipped,
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Skipped => "sync_skipped",
            SyncError::Fetch(err) => err.kind(),
            SyncError::Publish(_) => "publish_failure",
            SyncError::Storage(_) => "storage_error",
        }
    }
}

/// Why a backup import or reset was refused or failed.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("a sync is in progress; try again once it has finished")]
    SyncInProgress,
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("{0:#}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub created: usize,
    pub modified: usize,
    pub offlined: usize,
}

impl From<&DiffResult> for EventCounts {
    fn from(diff: &DiffResult) -> Self {
        Self {
            created: diff.created.len(),
            modified: diff.modified.len(),
            offlined: diff.offlined.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub attempt_id: Uuid,
    pub trigger: Trigger,
    pub status: SyncStatus,
    pub message: String,
    /// Text of the error that ended the attempt.
    pub error: Option<String>,
    /// Machine-readable class of `error`.
    pub error_kind: Option<String>,
    /// Rows in the live view after a successful publish, otherwise 0.
    pub jobs_count: usize,
    pub run_id: Option<RunId>,
    pub events: EventCounts,
    pub anomaly: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

#[derive(Debug, Default)]
struct PipelineReport {
    run_id: Option<RunId>,
    jobs_count: usize,
    events: EventCounts,
    anomaly: bool,
}

pub struct SyncService {
    store: JobStore,
    feed: Arc<dyn FeedSource>,
    clock: Arc<dyn Clock>,
    feed_url: String,
    lock_ttl: Duration,
    phase: watch::Sender<SyncPhase>,
}

impl SyncService {
    pub fn new(
        store: JobStore,
        feed: Arc<dyn FeedSource>,
        clock: Arc<dyn Clock>,
        feed_url: impl Into<String>,
        lock_ttl: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            store,
            feed,
            clock,
            feed_url: feed_url.into(),
            lock_ttl,
            phase,
        }
    }

    /// Wires the HTTPS fetcher and the system clock from `config`.
    pub fn from_config(config: &SyncConfig, store: JobStore) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self::new(
            store,
            Arc::new(fetcher),
            Arc::new(SystemClock),
            config.feed_url.clone(),
            config.lock_ttl(),
        ))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// The current instant according to the service's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Replaces the stored data with `backup` while holding the sync lock.
    pub async fn import_backup(&self, backup: &Backup) -> Result<(), MaintenanceError> {
        let guard = self.maintenance_lock().await?;
        let result = self.store.import_backup(backup).await.map_err(MaintenanceError::from);
        release_maintenance_lock(guard).await;
        result
    }

    /// Clears stored data while holding the sync lock.
    pub async fn reset(&self, scope: ResetScope) -> Result<(), MaintenanceError> {
        let guard = self.maintenance_lock().await?;
        let result = self.store.reset(scope).await.map_err(MaintenanceError::from);
        release_maintenance_lock(guard).await;
        result
    }

    async fn maintenance_lock(&self) -> Result<LockGuard, MaintenanceError> {
        match self.store.try_acquire_lock(self.clock.now(), self.lock_ttl).await? {
            Some(guard) => Ok(guard),
            None => {
                info!("maintenance refused, lock is held by a sync");
                Err(MaintenanceError::SyncInProgress)
            }
        }
    }

    /// Runs one sync attempt. Never fails: every outcome, including a skip,
    /// is reported through [`SyncOutcome`].
    pub async fn sync(&self, trigger: Trigger) -> SyncOutcome {
        let attempt_id = Uuid::new_v4();
        let span = info_span!("sync_attempt", %attempt_id, trigger = trigger.as_str());
        self.attempt(attempt_id, trigger).instrument(span).await
    }

    async fn attempt(&self, attempt_id: Uuid, trigger: Trigger) -> SyncOutcome {
        let started_at = self.clock.now();
        let timer = Instant::now();

        let guard = match self.store.try_acquire_lock(started_at, self.lock_ttl).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("sync skipped, lock is held by another attempt");
                let err = SyncError::Skipped;
                return SyncOutcome {
                    attempt_id,
                    trigger,
                    status: SyncStatus::Skipped,
                    message: format!("Sync skipped: {err}"),
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind().to_string()),
                    jobs_count: 0,
                    run_id: None,
                    events: EventCounts::default(),
                    anomaly: false,
                    started_at,
                    duration_ms: elapsed_ms(timer),
                };
            }
            Err(err) => {
                let outcome =
                    self.failed_outcome(attempt_id, trigger, started_at, timer, None, SyncError::Storage(err));
                self.record_last_sync(&outcome).await;
                self.phase.send_replace(SyncPhase::Idle);
                return outcome;
            }
        };
        self.phase.send_replace(SyncPhase::Locked);

        let result = self.run_pipeline(started_at).await;
        let outcome = match result {
            Ok(report) => {
                let message = format!(
                    "Sync succeeded: {} jobs published ({} created, {} modified, {} offlined)",
                    report.jobs_count, report.events.created, report.events.modified, report.events.offlined
                );
                info!(jobs = report.jobs_count, anomaly = report.anomaly, "sync finished");
                SyncOutcome {
                    attempt_id,
                    trigger,
                    status: SyncStatus::Success,
                    message,
                    error: None,
                    error_kind: None,
                    jobs_count: report.jobs_count,
                    run_id: report.run_id,
                    events: report.events,
                    anomaly: report.anomaly,
                    started_at,
                    duration_ms: elapsed_ms(timer),
                }
            }
            Err((report, err)) => self.failed_outcome(attempt_id, trigger, started_at, timer, Some(report), err),
        };

        self.record_last_sync(&outcome).await;
        if let Err(err) = guard.release().await {
            warn!(error = %format!("{err:#}"), "releasing sync lock failed; it expires with its ttl");
        }
        self.phase.send_replace(SyncPhase::Idle);
        outcome
    }

    fn failed_outcome(
        &self,
        attempt_id: Uuid,
        trigger: Trigger,
        started_at: DateTime<Utc>,
        timer: Instant,
        report: Option<PipelineReport>,
        err: SyncError,
    ) -> SyncOutcome {
        self.phase.send_replace(SyncPhase::Failed);
        error!(kind = err.kind(), error = %err, "sync failed");
        let report = report.unwrap_or_default();
        SyncOutcome {
            attempt_id,
            trigger,
            status: SyncStatus::Failed,
            message: format!("Sync failed: {err}"),
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            jobs_count: 0,
            run_id: report.run_id,
            events: report.events,
            anomaly: report.anomaly,
            started_at,
            duration_ms: elapsed_ms(timer),
        }
    }

    async fn run_pipeline(&self, now: DateTime<Utc>) -> Result<PipelineReport, (PipelineReport, SyncError)> {
        let mut report = PipelineReport::default();
        match self.pipeline_stages(now, &mut report).await {
            Ok(()) => Ok(report),
            Err(err) => Err((report, err)),
        }
    }

    async fn pipeline_stages(&self, now: DateTime<Utc>, report: &mut PipelineReport) -> Result<(), SyncError> {
        self.phase.send_replace(SyncPhase::Fetching);
        let document = match self.feed.fetch(&self.feed_url).await {
            Ok(document) => document,
            Err(err) => {
                if let Err(persist_err) = self.store.persist_run(NewRun::failed(now, err.to_string())).await {
                    warn!(error = %format!("{persist_err:#}"), "recording failed run");
                }
                return Err(err.into());
            }
        };

        let records = unwrap_feed(document);
        info!(records = records.len(), "feed decoded");
        if let Err(err) = self.store.set_meta_json(meta_keys::SCHEMA_REPORT, &analyze(&records)).await {
            warn!(error = %format!("{err:#}"), "storing schema report");
        }

        self.phase.send_replace(SyncPhase::Diffing);
        let previous = self.store.last_successful_snapshot().await?;
        let run_id = self.store.persist_run(NewRun::success(now, &records)).await?;
        report.run_id = Some(run_id);

        match previous {
            Some((previous_run, previous_records)) if !previous_records.is_empty() => {
                let diff = compute_diff(&previous_records, &records, run_id, now.date_naive());
                let stored = self.store.persist_events(&diff, now).await?;
                report.events = EventCounts::from(&diff);
                info!(previous_run = previous_run.id, events = stored, "diff recorded");
                report.anomaly = self.check_mass_disappearance(&previous_records, &diff, now).await;
            }
            _ => info!("no previous snapshot, diff skipped"),
        }

        self.phase.send_replace(SyncPhase::Publishing);
        report.jobs_count = self.store.publish_current(run_id, &records, now).await?;
        self.check_collisions(now).await;
        Ok(())
    }

    async fn check_mass_disappearance(
        &self,
        previous: &[RawJobRecord],
        diff: &DiffResult,
        now: DateTime<Utc>,
    ) -> bool {
        let previous_total = previous
            .iter()
            .filter_map(RawJobRecord::job_id)
            .collect::<HashSet<_>>()
            .len();
        let Some(anomaly) = mass_disappearance(previous_total, diff.offlined.len(), now) else {
            return false;
        };
        warn!(details = %anomaly.details, "mass disappearance detected");
        if let Err(err) = self.store.set_meta_json(meta_keys::ANOMALY, &anomaly).await {
            warn!(error = %format!("{err:#}"), "storing anomaly");
        }
        true
    }

    async fn check_collisions(&self, now: DateTime<Utc>) {
        let groups = match self.store.colliding_facilities().await {
            Ok(groups) => groups,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "collision check failed");
                return;
            }
        };
        let stored = match collision_report(groups, now) {
            Some(report) => {
                warn!(count = report.count, "facility id collisions in live view");
                self.store.set_meta_json(meta_keys::FACILITY_COLLISIONS, &report).await
            }
            None => self.store.delete_meta(meta_keys::FACILITY_COLLISIONS).await,
        };
        if let Err(err) = stored {
            warn!(error = %format!("{err:#}"), "storing collision report");
        }
    }

    async fn record_last_sync(&self, outcome: &SyncOutcome) {
        if let Err(err) = self.write_last_sync(outcome).await {
            warn!(error = %format!("{err:#}"), "recording last sync metadata");
        }
    }

    async fn write_last_sync(&self, outcome: &SyncOutcome) -> Result<()> {
        self.store.set_meta(meta_keys::LAST_SYNC_STATUS, outcome.status.as_str()).await?;
        self.store.set_meta(meta_keys::LAST_SYNC_MESSAGE, &outcome.message).await?;
        self.store.set_meta(meta_keys::LAST_SYNC_AT, &timestamp_text(outcome.started_at)).await?;
        self.store
            .set_meta(meta_keys::LAST_SYNC_DURATION_MS, &outcome.duration_ms.to_string())
            .await?;
        match (&outcome.error, &outcome.error_kind) {
            (Some(error), kind) => {
                self.store.set_meta(meta_keys::LAST_SYNC_ERROR, error).await?;
                match kind {
                    Some(kind) => self.store.set_meta(meta_keys::LAST_SYNC_ERROR_KIND, kind).await?,
                    None => self.store.delete_meta(meta_keys::LAST_SYNC_ERROR_KIND).await?,
                }
            }
            (None, _) => {
                self.store.delete_meta(meta_keys::LAST_SYNC_ERROR).await?;
                self.store.delete_meta(meta_keys::LAST_SYNC_ERROR_KIND).await?;
                self.store
                    .set_meta(meta_keys::LAST_SYNC_JOBS_COUNT, &outcome.jobs_count.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

async fn release_maintenance_lock(guard: LockGuard) {
    if let Err(err) = guard.release().await {
        warn!(error = %format!("{err:#}"), "releasing sync lock failed; it expires with its ttl");
    }
}

fn elapsed_ms(timer: Instant) -> u64 {
    u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX)
}
