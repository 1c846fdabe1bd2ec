use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::ScheduleInterval;
use crate::service::{SyncService, Trigger};

/// Builds (but does not start) a scheduler firing `service` on `interval`.
/// Returns `None` when scheduling is off.
pub async fn build_scheduler(service: Arc<SyncService>, interval: ScheduleInterval) -> Result<Option<JobScheduler>> {
    let Some(cron) = interval.cron() else {
        return Ok(None);
    };

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            let outcome = service.sync(Trigger::Scheduled).await;
            info!(status = %outcome.status, message = %outcome.message, "scheduled sync finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(?interval, cron, "sync scheduler configured");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticFeed;
    use crate::clock::SystemClock;
    use jobfeed_storage::JobStore;
    use serde_json::json;
    use std::time::Duration;

    async fn service() -> Arc<SyncService> {
        let store = JobStore::in_memory().await.unwrap();
        Arc::new(SyncService::new(
            store,
            Arc::new(StaticFeed::new(json!([]))),
            Arc::new(SystemClock),
            "https://jobs.example.org/feed.json",
            Duration::from_secs(600),
        ))
    }

    #[tokio::test]
    async fn off_builds_no_scheduler() {
        assert!(build_scheduler(service().await, ScheduleInterval::Off)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn intervals_build_a_scheduler() {
        let sched = build_scheduler(service().await, ScheduleInterval::Twicedaily)
            .await
            .unwrap();
        assert!(sched.is_some());
    }
}
