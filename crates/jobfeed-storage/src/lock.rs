//! Cooperative single-flight lock stored as a row of `sync_meta`.
//!
//! The row holds a random holder token and the acquisition time. A lock older
//! than the TTL counts as abandoned and may be taken over.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{timestamp_text, JobStore};

pub const LOCK_KEY: &str = "sync_lock";

/// A held lock. Release it with [`LockGuard::release`]; dropping the guard
/// without releasing schedules the release on the current runtime.
#[derive(Debug)]
pub struct LockGuard {
    store: JobStore,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        self.store.release_lock(&self.token).await.map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.release_lock(&token).await {
                        warn!(error = %err, "failed to release sync lock from drop");
                    }
                });
            }
            Err(_) => warn!("sync lock dropped outside a runtime; it will expire after its TTL"),
        }
    }
}

impl JobStore {
    /// Takes the lock unless a live one is held. `None` means another holder
    /// acquired it less than `ttl` before `now`.
    pub async fn try_acquire_lock(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> anyhow::Result<Option<LockGuard>> {
        let ttl = chrono::Duration::from_std(ttl).context("lock ttl out of range")?;
        let token = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            WHERE sync_meta.updated_at <= ?4
            "#,
        )
        .bind(LOCK_KEY)
        .bind(&token)
        .bind(timestamp_text(now))
        .bind(timestamp_text(now - ttl))
        .execute(&self.pool)
        .await
        .context("acquiring sync lock")?;

        if result.rows_affected() == 1 {
            debug!(%token, "sync lock acquired");
            Ok(Some(LockGuard {
                store: self.clone(),
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Releases the lock if `token` still holds it. Returns whether a row was removed.
    pub async fn release_lock(&self, token: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM sync_meta WHERE key = ?1 AND value = ?2")
            .bind(LOCK_KEY)
            .bind(token)
            .execute(&self.pool)
            .await
            .context("releasing sync lock")?;
        let released = result.rows_affected() == 1;
        if !released {
            warn!(%token, "sync lock was no longer held by this holder");
        }
        Ok(released)
    }

    /// Holder token and acquisition time of the current lock row, if any.
    pub async fn lock_holder(&self) -> anyhow::Result<Option<(String, String)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT value, updated_at FROM sync_meta WHERE key = ?1")
                .bind(LOCK_KEY)
                .fetch_optional(&self.pool)
                .await
                .context("reading sync lock")?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TTL: Duration = Duration::from_secs(600);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_772_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn second_acquire_within_ttl_is_refused() {
        let store = JobStore::in_memory().await.unwrap();
        let first = store.try_acquire_lock(at(0), TTL).await.unwrap();
        assert!(first.is_some());
        assert!(store.try_acquire_lock(at(599), TTL).await.unwrap().is_none());
        first.unwrap().release().await.unwrap();
        assert!(store.try_acquire_lock(at(600), TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let store = JobStore::in_memory().await.unwrap();
        let abandoned = store.try_acquire_lock(at(0), TTL).await.unwrap().unwrap();
        let abandoned_token = abandoned.token().to_string();
        std::mem::forget(abandoned);

        let fresh = store.try_acquire_lock(at(601), TTL).await.unwrap().unwrap();
        assert_ne!(fresh.token(), abandoned_token);

        // The old holder can no longer release someone else's lock.
        assert!(!store.release_lock(&abandoned_token).await.unwrap());
        assert!(store.lock_holder().await.unwrap().is_some());
        fresh.release().await.unwrap();
        assert!(store.lock_holder().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropping_the_guard_releases_the_lock() {
        let store = JobStore::in_memory().await.unwrap();
        drop(store.try_acquire_lock(at(0), TTL).await.unwrap().unwrap());
        for _ in 0..50 {
            if store.lock_holder().await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lock was not released after drop");
    }
}
