//! In-process feed sources for exercising the orchestrator without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use jobfeed_storage::{validate_feed_url, FeedSource, FetchError};
use serde_json::Value;
use tokio::sync::Notify;

/// Serves a fixed document. A queued error is returned once, by the next fetch.
#[derive(Debug)]
pub struct StaticFeed {
    document: Mutex<Value>,
    error: Mutex<Option<FetchError>>,
    fetches: AtomicUsize,
}

impl StaticFeed {
    pub fn new(document: Value) -> Self {
        Self {
            document: Mutex::new(document),
            error: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_document(&self, document: Value) {
        *self.document.lock().unwrap_or_else(PoisonError::into_inner) = document;
    }

    pub fn fail_next(&self, error: FetchError) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Fetch calls seen so far, including failed ones.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        validate_feed_url(url)?;
        if let Some(err) = self.error.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(err);
        }
        Ok(self.document.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// A [`StaticFeed`] whose fetches park until [`GatedFeed::open`] is called.
#[derive(Debug)]
pub struct GatedFeed {
    inner: StaticFeed,
    entered: Notify,
    gate: Notify,
}

impl GatedFeed {
    pub fn new(document: Value) -> Self {
        Self {
            inner: StaticFeed::new(document),
            entered: Notify::new(),
            gate: Notify::new(),
        }
    }

    /// Resolves once a fetch is parked at the gate.
    pub async fn wait_until_fetching(&self) {
        self.entered.notified().await;
    }

    /// Lets one parked (or the next) fetch through.
    pub fn open(&self) {
        self.gate.notify_one();
    }

    pub fn fetches(&self) -> usize {
        self.inner.fetches()
    }
}

#[async_trait]
impl FeedSource for GatedFeed {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.inner.fetch(url).await
    }
}
