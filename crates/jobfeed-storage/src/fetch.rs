//! HTTPS feed retrieval with a typed failure taxonomy.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("request to feed failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("feed returned an empty body")]
    EmptyBody,
    #[error("feed body is not valid JSON: {0}")]
    MalformedJson(String),
}

impl FetchError {
    /// Stable machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::Transport(_) => "transport_error",
            FetchError::HttpStatus { .. } => "http_status_error",
            FetchError::EmptyBody => "empty_body",
            FetchError::MalformedJson(_) => "malformed_json",
        }
    }
}

/// Anything that can hand the orchestrator a decoded feed document.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .https_only(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// One GET, no retries. Retrying is left to the next sync trigger.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let url = validate_feed_url(url)?;
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?;
        debug!(bytes = body.len(), "feed body received");
        Ok(body.to_vec())
    }
}

#[async_trait]
impl FeedSource for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Value, FetchError> {
        let span = info_span!("feed_fetch", url);
        async {
            let body = self.fetch_bytes(url).await?;
            decode_feed_body(&body)
        }
        .instrument(span)
        .await
    }
}

/// Only absolute `https` URLs pass; everything else fails before any network activity.
pub fn validate_feed_url(url: &str) -> Result<Url, FetchError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(FetchError::InvalidUrl("the feed URL is empty".to_string()));
    }
    let parsed = Url::parse(url).map_err(|err| FetchError::InvalidUrl(format!("{url}: {err}")))?;
    if parsed.scheme() != "https" {
        return Err(FetchError::InvalidUrl(format!(
            "{url}: only https URLs are allowed"
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(FetchError::InvalidUrl(format!("{url}: missing host")));
    }
    Ok(parsed)
}

/// Decodes a feed body into an array or object document.
pub fn decode_feed_body(body: &[u8]) -> Result<Value, FetchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FetchError::EmptyBody);
    }
    let value: Value =
        serde_json::from_slice(body).map_err(|err| FetchError::MalformedJson(err.to_string()))?;
    match value {
        Value::Array(_) | Value::Object(_) => Ok(value),
        other => Err(FetchError::MalformedJson(format!(
            "expected a JSON array or object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_https_urls_are_accepted() {
        assert!(validate_feed_url("https://example.org/jobs.json").is_ok());
        assert!(validate_feed_url("  https://example.org/jobs.json ").is_ok());
        for bad in ["", "   ", "http://example.org/jobs.json", "ftp://example.org/x", "example.org/jobs", "https://"] {
            let err = validate_feed_url(bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_url", "{bad:?}");
        }
    }

    #[test]
    fn body_decoding_classifies_failures() {
        assert!(matches!(decode_feed_body(b""), Err(FetchError::EmptyBody)));
        assert!(matches!(decode_feed_body(b" \n\t"), Err(FetchError::EmptyBody)));
        assert!(matches!(decode_feed_body(b"<html>oops</html>"), Err(FetchError::MalformedJson(_))));
        assert!(matches!(decode_feed_body(b"42"), Err(FetchError::MalformedJson(_))));
        assert!(decode_feed_body(br#"[{"Stellennummer": "1"}]"#).unwrap().is_array());
        assert!(decode_feed_body(br#"{"jobs": []}"#).unwrap().is_object());
    }

    #[tokio::test]
    async fn invalid_url_fails_without_network() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher.fetch("http://example.org/jobs.json").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
