use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use abandon_common::retry::RetryableError;
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("duration lookup request failed: {0}")]
    Request(reqwest::Error),
    #[error("duration lookup timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("duration lookup responded with {0}")]
    Status(StatusCode),
    #[error("duration lookup has no video {0}")]
    NotFound(String),
    #[error("duration lookup returned an unreadable body: {0}")]
    InvalidBody(String),
    #[error("invalid duration lookup url: {0}")]
    InvalidUrl(String),
}

impl RetryableError for LookupError {
    fn is_retryable(&self) -> bool {
        match self {
            LookupError::Request(error) => !error.is_builder(),
            LookupError::Timeout(_) => true,
            LookupError::Status(status) => is_retryable_status(*status),
            LookupError::NotFound(_) | LookupError::InvalidBody(_) | LookupError::InvalidUrl(_) => {
                false
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Source of truth for video durations. Assumed slow or rate limited, hence the cache.
#[async_trait]
pub trait DurationLookup: Send + Sync {
    /// Duration of the video in seconds, as reported by the service.
    async fn duration(&self, video_id: &str) -> Result<f64, LookupError>;
}

#[derive(Deserialize)]
struct DurationResponse {
    duration: f64,
}

/// Client for the video-length service: `GET <url>?videoId=<id>` answering `{"duration": <seconds>}`.
pub struct HttpDurationLookup {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpDurationLookup {
    pub fn new(url: &str, request_timeout: time::Duration) -> Result<Self, LookupError> {
        let url = reqwest::Url::parse(url)
            .map_err(|error| LookupError::InvalidUrl(error.to_string()))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Abandonment Worker")
            .timeout(request_timeout)
            .build()
            .map_err(LookupError::Request)?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl DurationLookup for HttpDurationLookup {
    async fn duration(&self, video_id: &str) -> Result<f64, LookupError> {
        let response = self
            .client
            .get(self.url.clone())
            .query(&[("videoId", video_id)])
            .send()
            .await
            .map_err(LookupError::Request)?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(LookupError::NotFound(video_id.to_owned())),
            status => return Err(LookupError::Status(status)),
        }

        let body: DurationResponse = response
            .json()
            .await
            .map_err(|error| LookupError::InvalidBody(error.to_string()))?;

        Ok(body.duration)
    }
}

/// Lookup answering from a fixed table, for tests. Unknown videos are `NotFound`.
#[derive(Clone, Default)]
pub struct MockDurationLookup {
    durations: HashMap<String, f64>,
    calls: Arc<AtomicUsize>,
    transient_failures: Arc<AtomicUsize>,
}

impl MockDurationLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duration(mut self, video_id: &str, duration: f64) -> Self {
        self.durations.insert(video_id.to_owned(), duration);
        self
    }

    /// Answer the next `count` calls with a 503 before answering normally.
    pub fn failing_first(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurationLookup for MockDurationLookup {
    async fn duration(&self, video_id: &str) -> Result<f64, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LookupError::Status(StatusCode::SERVICE_UNAVAILABLE));
        }

        self.durations
            .get(video_id)
            .copied()
            .ok_or_else(|| LookupError::NotFound(video_id.to_owned()))
    }
}
