use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::warn;

use crate::metrics_consts::CACHE_INVALID_ENTRIES;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache command timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Cache-aside store of video durations, in seconds.
///
/// A populated entry is authoritative: nothing re-validates it against the lookup service.
#[async_trait]
pub trait DurationCache: Send + Sync {
    async fn get(&self, video_id: &str) -> Result<Option<f64>, CacheError>;
    async fn set(&self, video_id: &str, duration: f64) -> Result<(), CacheError>;
}

/// Parse a cached value, rejecting anything that isn't a usable duration.
fn parse_duration(video_id: &str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(duration) if duration.is_finite() && duration > 0.0 => Some(duration),
        _ => {
            warn!(video_id, raw, "ignoring invalid cached duration");
            metrics::counter!(CACHE_INVALID_ENTRIES).increment(1);
            None
        }
    }
}

#[derive(Clone)]
pub struct RedisDurationCache {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
    /// Expiry of entries in seconds, or None to keep them for the lifetime of the store.
    ttl: Option<usize>,
}

impl RedisDurationCache {
    pub async fn new(
        url: &str,
        key_prefix: &str,
        ttl_secs: u64,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_owned(),
            ttl: usize::try_from(ttl_secs).ok().filter(|ttl| *ttl > 0),
        })
    }

    fn key(&self, video_id: &str) -> String {
        format!("{}{}", self.key_prefix, video_id)
    }
}

#[async_trait]
impl DurationCache for RedisDurationCache {
    async fn get(&self, video_id: &str) -> Result<Option<f64>, CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(video_id);

        let raw: Option<String> = conn.get(key).await?;

        Ok(raw.and_then(|raw| parse_duration(video_id, &raw)))
    }

    async fn set(&self, video_id: &str, duration: f64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = self.key(video_id);
        let value = duration.to_string();

        match self.ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }
}

/// In-memory cache that counts calls and can be switched to fail, for tests.
#[derive(Clone, Default)]
pub struct MockDurationCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
    gets: Arc<AtomicUsize>,
    sets: Arc<AtomicUsize>,
    fail_gets: bool,
    fail_sets: bool,
}

impl MockDurationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, video_id: &str, duration: f64) -> Self {
        self.with_raw_entry(video_id, &duration.to_string())
    }

    pub fn with_raw_entry(self, video_id: &str, raw: &str) -> Self {
        self.entries
            .lock()
            .expect("poisoned cache lock")
            .insert(video_id.to_owned(), raw.to_owned());
        self
    }

    pub fn failing_gets(mut self) -> Self {
        self.fail_gets = true;
        self
    }

    pub fn failing_sets(mut self) -> Self {
        self.fail_sets = true;
        self
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn raw_entry(&self, video_id: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("poisoned cache lock")
            .get(video_id)
            .cloned()
    }
}

#[async_trait]
impl DurationCache for MockDurationCache {
    async fn get(&self, video_id: &str) -> Result<Option<f64>, CacheError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets {
            return Err(CacheError::Unavailable("mock get failure".to_owned()));
        }
        Ok(self
            .raw_entry(video_id)
            .and_then(|raw| parse_duration(video_id, &raw)))
    }

    async fn set(&self, video_id: &str, duration: f64) -> Result<(), CacheError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_sets {
            return Err(CacheError::Unavailable("mock set failure".to_owned()));
        }
        self.entries
            .lock()
            .expect("poisoned cache lock")
            .insert(video_id.to_owned(), duration.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let cache = MockDurationCache::new();
        for (video_id, duration) in [("a", 600.0), ("b", 12.5), ("c", 0.001)] {
            cache.set(video_id, duration).await.unwrap();
            assert_eq!(cache.get(video_id).await.unwrap(), Some(duration));
        }
    }

    #[tokio::test]
    async fn test_unknown_video_is_absent() {
        let cache = MockDurationCache::new().with_entry("known", 60.0);
        assert_eq!(cache.get("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_cached_values_read_as_absent() {
        let cache = MockDurationCache::new()
            .with_raw_entry("marker", "no-value")
            .with_raw_entry("zero", "0")
            .with_raw_entry("negative", "-3")
            .with_raw_entry("nan", "NaN");

        for video_id in ["marker", "zero", "negative", "nan"] {
            assert_eq!(cache.get(video_id).await.unwrap(), None);
        }
    }

    #[test]
    fn test_stringified_duration_parses_back() {
        assert_eq!(parse_duration("v", &600.0_f64.to_string()), Some(600.0));
        assert_eq!(parse_duration("v", "42.25"), Some(42.25));
        assert_eq!(parse_duration("v", ""), None);
    }
}
