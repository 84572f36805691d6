use std::sync::Arc;
use std::time::{Duration, Instant};

use abandon_common::retry::RetryPolicy;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::{CacheError, DurationCache};
use crate::classifier::InvariantViolation;
use crate::lookup::{DurationLookup, LookupError};
use crate::metrics_consts::{
    CACHE_GET_FAILURES, CACHE_HITS, CACHE_MISSES, CACHE_SET_FAILURES, LOOKUP_TIME,
};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("lookup returned an unusable duration: {0}")]
    InvalidDuration(InvariantViolation),
}

/// Resolves video durations cache-first, falling back to the lookup service and
/// back-filling the cache on a miss.
pub struct DurationResolver {
    cache: Arc<dyn DurationCache>,
    lookup: Arc<dyn DurationLookup>,
    retry_policy: RetryPolicy,
    cache_timeout: Duration,
    lookup_timeout: Duration,
}

impl DurationResolver {
    pub fn new(
        cache: Arc<dyn DurationCache>,
        lookup: Arc<dyn DurationLookup>,
        retry_policy: RetryPolicy,
        cache_timeout: Duration,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            lookup,
            retry_policy,
            cache_timeout,
            lookup_timeout,
        }
    }

    /// Duration of `video_id` in seconds.
    ///
    /// Cache failures never fail resolution: a failed read is a miss, and a failed
    /// write is logged once the value is known. The write is awaited, so by the time
    /// this returns the cache holds the duration or the failure was reported.
    pub async fn resolve(&self, video_id: &str) -> Result<f64, ResolveError> {
        if let Some(duration) = self.cached(video_id).await {
            metrics::counter!(CACHE_HITS).increment(1);
            debug!(video_id, duration, "duration cache hit");
            return Ok(duration);
        }
        metrics::counter!(CACHE_MISSES).increment(1);

        let started = Instant::now();
        let lookup = &self.lookup;
        let lookup_timeout = self.lookup_timeout;
        let duration = self
            .retry_policy
            .retry("duration_lookup", || async move {
                timeout(lookup_timeout, lookup.duration(video_id))
                    .await
                    .map_err(|_| LookupError::Timeout(lookup_timeout))?
            })
            .await?;
        metrics::histogram!(LOOKUP_TIME).record(started.elapsed().as_secs_f64());

        if !duration.is_finite() || duration <= 0.0 {
            return Err(ResolveError::InvalidDuration(
                InvariantViolation::NonPositiveDuration(duration),
            ));
        }

        self.populate(video_id, duration).await;
        debug!(video_id, duration, "duration resolved by lookup");

        Ok(duration)
    }

    async fn cached(&self, video_id: &str) -> Option<f64> {
        let result = timeout(self.cache_timeout, self.cache.get(video_id))
            .await
            .unwrap_or(Err(CacheError::Timeout(self.cache_timeout)));

        match result {
            Ok(duration) => duration,
            Err(error) => {
                warn!(video_id, "duration cache read failed, treating as miss: {}", error);
                metrics::counter!(CACHE_GET_FAILURES).increment(1);
                None
            }
        }
    }

    async fn populate(&self, video_id: &str, duration: f64) {
        let result = timeout(self.cache_timeout, self.cache.set(video_id, duration))
            .await
            .unwrap_or(Err(CacheError::Timeout(self.cache_timeout)));

        if let Err(error) = result {
            warn!(video_id, duration, "failed to populate duration cache: {}", error);
            metrics::counter!(CACHE_SET_FAILURES).increment(1);
        }
    }
}
