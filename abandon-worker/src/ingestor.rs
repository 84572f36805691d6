use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use abandon_common::health::HealthHandle;
use abandon_common::kafka_consumer::{Offset, OffsetErr, ReceivedMessage, RecvErr, SingleTopicConsumer};
use abandon_common::retry::{RetryPolicy, RetryableError};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, DayBoundary, InvariantViolation};
use crate::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, FailureKind};
use crate::event::{AbandonmentRecord, EventBatch, MalformedMessage};
use crate::metrics_consts::{
    ABANDON_FLAG, ACK_FAILED, BATCH_SIZE, DATA_QUALITY_FAILURES, DEAD_LETTERED, DRAIN_ABORTED,
    DUPLICATE_RECORDS, MALFORMED_MESSAGES, MESSAGES_ACKNOWLEDGED, MESSAGES_FAILED,
    MESSAGES_RECEIVED, PROCESSING_TIME, QUEUE_RECV_ERRORS, RECORDS_WRITTEN, WORKER_SATURATION,
};
use crate::resolver::{DurationResolver, ResolveError};
use crate::store::{RecordStore, StoreError, WriteOutcome};

/// Errors that stop the consumer loop. Messages affected by them are left unacknowledged.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to receive from the queue: {0}")]
    Queue(#[from] RecvErr),
    #[error("failed to dead-letter message at partition {partition} offset {offset}: {error}")]
    DeadLetter {
        partition: i32,
        offset: i64,
        error: DeadLetterError,
    },
}

/// How a message was handled. Every variant is safe to acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Persisted,
    /// A record for the view instance already existed, e.g. after a redelivery.
    Duplicate,
    DeadLettered(FailureKind),
}

/// The reason a message could not be turned into a record.
#[derive(Error, Debug)]
enum StageError {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    fn kind(&self) -> FailureKind {
        match self {
            // A well-formed envelope without events is bad data, not a bad message.
            StageError::Malformed(MalformedMessage::NoEvents) => FailureKind::InvariantViolation,
            StageError::Malformed(_) => FailureKind::MalformedMessage,
            StageError::Invariant(_) | StageError::Resolve(ResolveError::InvalidDuration(_)) => {
                FailureKind::InvariantViolation
            }
            StageError::Resolve(ResolveError::Lookup(error)) if !error.is_retryable() => {
                FailureKind::LookupRejected
            }
            // Retries ran out, or the store refused the write outright. Either way a
            // replay from the dead-letter topic is the way to recover the record.
            StageError::Resolve(ResolveError::Lookup(_)) | StageError::Store(_) => {
                FailureKind::TransientIoExhausted
            }
        }
    }
}

/// Acknowledges a received message so it is not delivered again.
pub trait Acknowledge: Send + 'static {
    fn ack(self) -> Result<(), OffsetErr>;
}

/// A queue the ingestor polls for messages.
#[async_trait]
pub trait MessageSource: Send + Sync {
    type Ack: Acknowledge;

    async fn recv(&self) -> Result<(ReceivedMessage, Self::Ack), RecvErr>;
}

impl Acknowledge for Offset {
    fn ack(self) -> Result<(), OffsetErr> {
        self.store()
    }
}

#[async_trait]
impl MessageSource for SingleTopicConsumer {
    type Ack = Offset;

    async fn recv(&self) -> Result<(ReceivedMessage, Offset), RecvErr> {
        SingleTopicConsumer::recv(self).await
    }
}

/// Turns playback event batches into abandonment records.
///
/// A message goes through parsing, duration resolution, classification and
/// persistence. Whatever fails along the way is dead-lettered, so `process` only
/// returns an error when a message could be neither persisted nor set aside.
pub struct EventIngestor {
    resolver: DurationResolver,
    store: Arc<dyn RecordStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    day_boundary: DayBoundary,
    retry_policy: RetryPolicy,
    timeouts: IngestTimeouts,
    /// Maximum number of messages processed at the same time.
    max_concurrent_batches: usize,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestTimeouts {
    /// How long a single poll of the queue may wait for a message.
    pub poll: Duration,
    pub persist: Duration,
    pub dead_letter: Duration,
    /// How long in-flight messages may keep running once shutdown starts.
    pub shutdown_grace_period: Duration,
}

impl EventIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resolver: DurationResolver,
        store: Arc<dyn RecordStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        day_boundary: DayBoundary,
        retry_policy: RetryPolicy,
        timeouts: IngestTimeouts,
        max_concurrent_batches: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            resolver,
            store,
            dead_letters,
            day_boundary,
            retry_policy,
            timeouts,
            max_concurrent_batches: max_concurrent_batches.max(1),
            liveness,
        }
    }

    /// Handle one message end to end. On `Ok` the message can be acknowledged.
    pub async fn process(&self, message: &ReceivedMessage) -> Result<Processed, IngestError> {
        let started = Instant::now();
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        let result = match EventBatch::from_payload(message.payload.as_deref()) {
            Ok(batch) => match self.ingest(&batch).await {
                Ok(processed) => Ok(processed),
                Err(error) => {
                    self.reject(message, Some(batch.view_instance_id()), error)
                        .await
                }
            },
            Err(error) => self.reject(message, None, error.into()).await,
        };

        metrics::histogram!(PROCESSING_TIME).record(started.elapsed().as_secs_f64());
        result
    }

    async fn ingest(&self, batch: &EventBatch) -> Result<Processed, StageError> {
        metrics::histogram!(BATCH_SIZE).record(batch.events().len() as f64);

        let duration = self.resolver.resolve(batch.video_id()).await?;
        let classification = classify(batch, duration, &self.day_boundary)?;
        let record = AbandonmentRecord::new(batch, classification);

        let store = &self.store;
        let record_ref = &record;
        let persist_timeout = self.timeouts.persist;
        let outcome = self
            .retry_policy
            .retry("persist_record", || async move {
                timeout(persist_timeout, store.add_record(record_ref))
                    .await
                    .map_err(|_| StoreError::Timeout(persist_timeout))?
            })
            .await?;

        match outcome {
            WriteOutcome::Inserted => {
                metrics::counter!(RECORDS_WRITTEN).increment(1);
                metrics::histogram!(ABANDON_FLAG).record(record.abandon_flag as f64);
                debug!(
                    view_instance_id = record.view_instance_id,
                    video_id = record.video_id,
                    abandon_flag = record.abandon_flag,
                    "abandonment record persisted"
                );
                Ok(Processed::Persisted)
            }
            WriteOutcome::Duplicate => {
                metrics::counter!(DUPLICATE_RECORDS).increment(1);
                info!(
                    view_instance_id = record.view_instance_id,
                    "record already exists, skipping"
                );
                Ok(Processed::Duplicate)
            }
        }
    }

    /// Send a failed message to the dead-letter topic.
    async fn reject(
        &self,
        message: &ReceivedMessage,
        view_instance_id: Option<&str>,
        error: StageError,
    ) -> Result<Processed, IngestError> {
        let kind = error.kind();
        match kind {
            FailureKind::MalformedMessage => metrics::counter!(MALFORMED_MESSAGES).increment(1),
            FailureKind::InvariantViolation => {
                metrics::counter!(DATA_QUALITY_FAILURES).increment(1)
            }
            FailureKind::LookupRejected | FailureKind::TransientIoExhausted => {}
        }
        warn!(
            partition = message.partition,
            offset = message.offset,
            view_instance_id,
            reason = kind.as_str(),
            "dead-lettering message: {}",
            error
        );

        let letter = DeadLetter {
            reason: kind,
            error: error.to_string(),
            view_instance_id: view_instance_id.map(str::to_owned),
            partition: message.partition,
            offset: message.offset,
            payload: message
                .payload
                .as_deref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default(),
            failed_at: Utc::now(),
        };

        let sink = &self.dead_letters;
        let letter_ref = &letter;
        let dead_letter_timeout = self.timeouts.dead_letter;
        self.retry_policy
            .retry("dead_letter", || async move {
                timeout(dead_letter_timeout, sink.send(letter_ref))
                    .await
                    .map_err(|_| DeadLetterError::Timeout(dead_letter_timeout))?
            })
            .await
            .map_err(|error| IngestError::DeadLetter {
                partition: message.partition,
                offset: message.offset,
                error,
            })?;

        metrics::counter!(DEAD_LETTERED, "reason" => kind.as_str()).increment(1);
        Ok(Processed::DeadLettered(kind))
    }

    /// Process a message and acknowledge it once it is safe to do so. A message that
    /// could not be handled is left unacknowledged and the whole worker is shut down,
    /// so the queue delivers it again after a restart.
    async fn handle<A: Acknowledge>(
        &self,
        message: ReceivedMessage,
        ack: A,
        shutdown: &CancellationToken,
    ) -> Result<(), IngestError> {
        match self.process(&message).await {
            Ok(_) => {
                match ack.ack() {
                    Ok(()) => metrics::counter!(MESSAGES_ACKNOWLEDGED).increment(1),
                    Err(error) => {
                        // The message was handled, a redelivery will be a duplicate.
                        metrics::counter!(ACK_FAILED).increment(1);
                        error!(
                            partition = message.partition,
                            offset = message.offset,
                            "failed to acknowledge message: {}",
                            error
                        );
                    }
                }
                Ok(())
            }
            Err(error) => {
                metrics::counter!(MESSAGES_FAILED).increment(1);
                error!(
                    partition = message.partition,
                    offset = message.offset,
                    "failed to process message, shutting down: {}",
                    error
                );
                shutdown.cancel();
                Err(error)
            }
        }
    }

    /// Poll `source` and process messages concurrently until `shutdown` is cancelled,
    /// the queue keeps failing, or a message can neither be persisted nor dead-lettered.
    pub async fn run<S>(
        self: Arc<Self>,
        source: S,
        shutdown: CancellationToken,
    ) -> Result<(), IngestError>
    where
        S: MessageSource + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_batches));
        let report_semaphore_utilization = || {
            metrics::gauge!(WORKER_SATURATION).set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_batches as f64,
            );
        };

        let mut tasks = JoinSet::new();
        let mut fatal = None;
        let mut recv_failures = 0;

        let stopped = loop {
            self.liveness.report_healthy();
            report_semaphore_utilization();

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next() => {
                    collect(joined, &mut fatal);
                    continue;
                }
                // Saturated: loop around to keep reporting liveness.
                _ = sleep(self.timeouts.poll) => continue,
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore has been closed")
                }
            };

            let polled = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                polled = timeout(self.timeouts.poll, source.recv()) => polled,
            };

            let (message, ack) = match polled {
                Err(_elapsed) => continue,
                Ok(Ok(received)) => {
                    recv_failures = 0;
                    received
                }
                Ok(Err(error)) => {
                    metrics::counter!(QUEUE_RECV_ERRORS).increment(1);
                    if recv_failures + 1 >= self.retry_policy.max_attempts() {
                        error!("giving up on the queue: {}", error);
                        break Err(IngestError::Queue(error));
                    }

                    let wait = self.retry_policy.time_until_next_retry(recv_failures, None);
                    recv_failures += 1;
                    warn!(
                        attempt = recv_failures,
                        "failed to receive from the queue, retrying in {:?}: {}",
                        wait,
                        error
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = sleep(wait) => continue,
                    }
                }
            };

            let ingestor = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let result = ingestor.handle(message, ack, &shutdown).await;
                drop(permit);
                result
            });
        };

        info!(in_flight = tasks.len(), "consumer loop stopped, draining");
        let drain = async {
            let mut heartbeat =
                tokio::time::interval(self.timeouts.poll.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        Some(joined) => collect(joined, &mut fatal),
                        None => break,
                    },
                    // Still alive while in-flight messages finish.
                    _ = heartbeat.tick() => self.liveness.report_healthy(),
                }
            }
        };
        let drained = timeout(self.timeouts.shutdown_grace_period, drain).await;

        if drained.is_err() {
            let remaining = tasks.len();
            warn!(
                remaining,
                "shutdown grace period elapsed, aborting unacknowledged messages"
            );
            metrics::counter!(DRAIN_ABORTED).increment(remaining as u64);
            tasks.abort_all();
        }

        match (stopped, fatal) {
            (Err(error), _) | (Ok(()), Some(error)) => Err(error),
            (Ok(()), None) => Ok(()),
        }
    }
}

fn collect(joined: Result<Result<(), IngestError>, JoinError>, fatal: &mut Option<IngestError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            fatal.get_or_insert(error);
        }
        Err(error) if error.is_cancelled() => {}
        Err(error) => error!("message task panicked: {}", error),
    }
}

/// An in-memory queue, for tests. Messages are pushed through the sender returned by
/// `ChannelSource::new`, and acknowledgments are recorded as (partition, offset).
pub struct ChannelSource {
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<ReceivedMessage, RecvErr>>>,
    acked: Arc<Mutex<Vec<(i32, i64)>>>,
}

pub struct ChannelAck {
    partition: i32,
    offset: i64,
    acked: Arc<Mutex<Vec<(i32, i64)>>>,
}

impl ChannelSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<ReceivedMessage, RecvErr>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let source = Self {
            receiver: tokio::sync::Mutex::new(receiver),
            acked: Default::default(),
        };
        (source, sender)
    }

    /// A handle on the acknowledgments, usable after the source moved into `run`.
    pub fn acked(&self) -> Arc<Mutex<Vec<(i32, i64)>>> {
        self.acked.clone()
    }
}

impl Acknowledge for ChannelAck {
    fn ack(self) -> Result<(), OffsetErr> {
        self.acked
            .lock()
            .map_err(|_| OffsetErr::Poisoned)?
            .push((self.partition, self.offset));
        Ok(())
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    type Ack = ChannelAck;

    async fn recv(&self) -> Result<(ReceivedMessage, ChannelAck), RecvErr> {
        let Some(received) = self.receiver.lock().await.recv().await else {
            // Closed: behave like an idle topic.
            return std::future::pending().await;
        };

        let message = received?;
        let ack = ChannelAck {
            partition: message.partition,
            offset: message.offset,
            acked: self.acked.clone(),
        };
        Ok((message, ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockDurationCache;
    use crate::dead_letter::MockDeadLetterSink;
    use crate::lookup::MockDurationLookup;
    use crate::store::MockRecordStore;
    use abandon_common::health::HealthRegistry;

    // 2024-03-13T14:00:00Z
    const AFTERNOON_MS: i64 = 1_710_338_400_000;

    struct Harness {
        cache: MockDurationCache,
        lookup: MockDurationLookup,
        store: MockRecordStore,
        dead_letters: MockDeadLetterSink,
        timeouts: IngestTimeouts,
        registry: HealthRegistry,
        liveness_deadline: time::Duration,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cache: MockDurationCache::new(),
                lookup: MockDurationLookup::new().with_duration("video", 600.0),
                store: MockRecordStore::new(),
                dead_letters: MockDeadLetterSink::new(),
                timeouts: IngestTimeouts {
                    poll: Duration::from_millis(20),
                    persist: Duration::from_millis(100),
                    dead_letter: Duration::from_millis(100),
                    shutdown_grace_period: Duration::from_secs(1),
                },
                registry: HealthRegistry::new("liveness"),
                liveness_deadline: time::Duration::seconds(30),
            }
        }

        fn ingestor(&self) -> EventIngestor {
            let policy = RetryPolicy::build(2, Duration::from_millis(1))
                .max_attempts(3)
                .provide();
            let resolver = DurationResolver::new(
                Arc::new(self.cache.clone()),
                Arc::new(self.lookup.clone()),
                policy,
                Duration::from_millis(100),
                Duration::from_millis(100),
            );
            let liveness = self.registry.register("ingestor", self.liveness_deadline);

            EventIngestor::new(
                resolver,
                Arc::new(self.store.clone()),
                Arc::new(self.dead_letters.clone()),
                DayBoundary::default(),
                policy,
                self.timeouts,
                4,
                liveness,
            )
        }
    }

    fn message(offset: i64, payload: &str) -> ReceivedMessage {
        ReceivedMessage {
            payload: Some(payload.as_bytes().to_vec()),
            partition: 0,
            offset,
        }
    }

    fn batch_payload(view: &str, video: &str, timestamps: &[i64]) -> String {
        let events: Vec<String> = timestamps
            .iter()
            .map(|ts| {
                format!(
                    r#"{{"viewInstanceId": "{}", "videoId": "{}", "event_timestamp": {}}}"#,
                    view, video, ts
                )
            })
            .collect();
        format!(r#"{{"Events": [{}]}}"#, events.join(", "))
    }

    #[tokio::test]
    async fn test_persists_classified_record() {
        let harness = Harness::new();
        let payload = batch_payload("view", "video", &[AFTERNOON_MS, AFTERNOON_MS + 450_000]);

        let processed = harness.ingestor().process(&message(0, &payload)).await.unwrap();

        assert_eq!(processed, Processed::Persisted);
        let record = harness.store.record("view").unwrap();
        assert_eq!(record.abandon_flag, 1);
        assert_eq!(record.video_id, "video");
        assert!(harness.dead_letters.letters().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_is_a_duplicate() {
        let harness = Harness::new();
        let ingestor = harness.ingestor();
        let payload = batch_payload("view", "video", &[AFTERNOON_MS]);

        assert_eq!(
            ingestor.process(&message(0, &payload)).await.unwrap(),
            Processed::Persisted
        );
        assert_eq!(
            ingestor.process(&message(0, &payload)).await.unwrap(),
            Processed::Duplicate
        );
        assert_eq!(harness.store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered() {
        let harness = Harness::new();

        let processed = harness
            .ingestor()
            .process(&message(7, "not json"))
            .await
            .unwrap();

        assert_eq!(processed, Processed::DeadLettered(FailureKind::MalformedMessage));
        let letters = harness.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].offset, 7);
        assert_eq!(letters[0].payload, "not json");
        assert_eq!(letters[0].view_instance_id, None);
        assert_eq!(harness.lookup.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_violates_invariants() {
        let harness = Harness::new();

        let processed = harness
            .ingestor()
            .process(&message(4, r#"{"Events": []}"#))
            .await
            .unwrap();

        assert_eq!(
            processed,
            Processed::DeadLettered(FailureKind::InvariantViolation)
        );
        let letters = harness.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, FailureKind::InvariantViolation);
        assert_eq!(letters[0].view_instance_id, None);
        assert!(harness.store.records().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_events_violate_invariants() {
        let harness = Harness::new();
        let payload = batch_payload("view", "video", &[AFTERNOON_MS + 1000, AFTERNOON_MS]);

        let processed = harness.ingestor().process(&message(0, &payload)).await.unwrap();

        assert_eq!(
            processed,
            Processed::DeadLettered(FailureKind::InvariantViolation)
        );
        let letters = harness.dead_letters.letters();
        assert_eq!(letters[0].view_instance_id.as_deref(), Some("view"));
        assert!(harness.store.records().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failures_are_classified() {
        let mut harness = Harness::new();
        let unknown = batch_payload("view", "unknown", &[AFTERNOON_MS]);

        let processed = harness.ingestor().process(&message(0, &unknown)).await.unwrap();
        assert_eq!(processed, Processed::DeadLettered(FailureKind::LookupRejected));

        harness.lookup = MockDurationLookup::new()
            .with_duration("video", 600.0)
            .failing_first(10);
        let flaky = batch_payload("other", "video", &[AFTERNOON_MS]);

        let processed = harness.ingestor().process(&message(1, &flaky)).await.unwrap();
        assert_eq!(
            processed,
            Processed::DeadLettered(FailureKind::TransientIoExhausted)
        );
        assert!(harness.store.records().is_empty());
        assert_eq!(harness.dead_letters.letters().len(), 2);
    }

    #[tokio::test]
    async fn test_transient_store_failures_are_retried() {
        let mut harness = Harness::new();
        harness.store = MockRecordStore::new().failing_first(2);
        let payload = batch_payload("view", "video", &[AFTERNOON_MS]);

        let processed = harness.ingestor().process(&message(0, &payload)).await.unwrap();

        assert_eq!(processed, Processed::Persisted);
        assert_eq!(harness.store.attempts(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_dead_letter_sink_is_fatal() {
        let mut harness = Harness::new();
        harness.dead_letters = MockDeadLetterSink::new().unavailable();

        let error = harness
            .ingestor()
            .process(&message(3, ""))
            .await
            .unwrap_err();

        assert!(matches!(error, IngestError::DeadLetter { offset: 3, .. }));
    }

    #[tokio::test]
    async fn test_run_acknowledges_handled_messages() {
        let harness = Harness::new();
        let (source, sender) = ChannelSource::new();
        let acked = source.acked();
        let shutdown = CancellationToken::new();

        sender
            .send(Ok(message(0, &batch_payload("a", "video", &[AFTERNOON_MS]))))
            .unwrap();
        sender.send(Ok(message(1, "{}"))).unwrap();
        sender
            .send(Ok(message(2, &batch_payload("b", "video", &[AFTERNOON_MS]))))
            .unwrap();

        let run = tokio::spawn(
            Arc::new(harness.ingestor()).run(source, shutdown.clone()),
        );

        for _ in 0..200 {
            if acked.lock().unwrap().len() == 3 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        run.await.unwrap().unwrap();

        let mut acked = acked.lock().unwrap().clone();
        acked.sort();
        assert_eq!(acked, vec![(0, 0), (0, 1), (0, 2)]);
        assert_eq!(harness.store.records().len(), 2);
        assert_eq!(harness.dead_letters.letters().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_without_ack_when_dead_lettering_fails() {
        let mut harness = Harness::new();
        harness.dead_letters = MockDeadLetterSink::new().unavailable();
        let (source, sender) = ChannelSource::new();
        let acked = source.acked();
        let shutdown = CancellationToken::new();

        sender.send(Ok(message(0, "not json"))).unwrap();

        let error = Arc::new(harness.ingestor())
            .run(source, shutdown.clone())
            .await
            .unwrap_err();

        assert!(matches!(error, IngestError::DeadLetter { offset: 0, .. }));
        assert!(shutdown.is_cancelled());
        assert!(acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_gives_up_on_a_failing_queue() {
        let harness = Harness::new();
        let (source, sender) = ChannelSource::new();

        for _ in 0..3 {
            sender.send(Err(RecvErr::Poisoned)).unwrap();
        }

        let error = Arc::new(harness.ingestor())
            .run(source, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(error, IngestError::Queue(RecvErr::Poisoned)));
    }

    #[tokio::test]
    async fn test_run_recovers_from_a_queue_hiccup() {
        let harness = Harness::new();
        let (source, sender) = ChannelSource::new();
        let acked = source.acked();
        let shutdown = CancellationToken::new();

        sender.send(Err(RecvErr::Poisoned)).unwrap();
        sender
            .send(Ok(message(0, &batch_payload("a", "video", &[AFTERNOON_MS]))))
            .unwrap();

        let run = tokio::spawn(
            Arc::new(harness.ingestor()).run(source, shutdown.clone()),
        );

        for _ in 0..200 {
            if !acked.lock().unwrap().is_empty() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();

        assert!(run.await.unwrap().is_ok());
        assert_eq!(acked.lock().unwrap().len(), 1);
    }

    async fn wait_for_write(store: &MockRecordStore) {
        for _ in 0..200 {
            if store.attempts() > 0 {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("write never started");
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_messages() {
        let mut harness = Harness::new();
        harness.store = MockRecordStore::new().with_write_delay(Duration::from_millis(200));
        harness.timeouts.persist = Duration::from_secs(1);
        harness.timeouts.shutdown_grace_period = Duration::from_secs(2);
        harness.liveness_deadline = time::Duration::milliseconds(100);
        let (source, sender) = ChannelSource::new();
        let acked = source.acked();
        let shutdown = CancellationToken::new();

        sender
            .send(Ok(message(0, &batch_payload("view", "video", &[AFTERNOON_MS]))))
            .unwrap();

        let run = tokio::spawn(
            Arc::new(harness.ingestor()).run(source, shutdown.clone()),
        );

        wait_for_write(&harness.store).await;
        shutdown.cancel();

        // Past the liveness deadline, with the write still running.
        sleep(Duration::from_millis(150)).await;
        assert!(harness.registry.get_status().healthy);

        run.await.unwrap().unwrap();

        assert!(harness.store.record("view").is_some());
        assert_eq!(acked.lock().unwrap().clone(), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_messages_past_the_grace_period() {
        let mut harness = Harness::new();
        harness.store = MockRecordStore::new().with_write_delay(Duration::from_secs(10));
        harness.timeouts.persist = Duration::from_secs(20);
        harness.timeouts.shutdown_grace_period = Duration::from_millis(100);
        let (source, sender) = ChannelSource::new();
        let acked = source.acked();
        let shutdown = CancellationToken::new();

        sender
            .send(Ok(message(0, &batch_payload("view", "video", &[AFTERNOON_MS]))))
            .unwrap();

        let run = tokio::spawn(
            Arc::new(harness.ingestor()).run(source, shutdown.clone()),
        );

        wait_for_write(&harness.store).await;
        let cancelled_at = Instant::now();
        shutdown.cancel();

        run.await.unwrap().unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert!(harness.store.records().is_empty());
        assert!(acked.lock().unwrap().is_empty());
    }
}
