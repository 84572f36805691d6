use std::sync::{Arc, Mutex};
use std::time::Duration;

use abandon_common::kafka_producer::{send_json_to_kafka, KafkaContext, KafkaProduceError};
use abandon_common::retry::RetryableError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::FutureProducer;
use serde::Serialize;
use thiserror::Error;

/// Why a message could not produce a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The payload could not be parsed into a batch.
    MalformedMessage,
    /// The batch or its duration broke a classification invariant.
    InvariantViolation,
    /// The lookup service refused the video, e.g. it does not exist.
    LookupRejected,
    /// A dependency kept failing until the retry policy gave up.
    TransientIoExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::MalformedMessage => "malformed_message",
            FailureKind::InvariantViolation => "invariant_violation",
            FailureKind::LookupRejected => "lookup_rejected",
            FailureKind::TransientIoExhausted => "transient_io_exhausted",
        }
    }
}

/// A message set aside for inspection, with enough context to replay it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub reason: FailureKind,
    pub error: String,
    pub view_instance_id: Option<String>,
    pub partition: i32,
    pub offset: i64,
    /// The original payload, decoded lossily as UTF-8.
    pub payload: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error(transparent)]
    Produce(#[from] KafkaProduceError),
    #[error("dead-letter publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("dead-letter sink unavailable: {0}")]
    Unavailable(String),
}

impl RetryableError for DeadLetterError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DeadLetterError::Produce(KafkaProduceError::SerializationError { .. })
        )
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    produce_timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str, produce_timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
            produce_timeout,
        }
    }

    pub fn producer(&self) -> &FutureProducer<KafkaContext> {
        &self.producer
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        send_json_to_kafka(
            &self.producer,
            &self.topic,
            letter.view_instance_id.as_deref(),
            letter,
            self.produce_timeout,
        )
        .await?;
        Ok(())
    }
}

/// Collects dead letters in memory, for tests. Can be switched to always fail.
#[derive(Clone, Default)]
pub struct MockDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    unavailable: bool,
}

impl MockDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().expect("poisoned sink lock").clone()
    }
}

#[async_trait]
impl DeadLetterSink for MockDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        if self.unavailable {
            return Err(DeadLetterError::Unavailable("mock sink down".to_owned()));
        }
        self.letters
            .lock()
            .expect("poisoned sink lock")
            .push(letter.clone());
        Ok(())
    }
}
