use std::sync::{Arc, Mutex, Weak};

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::offsets::OffsetTracker;

#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
    tracker: Mutex<OffsetTracker>,
}

/// A message read from the topic. The payload is kept raw so callers can dead-letter
/// what they fail to parse.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Option<Vec<u8>>,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Offset tracker lock poisoned")]
    Poisoned,
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
    #[error("Offset tracker lock poisoned")]
    Poisoned,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        // Offsets are only stored once a message is acknowledged
        client_config.set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        let inner = Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic,
            tracker: Mutex::new(OffsetTracker::new()),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Wait for the next message. The returned `Offset` must be stored once the message
    /// is fully handled; dropping it leaves the message unacknowledged.
    pub async fn recv(&self) -> Result<(ReceivedMessage, Offset), RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let received = ReceivedMessage {
            payload: message.payload().map(<[u8]>::to_vec),
            partition: message.partition(),
            offset: message.offset(),
        };

        self.inner
            .tracker
            .lock()
            .map_err(|_| RecvErr::Poisoned)?
            .received(received.partition, received.offset);

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: received.partition,
            offset: received.offset,
        };

        Ok((received, offset))
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    /// Acknowledge the message. The partition's stored offset only advances once every
    /// earlier message of the partition has been acknowledged too.
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        let next = inner
            .tracker
            .lock()
            .map_err(|_| OffsetErr::Poisoned)?
            .completed(self.partition, self.offset);

        // Kafka resumes a partition from the stored offset, so it must point past the
        // last acknowledged message.
        if let Some(next) = next {
            inner
                .consumer
                .store_offset(&inner.topic, self.partition, next)?;
        }
        Ok(())
    }
}
