//! Consume playback event batches from Kafka and persist abandonment records.
use std::sync::Arc;

use abandon_common::health::HealthRegistry;
use abandon_common::kafka_consumer::SingleTopicConsumer;
use abandon_common::kafka_producer::{create_kafka_producer, flush_producer};
use abandon_common::metrics::{serve, setup_metrics_router};
use abandon_worker::cache::RedisDurationCache;
use abandon_worker::config::Config;
use abandon_worker::dead_letter::KafkaDeadLetterSink;
use abandon_worker::ingestor::{EventIngestor, IngestError, IngestTimeouts};
use abandon_worker::lookup::HttpDurationLookup;
use abandon_worker::resolver::DurationResolver;
use abandon_worker::store::PgRecordStore;
use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        // Stopped from inside, e.g. after a fatal processing error
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), IngestError> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().expect("Invalid configuration:");
    let day_boundary = config.day_boundary().expect("Invalid day boundary:");
    let retry_policy = config.retry_policy.policy();

    let liveness = HealthRegistry::new("liveness");
    let ingestor_liveness = liveness.register(
        "ingestor",
        time::Duration::milliseconds(config.poll_timeout.0.as_millis() as i64 * 10),
    );
    let producer_liveness = liveness.register("rdkafka", time::Duration::seconds(30));

    let bind = config.bind();
    let router = setup_metrics_router(liveness);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let cache = RedisDurationCache::new(
        &config.redis_url,
        &config.cache_key_prefix,
        config.cache_ttl_secs,
    )
    .await
    .expect("failed to connect to redis");
    let lookup = HttpDurationLookup::new(&config.duration_lookup_url, config.lookup_timeout.0)
        .expect("failed to construct duration lookup client");
    let store = Arc::new(
        PgRecordStore::new(&config.database_url, config.max_pg_connections)
            .await
            .expect("failed to connect to postgres"),
    );

    let producer = create_kafka_producer(&config.kafka, producer_liveness)
        .await
        .expect("failed to create kafka producer");
    let dead_letters = Arc::new(KafkaDeadLetterSink::new(
        producer,
        config.dead_letter_topic.as_str(),
        config.dead_letter_timeout.0,
    ));

    let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())
        .expect("failed to create kafka consumer");

    let resolver = DurationResolver::new(
        Arc::new(cache),
        Arc::new(lookup),
        retry_policy,
        config.cache_timeout.0,
        config.lookup_timeout.0,
    );
    let ingestor = Arc::new(EventIngestor::new(
        resolver,
        store.clone(),
        dead_letters.clone(),
        day_boundary,
        retry_policy,
        IngestTimeouts {
            poll: config.poll_timeout.0,
            persist: config.persist_timeout.0,
            dead_letter: config.dead_letter_timeout.0,
            shutdown_grace_period: config.shutdown_grace_period.0,
        },
        config.max_concurrent_batches,
        ingestor_liveness,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));

    info!(topic = consumer.topic(), "consuming playback events");
    let result = ingestor.run(consumer, shutdown.clone()).await;
    shutdown.cancel();

    if let Err(error) = &result {
        error!("ingestor stopped: {}", error);
    }

    store.close().await;
    flush_producer(dead_letters.producer(), config.dead_letter_timeout.0);
    info!("shut down");

    result
}
