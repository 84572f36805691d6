use std::sync::Arc;
use std::time::Duration;

use abandon_common::health::HealthRegistry;
use abandon_common::kafka_consumer::ReceivedMessage;
use abandon_common::retry::RetryPolicy;
use abandon_worker::cache::{DurationCache, MockDurationCache};
use abandon_worker::classifier::{DayBoundary, DayPeriod, YearWeek};
use abandon_worker::dead_letter::{FailureKind, MockDeadLetterSink};
use abandon_worker::event::AbandonmentRecord;
use abandon_worker::ingestor::{ChannelSource, EventIngestor, IngestTimeouts, Processed};
use abandon_worker::lookup::MockDurationLookup;
use abandon_worker::resolver::DurationResolver;
use abandon_worker::store::MockRecordStore;
use tokio_util::sync::CancellationToken;

// 2024-03-13T14:00:00Z: a Wednesday afternoon in ISO week 11
const T: i64 = 1_710_338_400_000;

fn ingestor(
    cache: &MockDurationCache,
    lookup: &MockDurationLookup,
    store: &MockRecordStore,
    dead_letters: &MockDeadLetterSink,
) -> EventIngestor {
    let policy = RetryPolicy::build(2, Duration::from_millis(1))
        .max_attempts(3)
        .provide();
    let resolver = DurationResolver::new(
        Arc::new(cache.clone()),
        Arc::new(lookup.clone()),
        policy,
        Duration::from_millis(100),
        Duration::from_millis(100),
    );

    EventIngestor::new(
        resolver,
        Arc::new(store.clone()),
        Arc::new(dead_letters.clone()),
        DayBoundary::default(),
        policy,
        IngestTimeouts {
            poll: Duration::from_millis(20),
            persist: Duration::from_millis(100),
            dead_letter: Duration::from_millis(100),
            shutdown_grace_period: Duration::from_secs(1),
        },
        8,
        HealthRegistry::new("liveness").register("ingestor", time::Duration::seconds(30)),
    )
}

fn message(offset: i64, payload: &str) -> ReceivedMessage {
    ReceivedMessage {
        payload: Some(payload.as_bytes().to_vec()),
        partition: 0,
        offset,
    }
}

fn batch(view: &str, video: &str, timestamps: &[i64]) -> String {
    let events: Vec<serde_json::Value> = timestamps
        .iter()
        .map(|ts| {
            serde_json::json!({
                "viewInstanceId": view,
                "videoId": video,
                "event_timestamp": ts,
            })
        })
        .collect();
    serde_json::json!({ "Events": events }).to_string()
}

async fn record_for(cache: MockDurationCache, payload: &str) -> AbandonmentRecord {
    let lookup = MockDurationLookup::new().with_duration("V", 600.0);
    let store = MockRecordStore::new();
    let dead_letters = MockDeadLetterSink::new();

    let processed = ingestor(&cache, &lookup, &store, &dead_letters)
        .process(&message(0, payload))
        .await
        .expect("failed to process message");

    assert_eq!(processed, Processed::Persisted);
    store.record("view").expect("record was not persisted")
}

#[tokio::test]
async fn single_event_with_cached_duration_is_not_abandoned() {
    let cache = MockDurationCache::new().with_entry("V", 600.0);

    let record = record_for(cache, &batch("view", "V", &[T])).await;

    assert_eq!(record.abandon_flag, 0);
    assert_eq!(record.day_flag, DayPeriod::Day);
    assert_eq!(
        record.year_week,
        YearWeek {
            year: 2024,
            week: 11
        }
    );
    assert_eq!(record.watch_timestamp.timestamp_millis(), T);
}

#[tokio::test]
async fn watching_three_quarters_sets_the_flag() {
    let cache = MockDurationCache::new().with_entry("V", 600.0);

    let record = record_for(cache, &batch("view", "V", &[T, T + 200_000, T + 450_000])).await;

    assert_eq!(record.abandon_flag, 1);
}

#[tokio::test]
async fn cache_miss_and_hit_produce_the_same_record() {
    let payload = batch("view", "V", &[T, T + 450_000]);

    let cold = MockDurationCache::new();
    let from_lookup = record_for(cold.clone(), &payload).await;

    assert_eq!(cold.get("V").await.unwrap(), Some(600.0));

    let warm = MockDurationCache::new().with_entry("V", 600.0);
    let from_cache = record_for(warm, &payload).await;

    assert_eq!(from_lookup, from_cache);
}

#[tokio::test]
async fn malformed_message_is_dead_lettered_and_the_loop_keeps_going() {
    let cache = MockDurationCache::new().with_entry("V", 600.0);
    let lookup = MockDurationLookup::new();
    let store = MockRecordStore::new();
    let dead_letters = MockDeadLetterSink::new();
    let ingestor = Arc::new(ingestor(&cache, &lookup, &store, &dead_letters));

    let (source, sender) = ChannelSource::new();
    let acked = source.acked();
    let shutdown = CancellationToken::new();

    let missing_events = r#"{"events": [{"viewInstanceId": "bad", "videoId": "V", "event_timestamp": 1}]}"#;
    sender.send(Ok(message(0, missing_events))).unwrap();
    sender
        .send(Ok(message(1, &batch("view", "V", &[T]))))
        .unwrap();

    let run = tokio::spawn(ingestor.run(source, shutdown.clone()));

    for _ in 0..200 {
        if acked.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    run.await.unwrap().expect("consumer loop failed");

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, FailureKind::MalformedMessage);
    assert_eq!(letters[0].payload, missing_events);

    assert!(store.record("bad").is_none());
    assert!(store.record("view").is_some());
    assert_eq!(acked.lock().unwrap().len(), 2);
}
