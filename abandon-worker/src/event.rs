use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::{Classification, DayPeriod, YearWeek};

/// A single playback event, as produced by the video player.
///
/// `event_timestamp` is a Unix timestamp in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    #[serde(rename = "viewInstanceId")]
    pub view_instance_id: String,
    #[serde(rename = "videoId")]
    pub video_id: String,
    pub event_timestamp: i64,
}

/// The message envelope read from the queue.
#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(rename = "Events")]
    events: Vec<PlaybackEvent>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MalformedMessage {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("payload is not a valid event message: {0}")]
    InvalidJson(String),
    #[error("message contains no events")]
    NoEvents,
    #[error("event {index} belongs to view instance {found}, expected {expected}")]
    MixedViewInstances {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("event {index} references video {found}, expected {expected}")]
    MixedVideos {
        index: usize,
        expected: String,
        found: String,
    },
}

/// The events of one view instance, in arrival order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    events: Vec<PlaybackEvent>,
}

impl EventBatch {
    /// Build a batch, checking it is non-empty and describes a single view of a single video.
    pub fn new(events: Vec<PlaybackEvent>) -> Result<Self, MalformedMessage> {
        let first = events.first().ok_or(MalformedMessage::NoEvents)?;

        for (index, event) in events.iter().enumerate().skip(1) {
            if event.view_instance_id != first.view_instance_id {
                return Err(MalformedMessage::MixedViewInstances {
                    index,
                    expected: first.view_instance_id.clone(),
                    found: event.view_instance_id.clone(),
                });
            }
            if event.video_id != first.video_id {
                return Err(MalformedMessage::MixedVideos {
                    index,
                    expected: first.video_id.clone(),
                    found: event.video_id.clone(),
                });
            }
        }

        Ok(Self { events })
    }

    /// Parse a raw queue payload of the form `{"Events": [...]}`.
    pub fn from_payload(payload: Option<&[u8]>) -> Result<Self, MalformedMessage> {
        let payload = payload
            .filter(|bytes| !bytes.is_empty())
            .ok_or(MalformedMessage::EmptyPayload)?;

        let message: EventMessage = serde_json::from_slice(payload)
            .map_err(|error| MalformedMessage::InvalidJson(error.to_string()))?;

        Self::new(message.events)
    }

    pub fn first(&self) -> &PlaybackEvent {
        // Non-empty by construction.
        &self.events[0]
    }

    pub fn last(&self) -> &PlaybackEvent {
        &self.events[self.events.len() - 1]
    }

    pub fn view_instance_id(&self) -> &str {
        &self.first().view_instance_id
    }

    pub fn video_id(&self) -> &str {
        &self.first().video_id
    }

    pub fn events(&self) -> &[PlaybackEvent] {
        &self.events
    }
}

/// The outcome of classifying one view instance, written once per batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbandonmentRecord {
    pub view_instance_id: String,
    pub video_id: String,
    pub watch_timestamp: DateTime<Utc>,
    pub day_flag: DayPeriod,
    pub year_week: YearWeek,
    pub abandon_flag: i64,
}

impl AbandonmentRecord {
    pub fn new(batch: &EventBatch, classification: Classification) -> Self {
        Self {
            view_instance_id: batch.view_instance_id().to_owned(),
            video_id: batch.video_id().to_owned(),
            watch_timestamp: classification.watch_timestamp,
            day_flag: classification.day_flag,
            year_week: classification.year_week,
            abandon_flag: classification.abandon_flag,
        }
    }
}
