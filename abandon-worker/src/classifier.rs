//! Classification of a viewing session from its events and the video's duration.
//!
//! Everything here is pure: the same batch, duration and boundary always produce the
//! same classification.

use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Timelike, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::event::EventBatch;

/// Fraction of the video after which a session counts past the abandonment boundary.
pub const WATCHED_THRESHOLD: f64 = 0.75;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("video duration must be a positive number of seconds, got {0}")]
    NonPositiveDuration(f64),
    #[error("last event at {last} precedes first event at {first}")]
    EventsOutOfOrder { first: i64, last: i64 },
    #[error("timestamp {0} is out of the representable range")]
    TimestampOutOfRange(i64),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidDayBoundary {
    #[error("day must start before it ends, got {starts_at}h to {ends_at}h")]
    EmptyDay { starts_at: u32, ends_at: u32 },
    #[error("day cannot end after hour 24, got {0}")]
    HourOutOfRange(u32),
    #[error("utc offset of {0} minutes is out of range")]
    OffsetOutOfRange(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPeriod {
    Day,
    Night,
}

impl DayPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayPeriod::Day => "day",
            DayPeriod::Night => "night",
        }
    }
}

/// An ISO 8601 week, keyed by ISO week-year so the last days of December can land in
/// week 1 of the next year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearWeek {
    pub year: i32,
    pub week: u32,
}

impl YearWeek {
    /// `year * 100 + week`, e.g. 202501.
    pub fn encoded(&self) -> i32 {
        self.year * 100 + self.week as i32
    }
}

impl fmt::Display for YearWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

impl Serialize for YearWeek {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.encoded())
    }
}

/// The hours of local time that count as day. Local time is UTC shifted by a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct DayBoundary {
    starts_at_hour: u32,
    ends_at_hour: u32,
    offset: FixedOffset,
}

impl DayBoundary {
    pub fn new(
        starts_at_hour: u32,
        ends_at_hour: u32,
        utc_offset_minutes: i32,
    ) -> Result<Self, InvalidDayBoundary> {
        if ends_at_hour > 24 {
            return Err(InvalidDayBoundary::HourOutOfRange(ends_at_hour));
        }
        if starts_at_hour >= ends_at_hour {
            return Err(InvalidDayBoundary::EmptyDay {
                starts_at: starts_at_hour,
                ends_at: ends_at_hour,
            });
        }
        let offset = utc_offset_minutes
            .checked_mul(60)
            .filter(|seconds| seconds.abs() <= 18 * 3600)
            .and_then(FixedOffset::east_opt)
            .ok_or(InvalidDayBoundary::OffsetOutOfRange(utc_offset_minutes))?;

        Ok(Self {
            starts_at_hour,
            ends_at_hour,
            offset,
        })
    }

    fn local(&self, timestamp_ms: i64) -> Result<DateTime<FixedOffset>, InvariantViolation> {
        Ok(to_utc(timestamp_ms)?.with_timezone(&self.offset))
    }

    pub fn period_of(&self, timestamp_ms: i64) -> Result<DayPeriod, InvariantViolation> {
        let hour = self.local(timestamp_ms)?.hour();
        if (self.starts_at_hour..self.ends_at_hour).contains(&hour) {
            Ok(DayPeriod::Day)
        } else {
            Ok(DayPeriod::Night)
        }
    }

    pub fn year_week_of(&self, timestamp_ms: i64) -> Result<YearWeek, InvariantViolation> {
        let week = self.local(timestamp_ms)?.iso_week();
        Ok(YearWeek {
            year: week.year(),
            week: week.week(),
        })
    }
}

impl Default for DayBoundary {
    fn default() -> Self {
        Self {
            starts_at_hour: 6,
            ends_at_hour: 18,
            offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub watch_timestamp: DateTime<Utc>,
    pub day_flag: DayPeriod,
    pub year_week: YearWeek,
    pub abandon_flag: i64,
}

fn to_utc(timestamp_ms: i64) -> Result<DateTime<Utc>, InvariantViolation> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or(InvariantViolation::TimestampOutOfRange(timestamp_ms))
}

/// Seconds between the first and the last event of the batch, in arrival order.
pub fn watched_seconds(batch: &EventBatch) -> Result<f64, InvariantViolation> {
    let first = batch.first().event_timestamp;
    let last = batch.last().event_timestamp;
    let span = last
        .checked_sub(first)
        .filter(|span| *span >= 0)
        .ok_or(InvariantViolation::EventsOutOfOrder { first, last })?;

    Ok(span as f64 / 1000.0)
}

/// `floor(watched / (duration * 0.75))`: 0 until three quarters of the video are
/// watched, then 1, 2, ... for every further three quarters.
pub fn abandon_flag(watched: f64, duration: f64) -> Result<i64, InvariantViolation> {
    if !duration.is_finite() || duration <= 0.0 {
        return Err(InvariantViolation::NonPositiveDuration(duration));
    }

    let threshold = duration * WATCHED_THRESHOLD;
    if watched < threshold {
        return Ok(0);
    }
    // At or past the threshold the ratio is at least 1, whatever the division rounds to.
    Ok(((watched / threshold).floor() as i64).max(1))
}

pub fn classify(
    batch: &EventBatch,
    duration: f64,
    boundary: &DayBoundary,
) -> Result<Classification, InvariantViolation> {
    let started_at = batch.first().event_timestamp;
    let watched = watched_seconds(batch)?;

    Ok(Classification {
        watch_timestamp: to_utc(started_at)?,
        day_flag: boundary.period_of(started_at)?,
        year_week: boundary.year_week_of(started_at)?,
        abandon_flag: abandon_flag(watched, duration)?,
    })
}
