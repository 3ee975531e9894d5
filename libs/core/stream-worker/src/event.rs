//! Entries read from a stream

use chrono::{DateTime, Utc};

/// A decoded stream entry
#[derive(Debug, Clone)]
pub struct StreamEvent<J> {
    /// Redis entry id, e.g. `1700000000000-0`
    pub stream_id: String,
    pub job: J,
}

impl<J> StreamEvent<J> {
    pub fn new(stream_id: impl Into<String>, job: J) -> Self {
        Self {
            stream_id: stream_id.into(),
            job,
        }
    }

    /// Append time encoded in the entry id
    pub fn appended_at(&self) -> Option<DateTime<Utc>> {
        appended_at(&self.stream_id)
    }
}

/// What the consumer handed back for one entry
#[derive(Debug, Clone)]
pub enum Delivery<J> {
    Event(StreamEvent<J>),
    /// The entry had no `job` field or its JSON did not decode
    Malformed {
        stream_id: String,
        raw: Option<String>,
        reason: String,
    },
}

impl<J> Delivery<J> {
    pub fn stream_id(&self) -> &str {
        match self {
            Delivery::Event(event) => &event.stream_id,
            Delivery::Malformed { stream_id, .. } => stream_id,
        }
    }
}

pub(crate) fn appended_at(stream_id: &str) -> Option<DateTime<Utc>> {
    stream_id
        .split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}
