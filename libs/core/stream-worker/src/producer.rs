//! XADD-based producer
//!
//! ```rust,ignore
//! let producer = StreamProducer::from_stream_def::<DistributedStream>(redis);
//! producer.send(&event).await?;
//! ```

use crate::error::StreamError;
use crate::registry::{MessageKey, StreamDef};
use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::debug;

/// Appends entries to one stream, trimming with `MAXLEN ~`
#[derive(Clone)]
pub struct StreamProducer {
    redis: ConnectionManager,
    stream_name: String,
    max_length: i64,
}

impl StreamProducer {
    pub fn new(redis: ConnectionManager, stream_name: impl Into<String>) -> Self {
        Self {
            redis,
            stream_name: stream_name.into(),
            max_length: 100_000,
        }
    }

    pub fn from_stream_def<S: StreamDef>(redis: ConnectionManager) -> Self {
        Self {
            redis,
            stream_name: S::STREAM_NAME.to_string(),
            max_length: S::MAX_LENGTH,
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Serialize `job` into the `job` field. Returns the entry id.
    pub async fn send<J: Serialize>(&self, job: &J) -> Result<String, StreamError> {
        let json = serde_json::to_string(job)?;
        self.send_fields(&[(MessageKey::Job, json.as_str())]).await
    }

    pub async fn send_fields(&self, fields: &[(MessageKey, &str)]) -> Result<String, StreamError> {
        let mut conn = self.redis.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*");
        for (key, value) in fields {
            cmd.arg(key.as_ref()).arg(*value);
        }

        let stream_id: String = cmd.query_async(&mut conn).await?;

        debug!(stream = %self.stream_name, stream_id = %stream_id, "Appended entry");
        Ok(stream_id)
    }
}
