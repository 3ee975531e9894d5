//! Stream definitions and message field names.

use strum::{AsRefStr, Display};

/// Field names used in stream entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum MessageKey {
    /// JSON payload
    Job,
    /// Failure reason (DLQ entries)
    Error,
    /// Entry id in the source stream (DLQ entries)
    SourceId,
    /// RFC 3339 timestamp (DLQ entries)
    FailedAt,
}

/// Compile-time description of a stream.
///
/// ```rust,ignore
/// pub struct DistributedStream;
///
/// impl StreamDef for DistributedStream {
///     const STREAM_NAME: &'static str = "dispatch:distributed";
///     const CONSUMER_GROUP: &'static str = "dispatch_subscribers";
///     const DLQ_STREAM: &'static str = "dispatch:distributed:dlq";
/// }
/// ```
pub trait StreamDef: Send + Sync {
    const STREAM_NAME: &'static str;

    const CONSUMER_GROUP: &'static str;

    const DLQ_STREAM: &'static str;

    /// Approximate MAXLEN applied on every XADD
    const MAX_LENGTH: i64 = 100_000;

    const BATCH_SIZE: usize = 10;

    /// Pending entries idle longer than this are claimed from dead consumers
    const CLAIM_IDLE_MS: u64 = 60_000;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStream;
    impl StreamDef for TestStream {
        const STREAM_NAME: &'static str = "test:stream";
        const CONSUMER_GROUP: &'static str = "test_workers";
        const DLQ_STREAM: &'static str = "test:dlq";
    }

    #[test]
    fn test_message_keys_are_snake_case() {
        assert_eq!(MessageKey::Job.as_ref(), "job");
        assert_eq!(MessageKey::SourceId.to_string(), "source_id");
        assert_eq!(MessageKey::FailedAt.as_ref(), "failed_at");
    }

    #[test]
    fn test_stream_def_defaults() {
        assert_eq!(TestStream::STREAM_NAME, "test:stream");
        assert_eq!(TestStream::MAX_LENGTH, 100_000);
        assert_eq!(TestStream::BATCH_SIZE, 10);
    }
}
