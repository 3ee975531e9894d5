//! Stream Worker Framework
//!
//! Redis Streams plumbing for at-least-once event consumption.
//!
//! - **Consumer groups**: one group per stream, one sequential consumer per process
//! - **In-place retries**: transient failures are retried with exponential backoff
//!   before the entry is acknowledged, so per-stream ordering is preserved
//! - **Dead letter queue**: permanent failures, exhausted retries and malformed
//!   payloads are copied to the DLQ stream and acknowledged
//!
//! ```ignore
//! use stream_worker::{StreamDef, StreamWorker, WorkerConfig};
//!
//! struct StatusStream;
//! impl StreamDef for StatusStream {
//!     const STREAM_NAME: &'static str = "dispatch:document-status";
//!     const CONSUMER_GROUP: &'static str = "dispatch_workers";
//!     const DLQ_STREAM: &'static str = "dispatch:document-status:dlq";
//! }
//!
//! let worker = StreamWorker::new(redis, processor, WorkerConfig::from_stream_def::<StatusStream>());
//! worker.run(shutdown_rx).await?;
//! ```

mod config;
mod consumer;
mod error;
mod event;
mod producer;
mod registry;
mod worker;

pub use config::WorkerConfig;
pub use consumer::StreamConsumer;
pub use error::{ErrorCategory, StreamError};
pub use event::{Delivery, StreamEvent};
pub use producer::StreamProducer;
pub use registry::{MessageKey, StreamDef};
pub use worker::{ProcessOutcome, StreamJob, StreamProcessor, StreamWorker};
