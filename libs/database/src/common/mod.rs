//! Utilities shared by every connector and by outbound service clients

pub mod retry;

pub use retry::{RetryConfig, retry_with_backoff, retry_with_backoff_if};
