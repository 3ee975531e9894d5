//! Job traits and the sequential worker loop.

use crate::config::WorkerConfig;
use crate::consumer::StreamConsumer;
use crate::error::StreamError;
use crate::event::Delivery;
use crate::producer::StreamProducer;
use crate::registry::MessageKey;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Payload carried in the `job` field of a stream entry.
pub trait StreamJob: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Identifier used in logs
    fn job_id(&self) -> String;
}

/// Result of a successful `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    /// Nothing to do for this entry; still acknowledged
    Ignored,
}

/// Domain handler for one job type.
///
/// Return a transient error to have the entry retried in place, a permanent
/// one to dead-letter it.
#[async_trait]
pub trait StreamProcessor<J: StreamJob>: Send + Sync {
    async fn process(&self, job: &J) -> Result<ProcessOutcome, StreamError>;

    fn name(&self) -> &'static str;
}

/// Sequential consumer: one entry at a time, acknowledged only after it was
/// processed or dead-lettered, so a crash leads to redelivery.
pub struct StreamWorker<J, P>
where
    J: StreamJob,
    P: StreamProcessor<J>,
{
    consumer: StreamConsumer,
    dlq: StreamProducer,
    processor: Arc<P>,
    config: WorkerConfig,
    _job: PhantomData<J>,
}

impl<J, P> StreamWorker<J, P>
where
    J: StreamJob,
    P: StreamProcessor<J>,
{
    pub fn new(redis: ConnectionManager, processor: Arc<P>, config: WorkerConfig) -> Self {
        Self {
            consumer: StreamConsumer::new(redis.clone(), config.clone()),
            dlq: StreamProducer::new(redis, config.dlq_stream.clone())
                .with_max_length(config.max_length),
            processor,
            config,
            _job: PhantomData,
        }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamError> {
        info!(
            consumer_id = %self.config.consumer_id,
            stream = %self.config.stream_name,
            group = %self.config.consumer_group,
            processor = %self.processor.name(),
            "Starting stream worker"
        );

        self.consumer.ensure_consumer_group().await?;

        let claim_interval = Duration::from_millis(self.config.claim_idle_ms);
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claim_due = last_claim.elapsed() >= claim_interval;
            let batch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.next_batch(claim_due) => batch,
            };
            if claim_due {
                last_claim = Instant::now();
            }

            match batch {
                Ok(deliveries) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Stream connection recovered");
                        consecutive_errors = 0;
                    }
                    for delivery in deliveries {
                        self.handle(delivery).await;
                    }
                }
                Err(e) if e.is_nogroup_error() => {
                    warn!("Consumer group missing, recreating");
                    if let Err(e) = self.consumer.ensure_consumer_group().await {
                        error!(error = %e, "Failed to recreate consumer group");
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_secs(2u64.pow(consecutive_errors.min(5)));
                    warn!(error = %e, consecutive_errors, backoff_secs = backoff.as_secs(), "Stream read failed, backing off");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!("Stream worker stopped");
        Ok(())
    }

    /// Own pending entries first, then abandoned ones, then new ones.
    async fn next_batch(&self, claim_due: bool) -> Result<Vec<Delivery<J>>, StreamError> {
        let pending = self.consumer.read_pending::<J>().await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        if claim_due {
            let claimed = self.consumer.claim_abandoned::<J>().await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
        }
        self.consumer.read_new::<J>().await
    }

    async fn handle(&self, delivery: Delivery<J>) {
        let stream_id = delivery.stream_id().to_string();

        let settled = match delivery {
            Delivery::Malformed { raw, reason, .. } => {
                warn!(stream_id = %stream_id, reason = %reason, "Dead-lettering malformed entry");
                self.dead_letter(&stream_id, raw.as_deref().unwrap_or_default(), &reason)
                    .await
            }
            Delivery::Event(event) => {
                let job_id = event.job.job_id();
                match process_with_retries(self.processor.as_ref(), &event.job, &self.config).await
                {
                    Ok(outcome) => {
                        debug!(stream_id = %stream_id, job_id = %job_id, ?outcome, "Processed entry");
                        Ok(())
                    }
                    Err(e) => {
                        error!(stream_id = %stream_id, job_id = %job_id, error = %e, "Dead-lettering entry");
                        match serde_json::to_string(&event.job) {
                            Ok(raw) => self.dead_letter(&stream_id, &raw, &e.to_string()).await,
                            Err(ser) => Err(ser.into()),
                        }
                    }
                }
            }
        };

        match settled {
            Ok(()) => {
                if let Err(e) = self.consumer.ack(&stream_id).await {
                    error!(stream_id = %stream_id, error = %e, "Failed to acknowledge entry");
                }
            }
            // Left pending; redelivered on the next pass
            Err(e) => error!(stream_id = %stream_id, error = %e, "Failed to write DLQ entry"),
        }
    }

    async fn dead_letter(&self, stream_id: &str, raw: &str, reason: &str) -> Result<(), StreamError> {
        let failed_at = Utc::now().to_rfc3339();
        self.dlq
            .send_fields(&[
                (MessageKey::Job, raw),
                (MessageKey::Error, reason),
                (MessageKey::SourceId, stream_id),
                (MessageKey::FailedAt, failed_at.as_str()),
            ])
            .await
            .map(|_| ())
    }
}

/// Run `processor` on `job`, retrying transient failures in place with
/// exponential backoff. Returns the last error once retries are exhausted
/// or on the first permanent error.
pub(crate) async fn process_with_retries<J, P>(
    processor: &P,
    job: &J,
    config: &WorkerConfig,
) -> Result<ProcessOutcome, StreamError>
where
    J: StreamJob,
    P: StreamProcessor<J> + ?Sized,
{
    let mut retries = 0;
    loop {
        match processor.process(job).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.category().should_retry() && retries < config.max_retries => {
                retries += 1;
                let delay = config.retry_delay(retries);
                warn!(
                    job_id = %job.job_id(),
                    error = %e,
                    retry = retries,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Transient processing failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::registry::StreamDef;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping;

    impl StreamJob for Ping {
        fn job_id(&self) -> String {
            "ping".to_string()
        }
    }

    struct PingStream;
    impl StreamDef for PingStream {
        const STREAM_NAME: &'static str = "ping";
        const CONSUMER_GROUP: &'static str = "ping_workers";
        const DLQ_STREAM: &'static str = "ping:dlq";
    }

    /// Fails with `category` for the first `failures` calls
    struct Flaky {
        failures: u32,
        category: ErrorCategory,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StreamProcessor<Ping> for Flaky {
        async fn process(&self, _job: &Ping) -> Result<ProcessOutcome, StreamError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(StreamError::Processing {
                    message: format!("failure {n}"),
                    category: self.category,
                })
            } else {
                Ok(ProcessOutcome::Processed)
            }
        }

        fn name(&self) -> &'static str {
            "Flaky"
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::from_stream_def::<PingStream>().with_max_retries(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_in_place() {
        let processor = Flaky {
            failures: 2,
            category: ErrorCategory::Transient,
            calls: AtomicU32::new(0),
        };

        let outcome = process_with_retries(&processor, &Ping, &config()).await;

        assert_eq!(outcome.unwrap(), ProcessOutcome::Processed);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let processor = Flaky {
            failures: u32::MAX,
            category: ErrorCategory::Transient,
            calls: AtomicU32::new(0),
        };

        let outcome = process_with_retries(&processor, &Ping, &config()).await;

        assert!(outcome.is_err());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let processor = Flaky {
            failures: 1,
            category: ErrorCategory::Permanent,
            calls: AtomicU32::new(0),
        };

        let outcome = process_with_retries(&processor, &Ping, &config()).await;

        assert!(outcome.is_err());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }
}
