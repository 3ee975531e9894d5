//! Production-status events in, "dispatch distributed" events out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stream_worker::{StreamDef, StreamJob, StreamProducer};
use strum::Display;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clients::DispatchEventPublisher;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{Actor, Dispatch, DispatchKind, DispatchStatus, DistributionChannel, Tema};
use crate::orchestrator::ArchiveOrchestrator;
use crate::repository::{DispatchRepository, mutate_dispatch};
use crate::state_machine::status_after_event;

/// Status reported by the production service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductionEventStatus {
    /// Draft produced, now editable
    Editing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatusEvent {
    /// Production key: own reference, or the original's for copies
    pub document_reference: String,
    pub status: ProductionEventStatus,
    #[serde(default)]
    pub source_system: Option<String>,
}

impl StreamJob for DocumentStatusEvent {
    fn job_id(&self) -> String {
        format!("{}:{}", self.document_reference, self.status)
    }
}

/// Published once per transition into DISTRIBUTED or DISTRIBUTED_LOCALLY
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchDistributedEvent {
    pub dispatch_id: Uuid,
    pub tema: Tema,
    pub case_number: String,
    pub subject_ident: String,
    pub title: Option<String>,
    pub unit: String,
    pub kind: DispatchKind,
    pub status: DispatchStatus,
    pub archive_id: Option<String>,
    pub order_id: Option<String>,
    pub channel: Option<DistributionChannel>,
    pub distributed_at: Option<DateTime<Utc>>,
}

impl DispatchDistributedEvent {
    /// `None` unless the dispatch is distributed
    pub fn from_dispatch(dispatch: &Dispatch) -> Option<Self> {
        if !dispatch.status.is_distributed() {
            return None;
        }
        let distribution = dispatch.distribution.as_ref();
        Some(Self {
            dispatch_id: dispatch.id,
            tema: dispatch.tema,
            case_number: dispatch.case_number.clone(),
            subject_ident: dispatch.subject_ident.clone(),
            title: dispatch.effective_title().map(str::to_string),
            unit: dispatch.unit.clone(),
            kind: dispatch.kind,
            status: dispatch.status,
            archive_id: dispatch.archive_id.clone(),
            order_id: distribution.and_then(|d| d.order_id.clone()),
            channel: distribution.map(|d| d.channel),
            distributed_at: distribution.map(|d| d.distributed_at),
        })
    }
}

impl StreamJob for DispatchDistributedEvent {
    fn job_id(&self) -> String {
        self.dispatch_id.to_string()
    }
}

/// Document status events from the production service
pub struct DocumentStatusStream;

impl StreamDef for DocumentStatusStream {
    const STREAM_NAME: &'static str = "dispatch:document-status";
    const CONSUMER_GROUP: &'static str = "dispatch_workers";
    const DLQ_STREAM: &'static str = "dispatch:document-status:dlq";
}

/// Distributed dispatches, for downstream subscribers
pub struct DispatchDistributedStream;

impl StreamDef for DispatchDistributedStream {
    const STREAM_NAME: &'static str = "dispatch:distributed";
    const CONSUMER_GROUP: &'static str = "dispatch_subscribers";
    const DLQ_STREAM: &'static str = "dispatch:distributed:dlq";
    const MAX_LENGTH: i64 = 50_000;
}

/// Publishes domain events on a Redis stream
#[derive(Clone)]
pub struct StreamEventPublisher {
    producer: StreamProducer,
}

impl StreamEventPublisher {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            producer: StreamProducer::from_stream_def::<DispatchDistributedStream>(redis),
        }
    }
}

#[async_trait]
impl DispatchEventPublisher for StreamEventPublisher {
    async fn publish_distributed(&self, event: &DispatchDistributedEvent) -> DispatchResult<()> {
        let id = self
            .producer
            .send(event)
            .await
            .map_err(|e| DispatchError::unavailable("event stream", e))?;
        debug!(dispatch_id = %event.dispatch_id, stream_id = %id, "Published distributed event");
        Ok(())
    }
}

/// What applying one event did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventOutcome {
    /// Dispatches holding a matching document
    pub matched: usize,
    /// Dispatches with at least one document status changed
    pub updated: usize,
    /// Notes archived as a consequence
    pub archived: usize,
}

/// Applies production status to every document answering to a key and
/// archives internal notes that became ready.
pub struct DocumentEventHandler<R: DispatchRepository> {
    repository: Arc<R>,
    orchestrator: Arc<ArchiveOrchestrator<R>>,
    mutation_attempts: u32,
}

impl<R: DispatchRepository> DocumentEventHandler<R> {
    pub fn new(
        repository: Arc<R>,
        orchestrator: Arc<ArchiveOrchestrator<R>>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            repository,
            orchestrator,
            mutation_attempts: config.mutation_max_attempts,
        }
    }

    fn pending_change(dispatch: &Dispatch, key: &str, status: ProductionEventStatus) -> bool {
        dispatch.documents.iter().any(|d| {
            d.is_active() && d.answers_to(key) && status_after_event(d.status, status).is_some()
        })
    }

    pub async fn handle(&self, event: &DocumentStatusEvent) -> DispatchResult<EventOutcome> {
        self.apply_status(&event.document_reference, event.status)
            .await
    }

    /// Safe to replay: statuses are set, never stepped, and never regress.
    ///
    /// A transient failure in any affected dispatch is returned after all of
    /// them were attempted, so the event gets redelivered.
    #[instrument(skip(self, key, status), fields(document_reference = %key, status = %status))]
    pub async fn apply_status(
        &self,
        key: &str,
        status: ProductionEventStatus,
    ) -> DispatchResult<EventOutcome> {
        let dispatches = self.repository.find_by_document_reference(key).await?;
        let mut outcome = EventOutcome {
            matched: dispatches.len(),
            ..Default::default()
        };
        if dispatches.is_empty() {
            info!("No document answers to this reference, ignoring event");
            return Ok(outcome);
        }

        let mut retry_error: Option<DispatchError> = None;
        for dispatch in dispatches {
            match self.apply_to_dispatch(dispatch, key, status).await {
                Ok((updated, archived)) => {
                    outcome.updated += usize::from(updated);
                    outcome.archived += usize::from(archived);
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Failed to apply event to dispatch, will be retried");
                    retry_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Failed to apply event to dispatch");
                }
            }
        }

        match retry_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    #[instrument(skip(self, dispatch, key, status), fields(dispatch_id = %dispatch.id))]
    async fn apply_to_dispatch(
        &self,
        dispatch: Dispatch,
        key: &str,
        status: ProductionEventStatus,
    ) -> DispatchResult<(bool, bool)> {
        if dispatch.status != DispatchStatus::InProduction {
            debug!(status = %dispatch.status, "Dispatch no longer in production");
            return Ok((false, false));
        }

        let mut current = dispatch;
        let mut updated = false;
        if Self::pending_change(&current, key, status) {
            let (saved, changed) = mutate_dispatch(
                self.repository.as_ref(),
                current.id,
                self.mutation_attempts,
                |d| {
                    if d.status != DispatchStatus::InProduction {
                        return Ok(0);
                    }
                    let now = Utc::now();
                    let mut changed = 0;
                    for document in d
                        .documents
                        .iter_mut()
                        .filter(|doc| doc.is_active() && doc.answers_to(key))
                    {
                        if let Some(next) = status_after_event(document.status, status) {
                            document.set_status(next, now);
                            changed += 1;
                        }
                    }
                    if changed > 0 {
                        d.touch(&Actor::system(), now);
                    }
                    Ok(changed)
                },
            )
            .await?;
            updated = changed > 0;
            current = saved;
        }

        // Checked on every delivery so a redelivered event retries a failed archive call
        let archived = if status == ProductionEventStatus::Finished
            && current.kind == DispatchKind::InternalNote
            && current.status == DispatchStatus::InProduction
            && current.is_ready_for_archive()
        {
            let archive_id = self
                .orchestrator
                .finalize_and_archive(current.id, &Actor::system())
                .await?;
            info!(archive_id = %archive_id, "Archived internal note");
            true
        } else {
            false
        };

        Ok((updated, archived))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = r#"{"documentReference":"BIF0193","status":"FINISHED","sourceSystem":"brevserver"}"#;
        let event: DocumentStatusEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.document_reference, "BIF0193");
        assert_eq!(event.status, ProductionEventStatus::Finished);
        assert_eq!(event.source_system.as_deref(), Some("brevserver"));
        assert_eq!(event.job_id(), "BIF0193:FINISHED");

        let without_source: DocumentStatusEvent =
            serde_json::from_str(r#"{"documentReference":"X","status":"EDITING"}"#).unwrap();
        assert_eq!(without_source.source_system, None);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let parsed = serde_json::from_str::<DocumentStatusEvent>(
            r#"{"documentReference":"X","status":"DELETED"}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(DocumentStatusStream::STREAM_NAME, "dispatch:document-status");
        assert_eq!(DocumentStatusStream::CONSUMER_GROUP, "dispatch_workers");
        assert_eq!(DocumentStatusStream::DLQ_STREAM, "dispatch:document-status:dlq");
        assert_eq!(DispatchDistributedStream::STREAM_NAME, "dispatch:distributed");
    }

    #[test]
    fn test_distributed_event_only_for_distributed_dispatches() {
        use crate::state_machine::tests::dispatch;

        let finalized = dispatch(DispatchKind::Outbound, DispatchStatus::Finalized);
        assert!(DispatchDistributedEvent::from_dispatch(&finalized).is_none());

        let mut distributed = finalized.clone();
        distributed.status = DispatchStatus::DistributedLocally;
        distributed.title = Some("Vedtak om bidrag".into());
        let event = DispatchDistributedEvent::from_dispatch(&distributed).unwrap();
        assert_eq!(event.title.as_deref(), Some("Vedtak om bidrag"));
        assert_eq!(event.kind, DispatchKind::Outbound);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["caseNumber"], "2400001");
        assert_eq!(json["status"], "DISTRIBUTED_LOCALLY");
    }
}
