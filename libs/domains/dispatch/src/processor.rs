//! Stream processor for document status events.

use async_trait::async_trait;
use std::sync::Arc;
use stream_worker::{ProcessOutcome, StreamError, StreamProcessor};
use tracing::debug;

use crate::error::DispatchError;
use crate::events::{DocumentEventHandler, DocumentStatusEvent};
use crate::repository::DispatchRepository;

/// Feeds `DocumentStatusEvent` entries into the [`DocumentEventHandler`].
pub struct DocumentStatusProcessor<R: DispatchRepository> {
    handler: Arc<DocumentEventHandler<R>>,
}

impl<R: DispatchRepository> DocumentStatusProcessor<R> {
    pub fn new(handler: Arc<DocumentEventHandler<R>>) -> Self {
        Self { handler }
    }
}

/// Transient failures are retried by the worker, everything else is dead-lettered
pub fn to_stream_error(err: DispatchError) -> StreamError {
    if err.is_transient() {
        StreamError::transient(err.to_string())
    } else {
        StreamError::permanent(err.to_string())
    }
}

#[async_trait]
impl<R: DispatchRepository + 'static> StreamProcessor<DocumentStatusEvent>
    for DocumentStatusProcessor<R>
{
    async fn process(&self, job: &DocumentStatusEvent) -> Result<ProcessOutcome, StreamError> {
        let outcome = self.handler.handle(job).await.map_err(to_stream_error)?;
        debug!(
            document_reference = %job.document_reference,
            matched = outcome.matched,
            updated = outcome.updated,
            archived = outcome.archived,
            "Applied document status event"
        );

        if outcome.matched == 0 {
            Ok(ProcessOutcome::Ignored)
        } else {
            Ok(ProcessOutcome::Processed)
        }
    }

    fn name(&self) -> &'static str {
        "document-status"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{
        ExternalServices, MockAddressLookup, MockArchiveClient, MockDispatchEventPublisher,
        MockDistributionClient, MockIntakeClient, MockProductionClient, MockTitleDeriver,
    };
    use crate::config::DispatchConfig;
    use crate::events::ProductionEventStatus;
    use crate::models::{DispatchKind, DispatchStatus, Document, DocumentRole, DocumentStatus, SourceKind};
    use crate::orchestrator::ArchiveOrchestrator;
    use crate::repository::InMemoryDispatchRepository;
    use crate::state_machine::tests::dispatch;
    use chrono::Utc;
    use stream_worker::ErrorCategory;
    use uuid::Uuid;

    fn processor(
        repo: Arc<InMemoryDispatchRepository>,
    ) -> DocumentStatusProcessor<InMemoryDispatchRepository> {
        let config = DispatchConfig::new("http://localhost");
        let services = ExternalServices {
            production: Arc::new(MockProductionClient::new()),
            archive: Arc::new(MockArchiveClient::new()),
            distribution: Arc::new(MockDistributionClient::new()),
            titles: Arc::new(MockTitleDeriver::new()),
            addresses: Arc::new(MockAddressLookup::new()),
            intake: Arc::new(MockIntakeClient::new()),
            events: Arc::new(MockDispatchEventPublisher::new()),
        };
        let orchestrator = Arc::new(ArchiveOrchestrator::new(repo.clone(), services, &config));
        DocumentStatusProcessor::new(Arc::new(DocumentEventHandler::new(
            repo,
            orchestrator,
            &config,
        )))
    }

    fn event(reference: &str, status: ProductionEventStatus) -> DocumentStatusEvent {
        DocumentStatusEvent {
            document_reference: reference.to_string(),
            status,
            source_system: None,
        }
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            to_stream_error(DispatchError::Conflict(Uuid::nil())).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            to_stream_error(DispatchError::invalid("bad")).category(),
            ErrorCategory::Permanent
        );
    }

    #[tokio::test]
    async fn test_unknown_reference_is_ignored() {
        let processor = processor(Arc::new(InMemoryDispatchRepository::new()));
        let outcome = processor
            .process(&event("BIF-unknown", ProductionEventStatus::Finished))
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_outbound_document_finished_without_archiving() {
        let repo = Arc::new(InMemoryDispatchRepository::new());
        let mut d = dispatch(DispatchKind::Outbound, DispatchStatus::InProduction);
        let doc = Document::new(d.id, "Vedtak", DocumentStatus::UnderEditing, SourceKind::Produced, Utc::now());
        let reference = doc.reference.clone();
        d.insert_document(doc, DocumentRole::Main);
        repo.insert(&d).await.unwrap();

        let processor = processor(repo.clone());
        let job = event(&reference, ProductionEventStatus::Finished);
        assert_eq!(processor.process(&job).await.unwrap(), ProcessOutcome::Processed);
        // replay
        assert_eq!(processor.process(&job).await.unwrap(), ProcessOutcome::Processed);

        let stored = repo.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.documents[0].status, DocumentStatus::Finalized);
        assert_eq!(stored.status, DispatchStatus::InProduction);
        assert_eq!(stored.version, 1);
    }
}
