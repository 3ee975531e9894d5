use std::sync::Arc;
use tracing::{instrument, warn};

use crate::clients::{DocumentOrder, ProductionClient, ProductionReceipt};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{Dispatch, DispatchStatus, Document, DocumentStatus, SourceKind};
use crate::repository::{DispatchRepository, mutate_dispatch};

/// Result of one ordering round for a dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderSummary {
    pub ordered: usize,
    pub failed: usize,
    /// Requested documents that did not need an order
    pub skipped: usize,
}

/// Orders newly produced documents from the production service.
///
/// Ordering is best effort: a failed order marks the document ORDER_FAILED and
/// never fails the caller. Completion is observed through status events.
pub struct ProductionGateway<R: DispatchRepository> {
    repository: Arc<R>,
    client: Arc<dyn ProductionClient>,
    mutation_attempts: u32,
}

impl<R: DispatchRepository> ProductionGateway<R> {
    pub fn new(
        repository: Arc<R>,
        client: Arc<dyn ProductionClient>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            repository,
            client,
            mutation_attempts: config.mutation_max_attempts,
        }
    }

    pub fn needs_order(document: &Document) -> bool {
        document.is_active()
            && document.source == SourceKind::Produced
            && matches!(
                document.status,
                DocumentStatus::NotOrdered | DocumentStatus::OrderFailed
            )
    }

    fn order_for(dispatch: &Dispatch, document: &Document) -> DocumentOrder {
        DocumentOrder {
            document_reference: document.production_key().to_string(),
            dispatch_id: dispatch.id,
            template_code: document.template_code.clone(),
            title: document.title.clone(),
            case_number: dispatch.case_number.clone(),
            subject_ident: dispatch.subject_ident.clone(),
            recipient_ident: dispatch.recipient.as_ref().map(|r| r.ident.clone()),
            language: dispatch.language.clone(),
            unit: dispatch.unit.clone(),
        }
    }

    /// Order every listed document that needs it; `None` means all documents.
    ///
    /// External calls happen before the outcome is written, and the write
    /// leaves alone documents whose status moved on in the meantime.
    #[instrument(skip(self, dispatch, references), fields(dispatch_id = %dispatch.id))]
    pub async fn order_documents(
        &self,
        dispatch: &Dispatch,
        references: Option<&[String]>,
    ) -> DispatchResult<(Dispatch, OrderSummary)> {
        let requested: Vec<&Document> = dispatch
            .active_documents()
            .into_iter()
            .filter(|d| references.is_none_or(|refs| refs.contains(&d.reference)))
            .collect();

        let mut summary = OrderSummary::default();
        if dispatch.status != DispatchStatus::InProduction {
            summary.skipped = requested.len();
            return Ok((dispatch.clone(), summary));
        }

        let mut outcomes: Vec<(String, DispatchResult<ProductionReceipt>)> = Vec::new();
        for document in requested {
            if !Self::needs_order(document) {
                summary.skipped += 1;
                continue;
            }
            let result = self.client.order(&Self::order_for(dispatch, document)).await;
            outcomes.push((document.reference.clone(), result));
        }

        if outcomes.is_empty() {
            return Ok((dispatch.clone(), summary));
        }

        for (reference, result) in &outcomes {
            match result {
                Ok(_) => summary.ordered += 1,
                Err(e) => {
                    summary.failed += 1;
                    let failure = DispatchError::ProductionOrderFailed {
                        reference: reference.clone(),
                        reason: e.to_string(),
                    };
                    warn!(document_reference = %reference, error = %failure, "Document order failed");
                }
            }
        }

        let (saved, ()) = mutate_dispatch(
            self.repository.as_ref(),
            dispatch.id,
            self.mutation_attempts,
            |current| {
                let now = chrono::Utc::now();
                for (reference, result) in &outcomes {
                    let Some(document) = current.document_mut(reference) else {
                        continue;
                    };
                    if !Self::needs_order(document) {
                        continue;
                    }
                    match result {
                        Ok(receipt) => {
                            document.production_ref = Some(receipt.external_ref.clone());
                            document.set_status(DocumentStatus::InProduction, now);
                        }
                        Err(_) => document.set_status(DocumentStatus::OrderFailed, now),
                    }
                }
                Ok(())
            },
        )
        .await?;

        tracing::info!(
            ordered = summary.ordered,
            failed = summary.failed,
            skipped = summary.skipped,
            "Ordered documents"
        );
        Ok((saved, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockProductionClient;
    use crate::models::{DispatchKind, DocumentRole, OriginalReference};
    use crate::repository::InMemoryDispatchRepository;
    use crate::state_machine::tests::dispatch;
    use chrono::Utc;
    use mockall::predicate::*;

    async fn stored(documents: Vec<(DocumentStatus, SourceKind)>) -> (Arc<InMemoryDispatchRepository>, Dispatch) {
        let repo = Arc::new(InMemoryDispatchRepository::new());
        let mut d = dispatch(DispatchKind::Outbound, DispatchStatus::InProduction);
        for (status, source) in documents {
            let mut doc = Document::new(d.id, "Vedtak", status, source, Utc::now());
            if source != SourceKind::Produced {
                doc.original = Some(OriginalReference {
                    dispatch_id: None,
                    archive_id: Some("A-1".into()),
                    document_reference: Some("DOK-1".into()),
                });
            }
            d.insert_document(doc, DocumentRole::Attachment);
        }
        repo.insert(&d).await.unwrap();
        (repo, d)
    }

    fn gateway(
        repo: Arc<InMemoryDispatchRepository>,
        client: MockProductionClient,
    ) -> ProductionGateway<InMemoryDispatchRepository> {
        ProductionGateway::new(repo, Arc::new(client), &DispatchConfig::new("http://localhost"))
    }

    #[tokio::test]
    async fn test_successful_order_moves_document_to_production() {
        let (repo, d) = stored(vec![(DocumentStatus::NotOrdered, SourceKind::Produced)]).await;
        let reference = d.documents[0].reference.clone();

        let mut client = MockProductionClient::new();
        client
            .expect_order()
            .withf(move |order| order.document_reference == reference)
            .times(1)
            .returning(|_| {
                Ok(ProductionReceipt {
                    external_ref: "PROD-1".into(),
                })
            });

        let (saved, summary) = gateway(repo, client)
            .order_documents(&d, None)
            .await
            .unwrap();

        assert_eq!(summary.ordered, 1);
        assert_eq!(saved.documents[0].status, DocumentStatus::InProduction);
        assert_eq!(saved.documents[0].production_ref.as_deref(), Some("PROD-1"));
    }

    #[tokio::test]
    async fn test_failed_order_is_recorded_not_raised() {
        let (repo, d) = stored(vec![
            (DocumentStatus::NotOrdered, SourceKind::Produced),
            (DocumentStatus::NotOrdered, SourceKind::Produced),
        ])
        .await;
        let failing = d.documents[0].reference.clone();

        let mut client = MockProductionClient::new();
        client.expect_order().times(2).returning(move |order| {
            if order.document_reference == failing {
                Err(DispatchError::unavailable("production service", "timeout"))
            } else {
                Ok(ProductionReceipt {
                    external_ref: "PROD-2".into(),
                })
            }
        });

        let (saved, summary) = gateway(repo.clone(), client)
            .order_documents(&d, None)
            .await
            .unwrap();

        assert_eq!(summary, OrderSummary { ordered: 1, failed: 1, skipped: 0 });
        let stored = repo.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.documents[0].status, DocumentStatus::OrderFailed);
        assert_eq!(stored.documents[1].status, DocumentStatus::InProduction);
        assert_eq!(saved.version, stored.version);
    }

    #[tokio::test]
    async fn test_copies_and_progressed_documents_are_not_ordered() {
        let (repo, d) = stored(vec![
            (DocumentStatus::MustBeReviewed, SourceKind::CopiedFromArchive),
            (DocumentStatus::UnderEditing, SourceKind::Produced),
        ])
        .await;

        let mut client = MockProductionClient::new();
        client.expect_order().never();

        let (_, summary) = gateway(repo, client)
            .order_documents(&d, None)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn test_only_listed_references_are_ordered() {
        let (repo, d) = stored(vec![
            (DocumentStatus::NotOrdered, SourceKind::Produced),
            (DocumentStatus::NotOrdered, SourceKind::Produced),
        ])
        .await;
        let second = d.documents[1].reference.clone();

        let mut client = MockProductionClient::new();
        client
            .expect_order()
            .with(function(move |o: &DocumentOrder| o.document_reference == second))
            .times(1)
            .returning(|_| {
                Ok(ProductionReceipt {
                    external_ref: "PROD-3".into(),
                })
            });

        let refs = vec![d.documents[1].reference.clone()];
        let (saved, _) = gateway(repo, client)
            .order_documents(&d, Some(&refs))
            .await
            .unwrap();
        assert_eq!(saved.documents[0].status, DocumentStatus::NotOrdered);
    }

    #[tokio::test]
    async fn test_aborted_dispatch_orders_nothing() {
        let (repo, mut d) = stored(vec![(DocumentStatus::OrderFailed, SourceKind::Produced)]).await;
        d.status = DispatchStatus::Aborted;

        let mut client = MockProductionClient::new();
        client.expect_order().never();

        let (_, summary) = gateway(repo, client)
            .order_documents(&d, None)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
    }
}
