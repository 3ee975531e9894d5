//! Periodic reconciliation with the production and distribution services.
//!
//! Every job is safe to re-run: it re-reads state, and each applied change goes
//! through the same idempotent paths as the event consumer and the orchestrator.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{info, instrument, warn};

use crate::clients::{DistributionClient, ExternalServices, ProductionClient};
use crate::config::DispatchConfig;
use crate::error::DispatchResult;
use crate::events::{DocumentEventHandler, ProductionEventStatus};
use crate::models::DocumentStatus;
use crate::orchestrator::ArchiveOrchestrator;
use crate::production::ProductionGateway;
use crate::repository::DispatchRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReconciliationJob {
    RetryOrders,
    PromoteDocuments,
    Distribution,
}

/// Counts from one job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: ReconciliationJob,
    pub examined: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl JobReport {
    fn new(job: ReconciliationJob) -> Self {
        Self {
            job,
            examined: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
        }
    }

    fn log(self) -> Self {
        info!(
            job = %self.job,
            examined = self.examined,
            succeeded = self.succeeded,
            skipped = self.skipped,
            failed = self.failed,
            "Reconciliation job complete"
        );
        self
    }
}

pub struct ReconciliationService<R: DispatchRepository> {
    repository: Arc<R>,
    gateway: ProductionGateway<R>,
    production: Arc<dyn ProductionClient>,
    distribution: Arc<dyn DistributionClient>,
    handler: Arc<DocumentEventHandler<R>>,
    orchestrator: Arc<ArchiveOrchestrator<R>>,
    stuck_threshold: Duration,
    finalized_threshold: Duration,
    page_size: u64,
}

impl<R: DispatchRepository> ReconciliationService<R> {
    pub fn new(
        repository: Arc<R>,
        handler: Arc<DocumentEventHandler<R>>,
        orchestrator: Arc<ArchiveOrchestrator<R>>,
        services: &ExternalServices,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            gateway: ProductionGateway::new(
                repository.clone(),
                services.production.clone(),
                config,
            ),
            repository,
            production: services.production.clone(),
            distribution: services.distribution.clone(),
            handler,
            orchestrator,
            stuck_threshold: config.stuck_document_threshold(),
            finalized_threshold: config.finalized_distribution_threshold(),
            page_size: config.distribution_reconcile_page_size.max(1),
        }
    }

    pub async fn run(&self, job: ReconciliationJob, now: DateTime<Utc>) -> DispatchResult<JobReport> {
        match job {
            ReconciliationJob::RetryOrders => self.retry_failed_orders().await,
            ReconciliationJob::PromoteDocuments => self.promote_stuck_documents(now).await,
            ReconciliationJob::Distribution => self.reconcile_distribution(now).await,
        }
    }

    /// Order ORDER_FAILED documents of IN_PRODUCTION dispatches again
    #[instrument(skip(self))]
    pub async fn retry_failed_orders(&self) -> DispatchResult<JobReport> {
        let mut report = JobReport::new(ReconciliationJob::RetryOrders);
        let dispatches = self
            .repository
            .find_in_production_with_document_status(&[DocumentStatus::OrderFailed])
            .await?;

        for dispatch in dispatches {
            let failed: Vec<String> = dispatch
                .active_documents()
                .into_iter()
                .filter(|d| d.status == DocumentStatus::OrderFailed)
                .map(|d| d.reference.clone())
                .collect();
            report.examined += failed.len();

            match self.gateway.order_documents(&dispatch, Some(&failed)).await {
                Ok((_, summary)) => {
                    report.succeeded += summary.ordered;
                    report.failed += summary.failed;
                    report.skipped += summary.skipped;
                }
                Err(e) => {
                    warn!(dispatch_id = %dispatch.id, error = %e, "Failed to retry document orders");
                    report.failed += failed.len();
                }
            }
        }
        Ok(report.log())
    }

    /// Ask the production service about documents that have not moved for a while.
    ///
    /// Documents changed within the threshold are left alone without a call.
    #[instrument(skip(self))]
    pub async fn promote_stuck_documents(&self, now: DateTime<Utc>) -> DispatchResult<JobReport> {
        let mut report = JobReport::new(ReconciliationJob::PromoteDocuments);
        let cutoff = now - self.stuck_threshold;
        let dispatches = self
            .repository
            .find_in_production_with_document_status(&[
                DocumentStatus::UnderEditing,
                DocumentStatus::InProduction,
            ])
            .await?;

        // One call per production key, however many dispatches share it
        let mut keys = BTreeSet::new();
        for dispatch in &dispatches {
            for document in dispatch.active_documents() {
                if !matches!(
                    document.status,
                    DocumentStatus::UnderEditing | DocumentStatus::InProduction
                ) {
                    continue;
                }
                if document.status_changed_at < cutoff {
                    keys.insert(document.production_key().to_string());
                } else {
                    report.skipped += 1;
                }
            }
        }

        for key in keys {
            report.examined += 1;
            match self.production.is_finished(&key).await {
                Ok(false) => report.skipped += 1,
                Ok(true) => match self
                    .handler
                    .apply_status(&key, ProductionEventStatus::Finished)
                    .await
                {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        warn!(document_reference = %key, error = %e, "Failed to promote document");
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(document_reference = %key, error = %e, "Production status check failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report.log())
    }

    /// Poll the distribution service for unconfirmed distributions and for
    /// finalized dispatches that may have been distributed elsewhere. Distributed
    /// dispatches also get their unpublished event or unsubmitted follow-up retried.
    #[instrument(skip(self))]
    pub async fn reconcile_distribution(&self, now: DateTime<Utc>) -> DispatchResult<JobReport> {
        let mut report = JobReport::new(ReconciliationJob::Distribution);
        let finalized_before = now - self.finalized_threshold;
        let mut after = None;

        loop {
            let page = self
                .repository
                .find_distribution_candidates(finalized_before, after, self.page_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            let full = page.len() as u64 >= self.page_size;

            for dispatch in page {
                report.examined += 1;
                let confirmed = dispatch
                    .distribution
                    .as_ref()
                    .is_some_and(|d| d.confirmed_at.is_some());
                if confirmed {
                    if self.orchestrator.complete_distribution(&dispatch).await {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                    }
                    continue;
                }

                let Some(archive_id) = dispatch.archive_id.as_deref() else {
                    report.skipped += 1;
                    continue;
                };
                let status = match self.distribution.status(archive_id).await {
                    Ok(Some(status)) if status.delivered => status,
                    Ok(_) => {
                        if self.orchestrator.complete_distribution(&dispatch).await {
                            report.skipped += 1;
                        } else {
                            report.failed += 1;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(dispatch_id = %dispatch.id, error = %e, "Distribution status lookup failed");
                        report.failed += 1;
                        continue;
                    }
                };
                match self.orchestrator.confirm_distribution(dispatch.id, &status).await {
                    Ok(_) => report.succeeded += 1,
                    Err(e) => {
                        warn!(dispatch_id = %dispatch.id, error = %e, "Failed to record distribution");
                        report.failed += 1;
                    }
                }
            }

            if !full {
                break;
            }
        }
        Ok(report.log())
    }
}
