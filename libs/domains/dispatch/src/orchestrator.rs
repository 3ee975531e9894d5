//! Archival and distribution of finished dispatches.
//!
//! Both side effects happen at most once per dispatch: every entry point
//! short-circuits on the stored status before calling out, and the archive
//! request carries a correlation id derived from the dispatch id.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clients::{
    ArchiveDocument, ArchiveRecordRequest, DistributionRequest, DistributionStatus,
    ExternalServices, FollowUpSubmission,
};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::events::DispatchDistributedEvent;
use crate::models::{
    Actor, DistributeRequest, Dispatch, DispatchKind, DispatchStatus, DistributionChannel,
    DistributionInfo, PostalAddress,
};
use crate::repository::{DispatchRepository, mutate_dispatch};

/// Correlation id the archive uses to recognise repeated submissions
pub fn archive_correlation_id(dispatch_id: Uuid) -> String {
    format!("dispatch-{}", dispatch_id)
}

/// Fails on the first title containing control characters
pub fn validate_titles(dispatch: &Dispatch) -> DispatchResult<()> {
    if let Some(title) = &dispatch.title {
        if title.chars().any(char::is_control) {
            return Err(DispatchError::invalid(format!(
                "title of dispatch {} contains control characters",
                dispatch.id
            )));
        }
    }
    for document in dispatch.active_documents() {
        if document.title.chars().any(char::is_control) {
            return Err(DispatchError::invalid(format!(
                "title of document {} in dispatch {} contains control characters",
                document.reference, dispatch.id
            )));
        }
    }
    Ok(())
}

/// Where a distributed dispatch ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionOutcome {
    pub dispatch_id: Uuid,
    pub archive_id: String,
    /// Absent for local print
    pub order_id: Option<String>,
    pub status: DispatchStatus,
    pub channel: DistributionChannel,
}

impl DistributionOutcome {
    fn from_dispatch(dispatch: &Dispatch) -> DispatchResult<Self> {
        let archive_id = dispatch.archive_id.clone().ok_or_else(|| {
            DispatchError::Internal(format!("dispatch {} has no archive id", dispatch.id))
        })?;
        let distribution = dispatch.distribution.as_ref().ok_or_else(|| {
            DispatchError::Internal(format!("dispatch {} has no distribution", dispatch.id))
        })?;
        Ok(Self {
            dispatch_id: dispatch.id,
            archive_id,
            order_id: distribution.order_id.clone(),
            status: dispatch.status,
            channel: distribution.channel,
        })
    }
}

pub struct ArchiveOrchestrator<R: DispatchRepository> {
    repository: Arc<R>,
    services: ExternalServices,
    mutation_attempts: u32,
}

impl<R: DispatchRepository> ArchiveOrchestrator<R> {
    pub fn new(repository: Arc<R>, services: ExternalServices, config: &DispatchConfig) -> Self {
        Self {
            repository,
            services,
            mutation_attempts: config.mutation_max_attempts,
        }
    }

    async fn load(&self, id: Uuid) -> DispatchResult<Dispatch> {
        self.repository
            .get(id)
            .await?
            .ok_or(DispatchError::NotFound(id))
    }

    fn archive_request(dispatch: &Dispatch) -> ArchiveRecordRequest {
        let documents = dispatch
            .active_documents()
            .into_iter()
            .map(|d| ArchiveDocument {
                document_reference: d.reference.clone(),
                title: d.title.clone(),
                role: d.role,
                original_archive_reference: d
                    .original
                    .as_ref()
                    .filter(|o| o.archive_id.is_some())
                    .and_then(|o| o.document_reference.clone()),
            })
            .collect();

        ArchiveRecordRequest {
            correlation_id: archive_correlation_id(dispatch.id),
            title: dispatch.effective_title().unwrap_or_default().to_string(),
            case_number: dispatch.case_number.clone(),
            subject_ident: dispatch.subject_ident.clone(),
            recipient_ident: dispatch.recipient.as_ref().map(|r| r.ident.clone()),
            recipient_name: dispatch.recipient.as_ref().and_then(|r| r.name.clone()),
            tema: dispatch.tema,
            unit: dispatch.unit.clone(),
            outbound: dispatch.kind == DispatchKind::Outbound,
            documents,
        }
    }

    /// Archive a dispatch whose documents are all finalized; returns the archive id.
    ///
    /// Already archived dispatches return the stored id without any external call.
    #[instrument(skip(self, actor), fields(dispatch_id = %id))]
    pub async fn finalize_and_archive(&self, id: Uuid, actor: &Actor) -> DispatchResult<String> {
        let dispatch = self.load(id).await?;

        if dispatch.status.is_archived() {
            return dispatch.archive_id.clone().ok_or_else(|| {
                DispatchError::Internal(format!("archived dispatch {} has no archive id", id))
            });
        }
        if dispatch.status != DispatchStatus::InProduction {
            return Err(DispatchError::transition(
                format!("dispatch {}", id),
                dispatch.status,
                DispatchStatus::Finalized,
            ));
        }
        if !dispatch.is_ready_for_archive() {
            return Err(DispatchError::NotReady {
                id,
                pending: dispatch.unfinished_documents(),
            });
        }
        validate_titles(&dispatch)?;

        let request = Self::archive_request(&dispatch);
        let receipt = self.services.archive.create_record(&request).await?;

        let (saved, ()) = mutate_dispatch(
            self.repository.as_ref(),
            id,
            self.mutation_attempts,
            |current| {
                if current.status.is_archived() {
                    return Ok(());
                }
                if current.status != DispatchStatus::InProduction {
                    return Err(DispatchError::transition(
                        format!("dispatch {}", id),
                        current.status,
                        DispatchStatus::Finalized,
                    ));
                }
                if !current.is_ready_for_archive() {
                    return Err(DispatchError::NotReady {
                        id,
                        pending: current.unfinished_documents(),
                    });
                }

                let now = Utc::now();
                for archived in &receipt.documents {
                    if let Some(document) = current.document_mut(&archived.document_reference) {
                        document.archive_reference = Some(archived.archive_reference.clone());
                    }
                }
                current.archive_id = Some(receipt.archive_id.clone());
                current.status = DispatchStatus::Finalized;
                current.finalized_at = Some(now);
                current.touch(actor, now);
                Ok(())
            },
        )
        .await?;

        info!(archive_id = ?saved.archive_id, "Archived dispatch");
        saved
            .archive_id
            .ok_or_else(|| DispatchError::Internal(format!("dispatch {} lost its archive id", id)))
    }

    /// Override, then the recipient's stored address, then a lookup
    async fn resolve_address(
        &self,
        dispatch: &Dispatch,
        address_override: Option<PostalAddress>,
    ) -> Option<PostalAddress> {
        if address_override.is_some() {
            return address_override;
        }
        let recipient = dispatch.recipient.as_ref()?;
        if let Some(address) = &recipient.address {
            return Some(address.clone());
        }
        match self.services.addresses.lookup(&recipient.ident).await {
            Ok(address) => address,
            Err(e) => {
                warn!(dispatch_id = %dispatch.id, error = %e, "Address lookup failed, distributing without address");
                None
            }
        }
    }

    /// Archive if needed, then hand the dispatch to the distribution service or
    /// record it as printed locally.
    ///
    /// Already distributed dispatches return the stored outcome without any
    /// external call.
    #[instrument(skip(self, request, actor), fields(dispatch_id = %id, local_print = request.local_print))]
    pub async fn distribute(
        &self,
        id: Uuid,
        request: DistributeRequest,
        actor: &Actor,
    ) -> DispatchResult<DistributionOutcome> {
        let mut dispatch = self.load(id).await?;

        if dispatch.status.is_distributed() {
            self.complete_distribution(&dispatch).await;
            return DistributionOutcome::from_dispatch(&dispatch);
        }
        if dispatch.kind == DispatchKind::InternalNote {
            return Err(DispatchError::invalid(format!(
                "dispatch {} is an internal note and cannot be distributed",
                id
            )));
        }
        if let Some(address) = &request.address_override {
            address
                .validate()
                .map_err(|e| DispatchError::invalid(format!("address override: {}", e)))?;
        }

        if dispatch.archive_id.is_none() {
            self.finalize_and_archive(id, actor).await?;
            dispatch = self.load(id).await?;
        }
        if dispatch.status != DispatchStatus::Finalized {
            return Err(DispatchError::transition(
                format!("dispatch {}", id),
                dispatch.status,
                if request.local_print {
                    DispatchStatus::DistributedLocally
                } else {
                    DispatchStatus::Distributed
                },
            ));
        }
        let archive_id = dispatch.archive_id.clone().unwrap_or_default();

        let (order_id, channel, status) = if request.local_print {
            (None, DistributionChannel::LocalPrint, DispatchStatus::DistributedLocally)
        } else {
            let address = self
                .resolve_address(&dispatch, request.address_override.clone())
                .await;
            let receipt = self
                .services
                .distribution
                .distribute(&DistributionRequest {
                    archive_id: archive_id.clone(),
                    recipient_ident: dispatch.recipient.as_ref().map(|r| r.ident.clone()),
                    address,
                    batch_id: request.batch_id.clone(),
                })
                .await
                .map_err(|e| DispatchError::DistributionFailed {
                    id,
                    reason: e.to_string(),
                })?;
            (
                Some(receipt.order_id),
                receipt.channel.unwrap_or(DistributionChannel::Print),
                DispatchStatus::Distributed,
            )
        };

        let (saved, transitioned) = mutate_dispatch(
            self.repository.as_ref(),
            id,
            self.mutation_attempts,
            |current| {
                if current.status.is_distributed() {
                    return Ok(false);
                }
                if current.status != DispatchStatus::Finalized {
                    return Err(DispatchError::transition(
                        format!("dispatch {}", id),
                        current.status,
                        status,
                    ));
                }
                let now = Utc::now();
                current.status = status;
                current.distribution = Some(DistributionInfo {
                    order_id: order_id.clone(),
                    channel,
                    distributed_by: actor.ident.clone(),
                    distributed_at: now,
                    batch_id: request.batch_id.clone(),
                    confirmed_at: request.local_print.then_some(now),
                    event_published_at: None,
                });
                current.touch(actor, now);
                Ok(true)
            },
        )
        .await?;

        if transitioned {
            info!(order_id = ?order_id, %channel, "Distributed dispatch");
            self.complete_distribution(&saved).await;
        }

        DistributionOutcome::from_dispatch(&saved)
    }

    /// Apply a status reported by the distribution service.
    ///
    /// Returns `true` when the dispatch moved into DISTRIBUTED.
    #[instrument(skip(self, report), fields(dispatch_id = %id, delivered = report.delivered))]
    pub async fn confirm_distribution(
        &self,
        id: Uuid,
        report: &DistributionStatus,
    ) -> DispatchResult<bool> {
        if !report.delivered {
            return Ok(false);
        }

        let (saved, transitioned) = mutate_dispatch(
            self.repository.as_ref(),
            id,
            self.mutation_attempts,
            |current| {
                if current.kind == DispatchKind::InternalNote {
                    return Err(DispatchError::invalid(format!(
                        "dispatch {} is an internal note and cannot be distributed",
                        id
                    )));
                }
                let now = Utc::now();
                let at = report.distributed_at.unwrap_or(now);
                match current.status {
                    DispatchStatus::Distributed | DispatchStatus::DistributedLocally => {
                        if let Some(distribution) = current.distribution.as_mut() {
                            if distribution.confirmed_at.is_none() {
                                distribution.confirmed_at = Some(now);
                            }
                            if let Some(channel) = report.channel {
                                distribution.channel = channel;
                            }
                            if distribution.order_id.is_none() {
                                distribution.order_id = report.order_id.clone();
                            }
                        }
                        Ok(false)
                    }
                    DispatchStatus::Finalized => {
                        current.status = DispatchStatus::Distributed;
                        current.distribution = Some(DistributionInfo {
                            order_id: report.order_id.clone(),
                            channel: report.channel.unwrap_or(DistributionChannel::Print),
                            distributed_by: Actor::SYSTEM_IDENT.to_string(),
                            distributed_at: at,
                            batch_id: None,
                            confirmed_at: Some(now),
                            event_published_at: None,
                        });
                        current.touch(&Actor::system(), now);
                        Ok(true)
                    }
                    other => Err(DispatchError::transition(
                        format!("dispatch {}", id),
                        other,
                        DispatchStatus::Distributed,
                    )),
                }
            },
        )
        .await?;

        if transitioned {
            info!("Distribution reported by the distribution service");
        }
        self.complete_distribution(&saved).await;
        Ok(transitioned)
    }

    /// Side effects owed by a distributed dispatch: the distributed event and,
    /// after a service distribution, the follow-up submission.
    ///
    /// Both are recorded on the dispatch once done, so calling this again only
    /// retries what failed before. Returns `true` when nothing is left owed.
    pub async fn complete_distribution(&self, dispatch: &Dispatch) -> bool {
        if !dispatch.status.is_distributed() {
            return true;
        }
        let published = self.publish_distributed(dispatch).await;
        let submitted = dispatch.status != DispatchStatus::Distributed
            || self.submit_follow_up(dispatch).await;
        published && submitted
    }

    async fn publish_distributed(&self, dispatch: &Dispatch) -> bool {
        if dispatch
            .distribution
            .as_ref()
            .is_some_and(|d| d.event_published_at.is_some())
        {
            return true;
        }
        let Some(event) = DispatchDistributedEvent::from_dispatch(dispatch) else {
            return true;
        };
        if let Err(e) = self.services.events.publish_distributed(&event).await {
            error!(dispatch_id = %dispatch.id, error = %e, "Failed to publish distributed event");
            return false;
        }

        let result = mutate_dispatch(
            self.repository.as_ref(),
            dispatch.id,
            self.mutation_attempts,
            |current| {
                if let Some(distribution) = current.distribution.as_mut() {
                    distribution.event_published_at.get_or_insert_with(Utc::now);
                }
                Ok(())
            },
        )
        .await;
        if let Err(e) = result {
            // the event goes out again on the next attempt
            warn!(dispatch_id = %dispatch.id, error = %e, "Failed to record published event");
            return false;
        }
        true
    }

    /// Best effort: a failure is logged, and distribution reconciliation
    /// retries it while the dispatch has no submission id
    async fn submit_follow_up(&self, dispatch: &Dispatch) -> bool {
        let (Some(follow_up), Some(archive_id)) = (&dispatch.follow_up, &dispatch.archive_id)
        else {
            return true;
        };
        if follow_up.submission_id.is_some() {
            return true;
        }

        let submission = FollowUpSubmission {
            dispatch_id: dispatch.id,
            archive_id: archive_id.clone(),
            subject_ident: dispatch.subject_ident.clone(),
            tema: dispatch.tema,
            title: follow_up.title.clone(),
            due_date: (Utc::now() + Duration::days(i64::from(follow_up.due_in_days))).date_naive(),
            attachment_codes: follow_up.attachment_codes.clone(),
        };

        let submission_id = match self.services.intake.submit_follow_up(&submission).await {
            Ok(id) => id,
            Err(e) => {
                warn!(dispatch_id = %dispatch.id, error = %e, "Follow-up submission failed");
                return false;
            }
        };

        let result = mutate_dispatch(
            self.repository.as_ref(),
            dispatch.id,
            self.mutation_attempts,
            |current| {
                if let Some(follow_up) = current.follow_up.as_mut() {
                    follow_up.submission_id = Some(submission_id.clone());
                    follow_up.submitted_at = Some(Utc::now());
                }
                Ok(())
            },
        )
        .await;
        if let Err(e) = result {
            warn!(dispatch_id = %dispatch.id, error = %e, "Failed to record follow-up submission");
            return false;
        }
        true
    }
}
