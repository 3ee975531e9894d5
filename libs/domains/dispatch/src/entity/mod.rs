//! Sea-ORM entities for the `dispatches` and `dispatch_documents` tables

pub mod dispatch;
pub mod document;

use crate::error::DispatchResult;
use crate::models::{Dispatch, DistributionInfo, Document, ProceedingRef};

/// Rebuild the aggregate from its root row and document rows
pub fn into_domain(
    model: dispatch::Model,
    documents: Vec<document::Model>,
) -> DispatchResult<Dispatch> {
    let proceeding = ProceedingRef {
        treatment_id: model.treatment_id,
        decision_id: model.decision_id,
    };

    let distribution = match (
        model.distribution_channel,
        model.distributed_by,
        model.distributed_at,
    ) {
        (Some(channel), Some(distributed_by), Some(distributed_at)) => Some(DistributionInfo {
            order_id: model.distribution_order_id,
            channel,
            distributed_by,
            distributed_at: distributed_at.into(),
            batch_id: model.distribution_batch_id,
            confirmed_at: model.distribution_confirmed_at.map(Into::into),
            event_published_at: model.distribution_event_published_at.map(Into::into),
        }),
        _ => None,
    };

    let mut documents: Vec<Document> = documents.into_iter().map(Document::from).collect();
    documents.sort_by_key(|d| (d.index, d.created_at));

    Ok(Dispatch {
        id: model.id,
        case_number: model.case_number,
        subject_ident: model.subject_ident,
        recipient: dispatch::from_json(model.recipient)?,
        tema: model.tema,
        kind: model.kind,
        status: model.status,
        title: model.title,
        unit: model.unit,
        language: model.language,
        proceeding: (!proceeding.is_empty()).then_some(proceeding),
        follow_up: dispatch::from_json(model.follow_up)?,
        archive_id: model.archive_id,
        distribution,
        created_by: model.created_by,
        created_at: model.created_at.into(),
        updated_by: model.updated_by,
        updated_at: model.updated_at.into(),
        finalized_at: model.finalized_at.map(Into::into),
        aborted_by: model.aborted_by,
        aborted_at: model.aborted_at.map(Into::into),
        version: model.version,
        documents,
    })
}
