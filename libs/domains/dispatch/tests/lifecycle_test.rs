//! End-to-end lifecycle scenarios against the in-memory repository
//!
//! Every external service is a recording fake, so the tests can assert how often
//! and with what each service was called.

mod common;

use common::*;
use domain_dispatch::models::{DistributionChannel, FollowUpRequest, SourceKind};
use domain_dispatch::*;
use stream_worker::{ProcessOutcome, StreamProcessor};

// ============================================================================
// Internal notes
// ============================================================================

#[tokio::test]
async fn test_note_is_archived_when_its_document_finishes() {
    let h = Harness::new();
    let note = h
        .assembly
        .create_dispatch(
            request(
                DispatchKind::InternalNote,
                vec![DocumentRequest::produced("Samtalereferat", "NOTAT")],
            ),
            &clerk(),
        )
        .await
        .unwrap();
    let reference = note.documents[0].reference.clone();
    assert_eq!(note.documents[0].status, DocumentStatus::InProduction);
    assert_eq!(h.production.order_count(), 1);

    let editing = status_event(&reference, ProductionEventStatus::Editing);
    assert_eq!(h.processor.process(&editing).await.unwrap(), ProcessOutcome::Processed);
    assert_eq!(h.archive.call_count(), 0);

    let finished = status_event(&reference, ProductionEventStatus::Finished);
    h.processor.process(&finished).await.unwrap();

    let stored = h.stored(note.id).await;
    assert_eq!(stored.status, DispatchStatus::Finalized);
    assert_eq!(stored.archive_id.as_deref(), Some("JP-1"));
    assert!(stored.documents[0].archive_reference.is_some());

    let requests = h.archive.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].documents.len(), 1);
    assert_eq!(requests[0].documents[0].title, "Samtalereferat");
    assert_eq!(requests[0].title, "Samtalereferat");
    assert!(!requests[0].outbound);

    // redelivery neither regresses nor archives again
    h.processor.process(&finished).await.unwrap();
    h.processor.process(&editing).await.unwrap();
    assert_eq!(h.archive.call_count(), 1);
    assert_eq!(h.stored(note.id).await.documents[0].status, DocumentStatus::Finalized);
}

// ============================================================================
// Outbound assembly
// ============================================================================

#[tokio::test]
async fn test_detaching_copied_main_promotes_remaining_document() {
    let h = Harness::new();
    let dispatch = h
        .assembly
        .create_dispatch(
            request(
                DispatchKind::Outbound,
                vec![
                    archive_copy("Tidligere vedtak", "DOK-77"),
                    DocumentRequest::produced("Varsel", "FAR01"),
                ],
            ),
            &clerk(),
        )
        .await
        .unwrap();
    let active = dispatch.active_documents();
    assert_eq!(active[0].source, SourceKind::CopiedFromArchive);
    assert_eq!(active[0].role, DocumentRole::Main);
    let copy_reference = active[0].reference.clone();
    let produced_reference = active[1].reference.clone();

    let mut detach = DocumentRequest::existing(&copy_reference);
    detach.detach = true;
    let update = UpdateDispatchRequest {
        documents: Some(vec![detach, DocumentRequest::existing(&produced_reference)]),
        ..Default::default()
    };
    let updated = h
        .assembly
        .update_dispatch(dispatch.id, update, &clerk())
        .await
        .unwrap();

    let active = updated.active_documents();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].title, "Varsel");
    assert_eq!(active[0].role, DocumentRole::Main);
    assert_eq!(active[0].index, 0);

    // soft-deleted, still stored for audit
    let detached = updated
        .documents
        .iter()
        .find(|d| d.reference == copy_reference)
        .unwrap();
    assert!(detached.deleted_at.is_some());
}

#[tokio::test]
async fn test_failed_order_is_retried_by_scheduler() {
    let h = Harness::new();
    h.production.fail(true);

    let dispatch = h
        .assembly
        .create_dispatch(
            request(DispatchKind::Outbound, vec![DocumentRequest::produced("Vedtak", "FAR02")]),
            &clerk(),
        )
        .await
        .unwrap();
    assert_eq!(dispatch.status, DispatchStatus::InProduction);
    assert_eq!(dispatch.documents[0].status, DocumentStatus::OrderFailed);

    h.production.fail(false);
    let report = h.reconciliation.retry_failed_orders().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let stored = h.stored(dispatch.id).await;
    assert_eq!(stored.documents[0].status, DocumentStatus::InProduction);
    assert_eq!(h.production.order_count(), 1);
}

#[tokio::test]
async fn test_stuck_document_promoted_across_copies() {
    let h = Harness::new();
    let source = h
        .assembly
        .create_dispatch(
            request(DispatchKind::Outbound, vec![DocumentRequest::produced("Vedtak", "FAR02")]),
            &clerk(),
        )
        .await
        .unwrap();
    let reference = source.documents[0].reference.clone();

    let copy = DocumentRequest {
        original: Some(models::OriginalReference {
            dispatch_id: Some(source.id),
            archive_id: None,
            document_reference: Some(reference.clone()),
        }),
        ..Default::default()
    };
    let mut note_request = request(DispatchKind::InternalNote, vec![copy]);
    note_request.recipient = None;
    let note = h.assembly.create_dispatch(note_request, &clerk()).await.unwrap();
    assert_eq!(note.documents[0].status, DocumentStatus::InProduction);

    h.production.finished.lock().unwrap().insert(reference.clone());
    let later = chrono::Utc::now() + chrono::Duration::hours(13);
    let report = h.reconciliation.promote_stuck_documents(later).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.succeeded, 1);

    assert_eq!(h.stored(source.id).await.documents[0].status, DocumentStatus::Finalized);
    let note = h.stored(note.id).await;
    assert_eq!(note.documents[0].status, DocumentStatus::Finalized);
    assert_eq!(note.status, DispatchStatus::Finalized);
    assert_eq!(h.archive.call_count(), 1);
}

// ============================================================================
// Archiving and distribution
// ============================================================================

async fn finished_outbound(h: &Harness) -> Dispatch {
    let mut create = request(DispatchKind::Outbound, vec![DocumentRequest::produced("Vedtak", "FAR02")]);
    create.follow_up = Some(FollowUpRequest {
        title: "Dokumentasjon av inntekt".into(),
        due_in_days: 21,
        attachment_codes: vec!["INNTEKT".into()],
    });
    let dispatch = h.assembly.create_dispatch(create, &clerk()).await.unwrap();
    let reference = dispatch.documents[0].reference.clone();
    h.processor
        .process(&status_event(&reference, ProductionEventStatus::Finished))
        .await
        .unwrap();

    let stored = h.stored(dispatch.id).await;
    assert_eq!(stored.status, DispatchStatus::InProduction);
    assert!(stored.is_ready_for_archive());
    stored
}

#[tokio::test]
async fn test_distribute_archives_first_when_needed() {
    let h = Harness::new();
    let dispatch = finished_outbound(&h).await;

    let outcome = h
        .orchestrator
        .distribute(dispatch.id, DistributeRequest::default(), &clerk())
        .await
        .unwrap();

    assert_eq!(outcome.archive_id, "JP-1");
    assert_eq!(outcome.order_id.as_deref(), Some("BEST-1"));
    assert_eq!(outcome.status, DispatchStatus::Distributed);
    assert_eq!(outcome.channel, DistributionChannel::Print);
    assert_eq!(h.archive.call_count(), 1);
    assert_eq!(h.distribution.call_count(), 1);

    let published = h.events.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].dispatch_id, dispatch.id);

    let submissions = h.intake.submissions.lock().unwrap().clone();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].archive_id, "JP-1");
    let stored = h.stored(dispatch.id).await;
    assert_eq!(
        stored.follow_up.unwrap().submission_id.as_deref(),
        Some("ETT-1")
    );
}

#[tokio::test]
async fn test_archive_and_distribute_are_idempotent() {
    let h = Harness::new();
    let dispatch = finished_outbound(&h).await;

    let first = h.orchestrator.finalize_and_archive(dispatch.id, &clerk()).await.unwrap();
    let second = h.orchestrator.finalize_and_archive(dispatch.id, &clerk()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.archive.call_count(), 1);

    let first = h
        .orchestrator
        .distribute(dispatch.id, DistributeRequest::default(), &clerk())
        .await
        .unwrap();
    let second = h
        .orchestrator
        .distribute(dispatch.id, DistributeRequest::default(), &clerk())
        .await
        .unwrap();
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(h.distribution.call_count(), 1);
    assert_eq!(h.events.published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_local_print_is_confirmed_immediately() {
    let h = Harness::new();
    let dispatch = finished_outbound(&h).await;
    h.orchestrator.finalize_and_archive(dispatch.id, &clerk()).await.unwrap();

    let deviations = h.assembly.list_allowed_deviations(dispatch.id).await.unwrap();
    assert_eq!(deviations, vec![Deviation::DistributeLocally]);

    let outcome = h
        .orchestrator
        .distribute(
            dispatch.id,
            DistributeRequest {
                local_print: true,
                ..Default::default()
            },
            &clerk(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, DispatchStatus::DistributedLocally);
    assert_eq!(outcome.channel, DistributionChannel::LocalPrint);
    assert_eq!(h.distribution.call_count(), 0);
    assert!(h.intake.submissions.lock().unwrap().is_empty());

    let stored = h.stored(dispatch.id).await;
    assert!(stored.distribution.unwrap().confirmed_at.is_some());

    // nothing for reconciliation to look at
    let report = h
        .reconciliation
        .reconcile_distribution(chrono::Utc::now() + chrono::Duration::hours(3))
        .await
        .unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn test_reconciliation_picks_up_distribution_done_elsewhere() {
    let h = Harness::new();
    let dispatch = finished_outbound(&h).await;
    let archive_id = h.orchestrator.finalize_and_archive(dispatch.id, &clerk()).await.unwrap();

    h.distribution.statuses.lock().unwrap().insert(
        archive_id,
        clients::DistributionStatus {
            order_id: Some("BEST-EXT".into()),
            channel: Some(DistributionChannel::Digital),
            delivered: true,
            distributed_at: None,
        },
    );

    // too recent to be polled
    let report = h.reconciliation.reconcile_distribution(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.examined, 0);

    let later = chrono::Utc::now() + chrono::Duration::hours(3);
    let report = h.reconciliation.reconcile_distribution(later).await.unwrap();
    assert_eq!(report.succeeded, 1);

    let stored = h.stored(dispatch.id).await;
    assert_eq!(stored.status, DispatchStatus::Distributed);
    let info = stored.distribution.unwrap();
    assert_eq!(info.order_id.as_deref(), Some("BEST-EXT"));
    assert_eq!(info.channel, DistributionChannel::Digital);
    assert_eq!(h.events.published.lock().unwrap().len(), 1);
    assert_eq!(h.intake.submissions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_follow_up_is_resubmitted_by_reconciliation() {
    let h = Harness::new();
    let dispatch = finished_outbound(&h).await;

    h.intake.fail(true);
    h.orchestrator
        .distribute(dispatch.id, DistributeRequest::default(), &clerk())
        .await
        .unwrap();
    let stored = h.stored(dispatch.id).await;
    assert_eq!(stored.status, DispatchStatus::Distributed);
    assert!(stored.follow_up.unwrap().submission_id.is_none());

    h.intake.fail(false);
    let report = h.reconciliation.reconcile_distribution(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.failed, 0);

    let stored = h.stored(dispatch.id).await;
    assert_eq!(stored.follow_up.unwrap().submission_id.as_deref(), Some("ETT-1"));
    assert_eq!(h.intake.submissions.lock().unwrap().len(), 1);
    assert_eq!(h.distribution.call_count(), 1);
    assert_eq!(h.events.published.lock().unwrap().len(), 1);
}
