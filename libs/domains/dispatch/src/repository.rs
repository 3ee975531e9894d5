use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::models::{Dispatch, DispatchKind, DispatchStatus, DocumentStatus};

/// Persistence for dispatch aggregates (dispatch row plus its documents)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchRepository: Send + Sync {
    async fn insert(&self, dispatch: &Dispatch) -> DispatchResult<()>;

    async fn get(&self, id: Uuid) -> DispatchResult<Option<Dispatch>>;

    /// Persist the aggregate if nobody saved it since it was loaded.
    ///
    /// Returns the stored version. Fails with `Conflict` and writes nothing
    /// when `dispatch.version` no longer matches.
    async fn save(&self, dispatch: &Dispatch) -> DispatchResult<i64>;

    /// Dispatches holding an active document whose own or original reference is `key`
    async fn find_by_document_reference(&self, key: &str) -> DispatchResult<Vec<Dispatch>>;

    /// IN_PRODUCTION dispatches with at least one active document in one of `statuses`
    async fn find_in_production_with_document_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> DispatchResult<Vec<Dispatch>>;

    /// Distributed dispatches that are unconfirmed or still owe their event or
    /// follow-up, and OUTBOUND dispatches finalized before `finalized_before`.
    /// Ordered by id, starting after `after`.
    async fn find_distribution_candidates(
        &self,
        finalized_before: DateTime<Utc>,
        after: Option<Uuid>,
        limit: u64,
    ) -> DispatchResult<Vec<Dispatch>>;
}

pub(crate) fn is_distribution_candidate(
    dispatch: &Dispatch,
    finalized_before: DateTime<Utc>,
) -> bool {
    match dispatch.status {
        DispatchStatus::Distributed | DispatchStatus::DistributedLocally => {
            let Some(distribution) = dispatch.distribution.as_ref() else {
                return true;
            };
            let follow_up_owed = dispatch.status == DispatchStatus::Distributed
                && dispatch
                    .follow_up
                    .as_ref()
                    .is_some_and(|f| f.submission_id.is_none());
            distribution.confirmed_at.is_none()
                || distribution.event_published_at.is_none()
                || follow_up_owed
        }
        DispatchStatus::Finalized => {
            dispatch.kind == DispatchKind::Outbound
                && dispatch.finalized_at.is_some_and(|at| at < finalized_before)
        }
        _ => false,
    }
}

/// Load, edit, save; on a lost optimistic lock reload and edit again.
///
/// `edit` must be a pure function of the aggregate: it may run several times.
pub async fn mutate_dispatch<R, T, F>(
    repository: &R,
    id: Uuid,
    max_attempts: u32,
    mut edit: F,
) -> DispatchResult<(Dispatch, T)>
where
    R: DispatchRepository + ?Sized,
    F: FnMut(&mut Dispatch) -> DispatchResult<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut dispatch = repository
            .get(id)
            .await?
            .ok_or(DispatchError::NotFound(id))?;
        let output = edit(&mut dispatch)?;

        match repository.save(&dispatch).await {
            Ok(version) => {
                dispatch.version = version;
                return Ok((dispatch, output));
            }
            Err(DispatchError::Conflict(_)) if attempt < max_attempts.max(1) => {
                tracing::debug!(dispatch_id = %id, attempt, "Concurrent modification, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-memory implementation of DispatchRepository (for development/testing)
#[derive(Debug, Default, Clone)]
pub struct InMemoryDispatchRepository {
    dispatches: Arc<RwLock<HashMap<Uuid, Dispatch>>>,
}

impl InMemoryDispatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DispatchRepository for InMemoryDispatchRepository {
    async fn insert(&self, dispatch: &Dispatch) -> DispatchResult<()> {
        let mut dispatches = self.dispatches.write().await;
        if dispatches.contains_key(&dispatch.id) {
            return Err(DispatchError::Conflict(dispatch.id));
        }
        dispatches.insert(dispatch.id, dispatch.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DispatchResult<Option<Dispatch>> {
        Ok(self.dispatches.read().await.get(&id).cloned())
    }

    async fn save(&self, dispatch: &Dispatch) -> DispatchResult<i64> {
        let mut dispatches = self.dispatches.write().await;
        let stored = dispatches
            .get_mut(&dispatch.id)
            .ok_or(DispatchError::NotFound(dispatch.id))?;

        if stored.version != dispatch.version {
            return Err(DispatchError::Conflict(dispatch.id));
        }

        let mut next = dispatch.clone();
        next.version = dispatch.version + 1;
        *stored = next;
        Ok(dispatch.version + 1)
    }

    async fn find_by_document_reference(&self, key: &str) -> DispatchResult<Vec<Dispatch>> {
        let dispatches = self.dispatches.read().await;
        let mut found: Vec<Dispatch> = dispatches
            .values()
            .filter(|d| d.documents.iter().any(|doc| doc.is_active() && doc.answers_to(key)))
            .cloned()
            .collect();
        found.sort_by_key(|d| d.id);
        Ok(found)
    }

    async fn find_in_production_with_document_status(
        &self,
        statuses: &[DocumentStatus],
    ) -> DispatchResult<Vec<Dispatch>> {
        let dispatches = self.dispatches.read().await;
        let mut found: Vec<Dispatch> = dispatches
            .values()
            .filter(|d| d.status == DispatchStatus::InProduction)
            .filter(|d| {
                d.documents
                    .iter()
                    .any(|doc| doc.is_active() && statuses.contains(&doc.status))
            })
            .cloned()
            .collect();
        found.sort_by_key(|d| d.id);
        Ok(found)
    }

    async fn find_distribution_candidates(
        &self,
        finalized_before: DateTime<Utc>,
        after: Option<Uuid>,
        limit: u64,
    ) -> DispatchResult<Vec<Dispatch>> {
        let dispatches = self.dispatches.read().await;
        let mut found: Vec<Dispatch> = dispatches
            .values()
            .filter(|d| after.is_none_or(|after| d.id > after))
            .filter(|d| is_distribution_candidate(d, finalized_before))
            .cloned()
            .collect();
        found.sort_by_key(|d| d.id);
        found.truncate(limit as usize);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DistributionChannel, DistributionInfo, Document, FollowUp, OriginalReference, SourceKind,
    };
    use crate::state_machine::tests::dispatch;
    use chrono::Duration;

    #[tokio::test]
    async fn test_save_bumps_version_and_rejects_stale_copies() {
        let repo = InMemoryDispatchRepository::new();
        let d = dispatch(DispatchKind::Outbound, DispatchStatus::InProduction);
        repo.insert(&d).await.unwrap();

        let mut first = repo.get(d.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.title = Some("first".into());
        assert_eq!(repo.save(&first).await.unwrap(), 1);

        second.title = Some("second".into());
        assert!(matches!(
            repo.save(&second).await,
            Err(DispatchError::Conflict(_))
        ));

        let stored = repo.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("first"));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_mutate_retries_after_conflict() {
        let repo = InMemoryDispatchRepository::new();
        let d = dispatch(DispatchKind::Outbound, DispatchStatus::InProduction);
        repo.insert(&d).await.unwrap();

        let mut calls = 0;
        let (saved, ()) = mutate_dispatch(&repo, d.id, 3, |dispatch| {
            calls += 1;
            if calls == 1 {
                // A concurrent writer sneaks in between load and save
                dispatch.version -= 1;
            }
            dispatch.title = Some("edited".into());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(saved.title.as_deref(), Some("edited"));
        assert_eq!(saved.version, 1);
    }

    #[tokio::test]
    async fn test_mutate_gives_up_after_max_attempts() {
        let mut repo = MockDispatchRepository::new();
        let d = dispatch(DispatchKind::Outbound, DispatchStatus::InProduction);
        let id = d.id;
        repo.expect_get().times(2).returning(move |_| Ok(Some(d.clone())));
        repo.expect_save()
            .times(2)
            .returning(move |_| Err(DispatchError::Conflict(id)));

        let result = mutate_dispatch(&repo, id, 2, |_| Ok(())).await;
        assert!(matches!(result, Err(DispatchError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_mutate_missing_dispatch_is_not_found() {
        let repo = InMemoryDispatchRepository::new();
        let result = mutate_dispatch(&repo, Uuid::now_v7(), 3, |_| Ok(())).await;
        assert!(matches!(result, Err(DispatchError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_find_by_reference_matches_originals_and_skips_detached() {
        let repo = InMemoryDispatchRepository::new();
        let now = Utc::now();

        let mut source = dispatch(DispatchKind::Outbound, DispatchStatus::InProduction);
        let produced = Document::new(
            source.id,
            "letter",
            DocumentStatus::InProduction,
            SourceKind::Produced,
            now,
        );
        let key = produced.reference.clone();
        source.documents.push(produced);

        let mut copy_holder = dispatch(DispatchKind::InternalNote, DispatchStatus::InProduction);
        let mut copy = Document::new(
            copy_holder.id,
            "letter",
            DocumentStatus::InProduction,
            SourceKind::CopiedFromDispatch,
            now,
        );
        copy.original = Some(OriginalReference {
            dispatch_id: Some(source.id),
            archive_id: None,
            document_reference: Some(key.clone()),
        });
        copy_holder.documents.push(copy);

        let mut detached_holder = copy_holder.clone();
        detached_holder.id = Uuid::now_v7();
        detached_holder.documents[0].deleted_at = Some(now);

        for d in [&source, &copy_holder, &detached_holder] {
            repo.insert(d).await.unwrap();
        }

        let found = repo.find_by_document_reference(&key).await.unwrap();
        let ids: Vec<Uuid> = found.iter().map(|d| d.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&source.id));
        assert!(ids.contains(&copy_holder.id));
    }

    #[tokio::test]
    async fn test_distribution_candidates_page_by_id() {
        let repo = InMemoryDispatchRepository::new();
        let now = Utc::now();

        let mut old = Vec::new();
        for _ in 0..3 {
            let mut d = dispatch(DispatchKind::Outbound, DispatchStatus::Finalized);
            d.finalized_at = Some(now - Duration::hours(5));
            repo.insert(&d).await.unwrap();
            old.push(d.id);
        }
        let mut fresh = dispatch(DispatchKind::Outbound, DispatchStatus::Finalized);
        fresh.finalized_at = Some(now);
        repo.insert(&fresh).await.unwrap();

        let cutoff = now - Duration::hours(2);
        let first = repo
            .find_distribution_candidates(cutoff, None, 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = repo
            .find_distribution_candidates(cutoff, Some(first[1].id), 2)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);

        let mut seen: Vec<Uuid> = first.iter().chain(second.iter()).map(|d| d.id).collect();
        seen.sort();
        old.sort();
        assert_eq!(seen, old);
    }

    fn delivered(kind: DispatchKind, status: DispatchStatus, at: DateTime<Utc>) -> Dispatch {
        let mut d = dispatch(kind, status);
        d.distribution = Some(DistributionInfo {
            order_id: Some("B-1".into()),
            channel: DistributionChannel::Print,
            distributed_by: "Z999999".into(),
            distributed_at: at,
            batch_id: None,
            confirmed_at: Some(at),
            event_published_at: Some(at),
        });
        d
    }

    #[test]
    fn test_distribution_candidate_rules() {
        let now = Utc::now();
        let cutoff = now - Duration::hours(2);

        let mut stale_note = dispatch(DispatchKind::InternalNote, DispatchStatus::Finalized);
        stale_note.finalized_at = Some(now - Duration::hours(48));
        assert!(!is_distribution_candidate(&stale_note, cutoff));

        let mut stale_letter = dispatch(DispatchKind::Outbound, DispatchStatus::Finalized);
        stale_letter.finalized_at = Some(now - Duration::hours(48));
        assert!(is_distribution_candidate(&stale_letter, cutoff));

        let settled = delivered(DispatchKind::Outbound, DispatchStatus::Distributed, now);
        assert!(!is_distribution_candidate(&settled, cutoff));

        let mut unpublished = settled.clone();
        if let Some(distribution) = unpublished.distribution.as_mut() {
            distribution.event_published_at = None;
        }
        assert!(is_distribution_candidate(&unpublished, cutoff));

        let follow_up = FollowUp {
            title: "Lønnsslipp".into(),
            due_in_days: 14,
            attachment_codes: vec![],
            submission_id: None,
            submitted_at: None,
        };
        let mut owes_follow_up = settled.clone();
        owes_follow_up.follow_up = Some(follow_up.clone());
        assert!(is_distribution_candidate(&owes_follow_up, cutoff));

        // local print never submits a follow-up
        let mut printed = delivered(DispatchKind::Outbound, DispatchStatus::DistributedLocally, now);
        printed.follow_up = Some(follow_up);
        assert!(!is_distribution_candidate(&printed, cutoff));
    }
}
