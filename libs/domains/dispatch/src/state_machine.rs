//! Lifecycle rules for documents and dispatches.
//!
//! Everything here is pure: services load an aggregate, apply these rules
//! and persist the result.

use chrono::{DateTime, Utc};

use crate::error::{DispatchError, DispatchResult};
use crate::events::ProductionEventStatus;
use crate::models::{
    Deviation, Dispatch, DispatchKind, DispatchStatus, Document, DocumentLifecycle, DocumentRole,
    DocumentStatus, SourceKind, VisibleDocumentStatus,
};

impl DocumentStatus {
    /// Position on the production path. Events never move a document to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            DocumentStatus::NotOrdered | DocumentStatus::OrderFailed => 0,
            DocumentStatus::InProduction => 1,
            DocumentStatus::UnderEditing | DocumentStatus::MustBeReviewed => 2,
            DocumentStatus::Reviewed => 3,
            DocumentStatus::Finalized => 4,
            DocumentStatus::Aborted => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Finalized | DocumentStatus::Aborted)
    }

    pub fn visible(&self) -> VisibleDocumentStatus {
        match self {
            DocumentStatus::NotOrdered | DocumentStatus::InProduction => {
                VisibleDocumentStatus::InProduction
            }
            DocumentStatus::OrderFailed => VisibleDocumentStatus::Failed,
            DocumentStatus::UnderEditing
            | DocumentStatus::MustBeReviewed
            | DocumentStatus::Reviewed => VisibleDocumentStatus::Editing,
            DocumentStatus::Finalized => VisibleDocumentStatus::Finalized,
            DocumentStatus::Aborted => VisibleDocumentStatus::Aborted,
        }
    }
}

/// Whether a dispatch accepts edits to its fields and documents
pub fn can_edit(status: DispatchStatus) -> bool {
    status == DispatchStatus::InProduction
}

/// Attaching is also how an empty outbound dispatch gets its first document
pub fn can_attach(status: DispatchStatus) -> bool {
    matches!(
        status,
        DispatchStatus::InProduction | DispatchStatus::BeingCreated
    )
}

/// Guard for every mutating operation; `operation` names the attempted change
pub fn require_editable(dispatch: &Dispatch, operation: &str) -> DispatchResult<()> {
    if can_edit(dispatch.status) {
        Ok(())
    } else {
        Err(DispatchError::transition(
            format!("dispatch {}", dispatch.id),
            dispatch.status,
            operation,
        ))
    }
}

/// At least one active document, and every active document finalized
pub fn is_ready_for_archive<'a>(documents: impl IntoIterator<Item = &'a Document>) -> bool {
    let mut any = false;
    for document in documents.into_iter().filter(|d| d.is_active()) {
        if document.status != DocumentStatus::Finalized {
            return false;
        }
        any = true;
    }
    any
}

/// New status for a document receiving a production event, `None` if it stays put
pub fn status_after_event(
    current: DocumentStatus,
    event: ProductionEventStatus,
) -> Option<DocumentStatus> {
    if current.is_terminal() {
        return None;
    }
    let target = match event {
        ProductionEventStatus::Editing => DocumentStatus::UnderEditing,
        ProductionEventStatus::Finished => DocumentStatus::Finalized,
    };
    (target.rank() > current.rank()).then_some(target)
}

/// What removing a document does to it
pub fn removal_transition(has_original: bool) -> DocumentLifecycle {
    if has_original {
        DocumentLifecycle::Detached
    } else {
        DocumentLifecycle::Purged
    }
}

/// Status a new document starts in.
///
/// `original` is the status of the document a dispatch copy was taken from, if found.
pub fn initial_status(source: SourceKind, original: Option<DocumentStatus>) -> DocumentStatus {
    match source {
        SourceKind::Produced => DocumentStatus::NotOrdered,
        SourceKind::CopiedFromArchive => DocumentStatus::MustBeReviewed,
        SourceKind::CopiedFromDispatch => match original {
            Some(DocumentStatus::Finalized) => DocumentStatus::Finalized,
            Some(
                DocumentStatus::NotOrdered
                | DocumentStatus::InProduction
                | DocumentStatus::OrderFailed,
            ) => DocumentStatus::InProduction,
            _ => DocumentStatus::UnderEditing,
        },
    }
}

pub fn allowed_deviations(dispatch: &Dispatch) -> Vec<Deviation> {
    match (dispatch.status, dispatch.kind) {
        (DispatchStatus::InProduction, _) => vec![Deviation::Abort],
        (DispatchStatus::BeingCreated, _) => vec![Deviation::Delete],
        (DispatchStatus::Finalized, DispatchKind::Outbound) => vec![Deviation::DistributeLocally],
        _ => vec![],
    }
}

impl Dispatch {
    pub fn is_ready_for_archive(&self) -> bool {
        is_ready_for_archive(&self.documents)
    }

    /// References of active documents that are not finalized yet
    pub fn unfinished_documents(&self) -> Vec<String> {
        self.active_documents()
            .into_iter()
            .filter(|d| d.status != DocumentStatus::Finalized)
            .map(|d| d.reference.clone())
            .collect()
    }

    /// Compact active indices to `0..n` and make index 0 the only MAIN document
    pub fn normalize_documents(&mut self) {
        let mut active: Vec<usize> = (0..self.documents.len())
            .filter(|&i| self.documents[i].is_active())
            .collect();
        active.sort_by_key(|&i| (self.documents[i].index, self.documents[i].created_at));

        for (position, i) in active.into_iter().enumerate() {
            let document = &mut self.documents[i];
            document.index = position as i32;
            document.role = if position == 0 {
                DocumentRole::Main
            } else {
                DocumentRole::Attachment
            };
        }
    }

    /// MAIN goes in front and demotes the rest; attachments go last.
    pub fn insert_document(&mut self, mut document: Document, role: DocumentRole) {
        document.index = match role {
            DocumentRole::Main => i32::MIN,
            DocumentRole::Attachment => i32::MAX,
        };
        self.documents.push(document);
        self.normalize_documents();
    }

    /// Put the listed documents first, in the given order; other active
    /// documents follow in their previous order.
    pub fn reorder(&mut self, order: &[uuid::Uuid]) {
        let previous: Vec<uuid::Uuid> = self.active_documents().iter().map(|d| d.id).collect();
        let offset = order.len() as i32;

        for document in self.documents.iter_mut().filter(|d| d.is_active()) {
            document.index = match order.iter().position(|id| *id == document.id) {
                Some(position) => position as i32,
                None => {
                    let rank = previous.iter().position(|id| *id == document.id).unwrap_or(0);
                    offset + rank as i32
                }
            };
        }
        self.normalize_documents();
    }

    /// Detach or purge an active document and restore the MAIN invariant
    pub fn remove_document(
        &mut self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> DispatchResult<DocumentLifecycle> {
        let position = self
            .documents
            .iter()
            .position(|d| d.is_active() && d.reference == reference)
            .ok_or_else(|| {
                DispatchError::invalid(format!(
                    "document {reference} is not attached to dispatch {}",
                    self.id
                ))
            })?;

        let transition = removal_transition(self.documents[position].has_original());
        match transition {
            DocumentLifecycle::Detached => self.documents[position].deleted_at = Some(now),
            DocumentLifecycle::Purged => {
                self.documents.remove(position);
            }
            DocumentLifecycle::Active => {}
        }
        self.normalize_documents();
        Ok(transition)
    }
}
