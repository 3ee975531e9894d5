//! Creation and editing of dispatches and their documents.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clients::ExternalServices;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    Actor, AttachDocumentRequest, CreateDispatchRequest, Deviation, Dispatch, DispatchKind,
    DispatchStatus, Document, DocumentLifecycle, DocumentRequest, DocumentRole, DocumentStatus,
    FollowUp, OriginalReference, SourceKind, UpdateDispatchRequest,
};
use crate::orchestrator::ArchiveOrchestrator;
use crate::production::ProductionGateway;
use crate::repository::{DispatchRepository, mutate_dispatch};
use crate::state_machine::{allowed_deviations, can_attach, initial_status, require_editable};

const DEFAULT_LANGUAGE: &str = "NB";
const NOTE_LIMIT: &str = "cannot add more than one document to a note";

fn validation(err: validator::ValidationErrors) -> DispatchError {
    DispatchError::invalid(err.to_string())
}

/// A document is attached twice when another active document shares its production key:
/// two copies of one original, or a copy of a document already produced here
fn reject_duplicate(dispatch: &Dispatch, document: &Document) -> DispatchResult<()> {
    let key = document.production_key();
    let taken = dispatch
        .documents
        .iter()
        .any(|d| d.is_active() && d.id != document.id && d.production_key() == key);
    if taken {
        return Err(DispatchError::invalid(format!(
            "document {} is already attached to dispatch {}",
            key, dispatch.id
        )));
    }
    Ok(())
}

pub struct DispatchAssemblyService<R: DispatchRepository> {
    repository: Arc<R>,
    gateway: ProductionGateway<R>,
    orchestrator: Arc<ArchiveOrchestrator<R>>,
    services: ExternalServices,
    mutation_attempts: u32,
}

impl<R: DispatchRepository> DispatchAssemblyService<R> {
    pub fn new(
        repository: Arc<R>,
        orchestrator: Arc<ArchiveOrchestrator<R>>,
        services: ExternalServices,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            gateway: ProductionGateway::new(repository.clone(), services.production.clone(), config),
            repository,
            orchestrator,
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

    async fn mutate<T>(
        &self,
        id: Uuid,
        edit: impl FnMut(&mut Dispatch) -> DispatchResult<T>,
    ) -> DispatchResult<(Dispatch, T)> {
        mutate_dispatch(self.repository.as_ref(), id, self.mutation_attempts, edit).await
    }

    /// Build a new document from a request entry; copies are resolved against
    /// their source.
    async fn prepare_document(
        &self,
        dispatch_id: Uuid,
        request: &DocumentRequest,
        now: DateTime<Utc>,
    ) -> DispatchResult<Document> {
        if let Some(reference) = &request.reference {
            return Err(DispatchError::invalid(format!(
                "document {} is not attached to dispatch {}",
                reference, dispatch_id
            )));
        }
        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        let Some(original) = &request.original else {
            let title = title
                .ok_or_else(|| DispatchError::invalid("a new document needs a title"))?;
            let mut document =
                Document::new(dispatch_id, title, DocumentStatus::NotOrdered, SourceKind::Produced, now);
            document.template_code = request.template_code.clone();
            return Ok(document);
        };

        let source_reference = original.document_reference.as_deref().ok_or_else(|| {
            DispatchError::invalid("a copied document needs the original's document reference")
        })?;

        match original.dispatch_id {
            Some(source_id) => {
                let source = self.repository.get(source_id).await?.ok_or_else(|| {
                    DispatchError::invalid(format!("original dispatch {} not found", source_id))
                })?;
                let source_document = source
                    .documents
                    .iter()
                    .find(|d| d.reference == source_reference)
                    .ok_or_else(|| {
                        DispatchError::invalid(format!(
                            "original document {} not found in dispatch {}",
                            source_reference, source_id
                        ))
                    })?;

                let mut document = Document::new(
                    dispatch_id,
                    title.unwrap_or(&source_document.title),
                    initial_status(SourceKind::CopiedFromDispatch, Some(source_document.status)),
                    SourceKind::CopiedFromDispatch,
                    now,
                );
                // Events for the original arrive under its production key
                document.original = Some(OriginalReference {
                    dispatch_id: Some(source_id),
                    archive_id: source.archive_id.clone(),
                    document_reference: Some(source_document.production_key().to_string()),
                });
                document.template_code = source_document.template_code.clone();
                Ok(document)
            }
            None => {
                if original.archive_id.is_none() {
                    return Err(DispatchError::invalid(format!(
                        "copy of {} names neither a dispatch nor an archive record",
                        source_reference
                    )));
                }
                let title = title.ok_or_else(|| {
                    DispatchError::invalid(format!("copy of {} needs a title", source_reference))
                })?;
                let mut document = Document::new(
                    dispatch_id,
                    title,
                    initial_status(SourceKind::CopiedFromArchive, None),
                    SourceKind::CopiedFromArchive,
                    now,
                );
                document.original = Some(original.clone());
                Ok(document)
            }
        }
    }

    async fn derive_title(&self, request: &CreateDispatchRequest) -> Option<String> {
        if let Some(title) = request.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            return Some(title.to_string());
        }
        let proceeding = request.proceeding.as_ref().filter(|p| !p.is_empty())?;
        match self.services.titles.derive_title(proceeding).await {
            Ok(title) => title,
            Err(e) => {
                warn!(error = %e, "Title derivation failed, falling back to the main document title");
                None
            }
        }
    }

    fn check_recipient(request: &CreateDispatchRequest) -> DispatchResult<()> {
        match request.kind {
            DispatchKind::Outbound if request.recipient.is_none() => Err(DispatchError::invalid(
                "an outbound dispatch needs a recipient",
            )),
            DispatchKind::InternalNote => {
                if request
                    .recipient
                    .as_ref()
                    .is_some_and(|r| r.ident != request.subject_ident)
                {
                    return Err(DispatchError::invalid(
                        "a note can only be addressed to its subject",
                    ));
                }
                if request.follow_up.is_some() {
                    return Err(DispatchError::invalid("a note cannot carry a follow-up request"));
                }
                match request.documents.len() {
                    1 => Ok(()),
                    0 => Err(DispatchError::invalid("a note needs exactly one document")),
                    _ => Err(DispatchError::invalid(NOTE_LIMIT)),
                }
            }
            DispatchKind::Outbound => Ok(()),
        }
    }

    /// Create a dispatch, then order its newly produced documents.
    ///
    /// Outbound dispatches without documents start BEING_CREATED.
    #[instrument(skip(self, request, actor), fields(case_number = %request.case_number, kind = %request.kind))]
    pub async fn create_dispatch(
        &self,
        request: CreateDispatchRequest,
        actor: &Actor,
    ) -> DispatchResult<Dispatch> {
        request.validate().map_err(validation)?;
        Self::check_recipient(&request)?;

        let now = Utc::now();
        let id = Uuid::now_v7();
        let mut dispatch = Dispatch {
            id,
            case_number: request.case_number.clone(),
            subject_ident: request.subject_ident.clone(),
            recipient: request.recipient.clone(),
            tema: request.tema,
            kind: request.kind,
            status: if request.documents.is_empty() {
                DispatchStatus::BeingCreated
            } else {
                DispatchStatus::InProduction
            },
            title: self.derive_title(&request).await,
            unit: request.unit.clone(),
            language: request
                .language
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            proceeding: request.proceeding.clone().filter(|p| !p.is_empty()),
            follow_up: request.follow_up.clone().map(FollowUp::from),
            archive_id: None,
            distribution: None,
            created_by: actor.ident.clone(),
            created_at: now,
            updated_by: actor.ident.clone(),
            updated_at: now,
            finalized_at: None,
            aborted_by: None,
            aborted_at: None,
            version: 0,
            documents: vec![],
        };

        for entry in &request.documents {
            let document = self.prepare_document(id, entry, now).await?;
            reject_duplicate(&dispatch, &document)?;
            dispatch.insert_document(document, DocumentRole::Attachment);
        }

        self.repository.insert(&dispatch).await?;
        info!(dispatch_id = %id, documents = dispatch.documents.len(), "Created dispatch");

        let (dispatch, _) = self.gateway.order_documents(&dispatch, None).await?;
        Ok(dispatch)
    }

    /// Merge a full desired document list into the dispatch.
    ///
    /// Listed documents come first in request order. Unlisted documents with
    /// an original are kept after them; unlisted documents without one are purged.
    #[instrument(skip(self, request, actor), fields(dispatch_id = %id))]
    pub async fn update_dispatch(
        &self,
        id: Uuid,
        request: UpdateDispatchRequest,
        actor: &Actor,
    ) -> DispatchResult<Dispatch> {
        request.validate().map_err(validation)?;
        let snapshot = self.load(id).await?;
        require_editable(&snapshot, "UPDATE")?;

        if snapshot.kind == DispatchKind::InternalNote {
            if request.follow_up.is_some() {
                return Err(DispatchError::invalid("a note cannot carry a follow-up request"));
            }
            if request
                .recipient
                .as_ref()
                .is_some_and(|r| r.ident != snapshot.subject_ident)
            {
                return Err(DispatchError::invalid("a note can only be addressed to its subject"));
            }
        }

        let now = Utc::now();
        let entries = request.documents.clone().unwrap_or_default();
        let mut prepared: Vec<Option<Document>> = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.reference.is_some() {
                prepared.push(None);
            } else {
                prepared.push(Some(self.prepare_document(id, entry, now).await?));
            }
        }

        let (saved, new_references) = self
            .mutate(id, |current| {
                require_editable(current, "UPDATE")?;

                if let Some(title) = &request.title {
                    current.title = Some(title.trim().to_string()).filter(|t| !t.is_empty());
                }
                if let Some(recipient) = &request.recipient {
                    current.recipient = Some(recipient.clone());
                }
                if let Some(language) = &request.language {
                    current.language = language.clone();
                }
                if let Some(follow_up) = &request.follow_up {
                    current.follow_up = Some(FollowUp::from(follow_up.clone()));
                }

                let mut new_references = Vec::new();
                if request.documents.is_some() {
                    new_references = Self::merge_documents(current, &entries, &prepared, now)?;
                }
                current.touch(actor, now);
                Ok(new_references)
            })
            .await?;

        if new_references.is_empty() {
            return Ok(saved);
        }
        let (saved, _) = self
            .gateway
            .order_documents(&saved, Some(&new_references))
            .await?;
        Ok(saved)
    }

    /// Apply a requested document list; returns references of added documents
    fn merge_documents(
        current: &mut Dispatch,
        entries: &[DocumentRequest],
        prepared: &[Option<Document>],
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<String>> {
        let dispatch_id = current.id;
        let mut seen: HashSet<String> = HashSet::new();
        let mut order: Vec<Uuid> = Vec::new();
        let mut added: Vec<String> = Vec::new();

        for (entry, new_document) in entries.iter().zip(prepared) {
            match (&entry.reference, new_document) {
                (Some(reference), _) => {
                    if !seen.insert(reference.clone()) {
                        return Err(DispatchError::invalid(format!(
                            "document {} is listed more than once",
                            reference
                        )));
                    }
                    let document = current.document_mut(reference).ok_or_else(|| {
                        DispatchError::invalid(format!(
                            "document {} is not attached to dispatch {}",
                            reference, dispatch_id
                        ))
                    })?;
                    if entry.detach {
                        current.remove_document(reference, now)?;
                        continue;
                    }
                    if let Some(title) = entry.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                        document.title = title.to_string();
                    }
                    order.push(document.id);
                }
                (None, Some(document)) => {
                    let document = document.clone();
                    reject_duplicate(current, &document)?;
                    seen.insert(document.reference.clone());
                    order.push(document.id);
                    added.push(document.reference.clone());
                    current.documents.push(document);
                }
                (None, None) => {
                    return Err(DispatchError::Internal(
                        "document entry was not prepared".to_string(),
                    ));
                }
            }
        }

        let unlisted: Vec<String> = current
            .active_documents()
            .into_iter()
            .filter(|d| !seen.contains(&d.reference) && !d.has_original())
            .map(|d| d.reference.clone())
            .collect();
        for reference in unlisted {
            current.remove_document(&reference, now)?;
        }
        current.reorder(&order);

        let active = current.active_documents().len();
        if active == 0 {
            return Err(DispatchError::invalid(format!(
                "dispatch {} would be left without documents",
                current.id
            )));
        }
        if current.kind == DispatchKind::InternalNote && active > 1 {
            return Err(DispatchError::invalid(NOTE_LIMIT));
        }
        Ok(added)
    }

    /// Add one document; the first document moves a BEING_CREATED dispatch into production
    #[instrument(skip(self, request, actor), fields(dispatch_id = %id, role = %request.role))]
    pub async fn attach_document(
        &self,
        id: Uuid,
        request: AttachDocumentRequest,
        actor: &Actor,
    ) -> DispatchResult<Dispatch> {
        let snapshot = self.load(id).await?;
        if snapshot.kind == DispatchKind::InternalNote {
            return Err(DispatchError::invalid(NOTE_LIMIT));
        }
        if !can_attach(snapshot.status) {
            return Err(DispatchError::transition(
                format!("dispatch {}", id),
                snapshot.status,
                "ATTACH",
            ));
        }

        let now = Utc::now();
        let document = self.prepare_document(id, &request.document, now).await?;
        let reference = document.reference.clone();

        let (saved, ()) = self
            .mutate(id, |current| {
                if !can_attach(current.status) {
                    return Err(DispatchError::transition(
                        format!("dispatch {}", id),
                        current.status,
                        "ATTACH",
                    ));
                }
                reject_duplicate(current, &document)?;
                current.insert_document(document.clone(), request.role);
                if current.status == DispatchStatus::BeingCreated {
                    current.status = DispatchStatus::InProduction;
                }
                current.touch(actor, now);
                Ok(())
            })
            .await?;

        info!(document_reference = %reference, "Attached document");
        let (saved, _) = self
            .gateway
            .order_documents(&saved, Some(std::slice::from_ref(&reference)))
            .await?;
        Ok(saved)
    }

    /// Detach (documents with an original) or purge (all others) one document
    #[instrument(skip(self, actor), fields(dispatch_id = %id))]
    pub async fn detach_document(
        &self,
        id: Uuid,
        reference: &str,
        actor: &Actor,
    ) -> DispatchResult<(Dispatch, DocumentLifecycle)> {
        self.mutate(id, |current| {
            require_editable(current, "DETACH")?;
            if current.document(reference).is_some() && current.active_documents().len() == 1 {
                return Err(DispatchError::invalid(format!(
                    "document {} is the last document of dispatch {}",
                    reference, current.id
                )));
            }
            let now = Utc::now();
            let transition = current.remove_document(reference, now)?;
            current.touch(actor, now);
            Ok(transition)
        })
        .await
    }

    /// Abort an IN_PRODUCTION dispatch; aborting again returns the aborted dispatch
    #[instrument(skip(self, actor), fields(dispatch_id = %id))]
    pub async fn abort_dispatch(&self, id: Uuid, actor: &Actor) -> DispatchResult<Dispatch> {
        let snapshot = self.load(id).await?;
        if snapshot.status == DispatchStatus::Aborted {
            return Ok(snapshot);
        }

        let (saved, ()) = self
            .mutate(id, |current| {
                if current.status == DispatchStatus::Aborted {
                    return Ok(());
                }
                if current.status != DispatchStatus::InProduction {
                    return Err(DispatchError::transition(
                        format!("dispatch {}", id),
                        current.status,
                        DispatchStatus::Aborted,
                    ));
                }
                let now = Utc::now();
                current.status = DispatchStatus::Aborted;
                current.aborted_by = Some(actor.ident.clone());
                current.aborted_at = Some(now);
                for document in current.documents.iter_mut().filter(|d| d.is_active()) {
                    if document.status != DocumentStatus::Finalized {
                        document.set_status(DocumentStatus::Aborted, now);
                    }
                }
                current.touch(actor, now);
                Ok(())
            })
            .await?;

        info!(aborted_by = %actor.ident, "Aborted dispatch");
        Ok(saved)
    }

    /// Delete a dispatch that never got any documents; idempotent
    #[instrument(skip(self, actor), fields(dispatch_id = %id))]
    pub async fn delete_dispatch(&self, id: Uuid, actor: &Actor) -> DispatchResult<Dispatch> {
        let snapshot = self.load(id).await?;
        if snapshot.status == DispatchStatus::Deleted {
            return Ok(snapshot);
        }

        let (saved, ()) = self
            .mutate(id, |current| {
                if current.status == DispatchStatus::Deleted {
                    return Ok(());
                }
                if current.status != DispatchStatus::BeingCreated {
                    return Err(DispatchError::transition(
                        format!("dispatch {}", id),
                        current.status,
                        DispatchStatus::Deleted,
                    ));
                }
                current.status = DispatchStatus::Deleted;
                current.touch(actor, Utc::now());
                Ok(())
            })
            .await?;
        Ok(saved)
    }

    pub async fn list_allowed_deviations(&self, id: Uuid) -> DispatchResult<Vec<Deviation>> {
        Ok(allowed_deviations(&self.load(id).await?))
    }

    pub async fn get_dispatch(&self, id: Uuid) -> DispatchResult<Dispatch> {
        self.load(id).await
    }

    /// Clerk confirmation of a document copied from the archive
    #[instrument(skip(self, actor), fields(dispatch_id = %id))]
    pub async fn confirm_document(
        &self,
        id: Uuid,
        reference: &str,
        actor: &Actor,
    ) -> DispatchResult<Dispatch> {
        let (saved, ()) = self
            .mutate(id, |current| {
                require_editable(current, "CONFIRM_DOCUMENT")?;
                let now = Utc::now();
                let document = current.document_mut(reference).ok_or_else(|| {
                    DispatchError::invalid(format!("document {} is not attached", reference))
                })?;
                match document.status {
                    DocumentStatus::Reviewed => {}
                    DocumentStatus::MustBeReviewed => {
                        document.set_status(DocumentStatus::Reviewed, now)
                    }
                    other => {
                        return Err(DispatchError::transition(
                            format!("document {}", reference),
                            other,
                            DocumentStatus::Reviewed,
                        ));
                    }
                }
                current.touch(actor, now);
                Ok(())
            })
            .await?;
        Ok(saved)
    }

    /// Lock a document's content. A note whose document becomes final is archived.
    #[instrument(skip(self, redaction_metadata, actor), fields(dispatch_id = %id))]
    pub async fn finalize_document(
        &self,
        id: Uuid,
        reference: &str,
        redaction_metadata: Option<serde_json::Value>,
        actor: &Actor,
    ) -> DispatchResult<Dispatch> {
        let (saved, ()) = self
            .mutate(id, |current| {
                require_editable(current, "FINALIZE_DOCUMENT")?;
                let now = Utc::now();
                let document = current.document_mut(reference).ok_or_else(|| {
                    DispatchError::invalid(format!("document {} is not attached", reference))
                })?;
                match document.status {
                    DocumentStatus::Finalized => {}
                    DocumentStatus::UnderEditing | DocumentStatus::Reviewed => {
                        document.set_status(DocumentStatus::Finalized, now);
                    }
                    other => {
                        return Err(DispatchError::transition(
                            format!("document {}", reference),
                            other,
                            DocumentStatus::Finalized,
                        ));
                    }
                }
                if let Some(metadata) = &redaction_metadata {
                    document.redaction_metadata = Some(metadata.clone());
                }
                current.touch(actor, now);
                Ok(())
            })
            .await?;

        if saved.kind == DispatchKind::InternalNote && saved.is_ready_for_archive() {
            self.orchestrator.finalize_and_archive(id, actor).await?;
            return self.load(id).await;
        }
        Ok(saved)
    }
}
