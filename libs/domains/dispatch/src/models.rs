use chrono::{DateTime, Utc};
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Prefix of every document reference minted by this service
pub const DOCUMENT_REFERENCE_PREFIX: &str = "BIF";

/// Production and review progress of a single document
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    #[sea_orm(string_value = "NOT_ORDERED")]
    NotOrdered,
    #[sea_orm(string_value = "IN_PRODUCTION")]
    InProduction,
    #[sea_orm(string_value = "ORDER_FAILED")]
    OrderFailed,
    #[sea_orm(string_value = "UNDER_EDITING")]
    UnderEditing,
    /// Copied from the archive; a clerk has to look at it before it can be finalized
    #[sea_orm(string_value = "MUST_BE_REVIEWED")]
    MustBeReviewed,
    #[sea_orm(string_value = "REVIEWED")]
    Reviewed,
    #[sea_orm(string_value = "FINALIZED")]
    Finalized,
    #[sea_orm(string_value = "ABORTED")]
    Aborted,
}

/// Coarse status shown to callers outside this service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum VisibleDocumentStatus {
    InProduction,
    Failed,
    Editing,
    Finalized,
    Aborted,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    /// Outbound dispatch created without documents
    #[sea_orm(string_value = "BEING_CREATED")]
    BeingCreated,
    #[sea_orm(string_value = "IN_PRODUCTION")]
    InProduction,
    #[sea_orm(string_value = "FINALIZED")]
    Finalized,
    #[sea_orm(string_value = "DISTRIBUTED")]
    Distributed,
    #[sea_orm(string_value = "DISTRIBUTED_LOCALLY")]
    DistributedLocally,
    #[sea_orm(string_value = "ABORTED")]
    Aborted,
    #[sea_orm(string_value = "DELETED")]
    Deleted,
}

impl DispatchStatus {
    pub fn is_distributed(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Distributed | DispatchStatus::DistributedLocally
        )
    }

    /// Archived, with or without distribution
    pub fn is_archived(&self) -> bool {
        matches!(self, DispatchStatus::Finalized) || self.is_distributed()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchKind {
    #[sea_orm(string_value = "OUTBOUND")]
    Outbound,
    /// Never sent anywhere; archived as soon as its single document is final
    #[sea_orm(string_value = "INTERNAL_NOTE")]
    InternalNote,
}

/// Subject area
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Tema {
    #[sea_orm(string_value = "BID")]
    Bid,
    #[sea_orm(string_value = "FAR")]
    Far,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    Default,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentRole {
    #[sea_orm(string_value = "MAIN")]
    Main,
    #[default]
    #[sea_orm(string_value = "ATTACHMENT")]
    Attachment,
}

/// Where a document's content comes from
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    /// Ordered from the production service
    #[sea_orm(string_value = "PRODUCED")]
    Produced,
    #[sea_orm(string_value = "COPIED_FROM_DISPATCH")]
    CopiedFromDispatch,
    #[sea_orm(string_value = "COPIED_FROM_ARCHIVE")]
    CopiedFromArchive,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributionChannel {
    #[sea_orm(string_value = "PRINT")]
    Print,
    #[sea_orm(string_value = "DIGITAL")]
    Digital,
    #[sea_orm(string_value = "LOCAL_PRINT")]
    LocalPrint,
}

/// Named actions outside the normal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Deviation {
    Abort,
    Delete,
    DistributeLocally,
}

/// Presence of a document outside its dispatch's active set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentLifecycle {
    Active,
    /// Soft-deleted; the row stays for audit
    Detached,
    /// Removed from storage
    Purged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PostalAddress {
    #[validate(length(min = 1))]
    pub line1: String,
    pub line2: Option<String>,
    pub line3: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    /// ISO 3166 alpha-2
    #[validate(length(equal = 2))]
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[validate(length(min = 1))]
    pub ident: String,
    pub name: Option<String>,
    #[validate(nested)]
    pub address: Option<PostalAddress>,
}

impl Recipient {
    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            name: None,
            address: None,
        }
    }
}

/// Case-treatment and decision the dispatch belongs to; drives title derivation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceedingRef {
    pub treatment_id: Option<String>,
    pub decision_id: Option<String>,
}

impl ProceedingRef {
    pub fn is_empty(&self) -> bool {
        self.treatment_id.is_none() && self.decision_id.is_none()
    }
}

/// Request for the recipient to send in additional attachments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUp {
    pub title: String,
    pub due_in_days: u32,
    pub attachment_codes: Vec<String>,
    /// Set once the intake service accepted it
    pub submission_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpRequest {
    #[validate(length(min = 1))]
    pub title: String,
    #[validate(range(min = 1, max = 365))]
    pub due_in_days: u32,
    #[serde(default)]
    pub attachment_codes: Vec<String>,
}

impl From<FollowUpRequest> for FollowUp {
    fn from(request: FollowUpRequest) -> Self {
        Self {
            title: request.title,
            due_in_days: request.due_in_days,
            attachment_codes: request.attachment_codes,
            submission_id: None,
            submitted_at: None,
        }
    }
}

/// Link to the document a copy was taken from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalReference {
    pub dispatch_id: Option<Uuid>,
    pub archive_id: Option<String>,
    pub document_reference: Option<String>,
}

impl OriginalReference {
    pub fn source_kind(&self) -> SourceKind {
        if self.dispatch_id.is_some() {
            SourceKind::CopiedFromDispatch
        } else {
            SourceKind::CopiedFromArchive
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionInfo {
    /// Order id assigned by the distribution service
    pub order_id: Option<String>,
    pub channel: DistributionChannel,
    pub distributed_by: String,
    pub distributed_at: DateTime<Utc>,
    pub batch_id: Option<String>,
    /// Delivery confirmed by the distribution service
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set once the distributed event is on the stream
    #[serde(default)]
    pub event_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub dispatch_id: Uuid,
    /// Own reference, `BIF` followed by the id
    pub reference: String,
    pub title: String,
    pub role: DocumentRole,
    pub status: DocumentStatus,
    pub source: SourceKind,
    pub template_code: Option<String>,
    pub original: Option<OriginalReference>,
    /// Reference inside the archive record, once archived
    pub archive_reference: Option<String>,
    /// Identifier returned by the production service
    pub production_ref: Option<String>,
    pub index: i32,
    pub redaction_metadata: Option<serde_json::Value>,
    pub status_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(
        dispatch_id: Uuid,
        title: impl Into<String>,
        status: DocumentStatus,
        source: SourceKind,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            dispatch_id,
            reference: format!("{}{}", DOCUMENT_REFERENCE_PREFIX, id.simple()),
            title: title.into(),
            role: DocumentRole::Attachment,
            status,
            source,
            template_code: None,
            original: None,
            archive_reference: None,
            production_ref: None,
            index: i32::MAX,
            redaction_metadata: None,
            status_changed_at: now,
            created_at: now,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn lifecycle(&self) -> DocumentLifecycle {
        if self.is_active() {
            DocumentLifecycle::Active
        } else {
            DocumentLifecycle::Detached
        }
    }

    pub fn has_original(&self) -> bool {
        self.original.is_some()
    }

    /// Key production events are published under: the original's reference
    /// for copies, the own reference otherwise
    pub fn production_key(&self) -> &str {
        self.original
            .as_ref()
            .and_then(|o| o.document_reference.as_deref())
            .unwrap_or(&self.reference)
    }

    /// Matches a production event key either directly or through the original
    pub fn answers_to(&self, key: &str) -> bool {
        self.reference == key
            || self
                .original
                .as_ref()
                .and_then(|o| o.document_reference.as_deref())
                == Some(key)
    }

    pub fn set_status(&mut self, status: DocumentStatus, now: DateTime<Utc>) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = now;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub id: Uuid,
    pub case_number: String,
    pub subject_ident: String,
    pub recipient: Option<Recipient>,
    pub tema: Tema,
    pub kind: DispatchKind,
    pub status: DispatchStatus,
    pub title: Option<String>,
    pub unit: String,
    pub language: String,
    pub proceeding: Option<ProceedingRef>,
    pub follow_up: Option<FollowUp>,
    pub archive_id: Option<String>,
    pub distribution: Option<DistributionInfo>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub aborted_by: Option<String>,
    pub aborted_at: Option<DateTime<Utc>>,
    /// Optimistic lock, bumped on every save
    pub version: i64,
    /// Active and detached documents; purged ones are gone
    pub documents: Vec<Document>,
}

impl Dispatch {
    /// Active documents ordered by index
    pub fn active_documents(&self) -> Vec<&Document> {
        let mut active: Vec<&Document> = self.documents.iter().filter(|d| d.is_active()).collect();
        active.sort_by_key(|d| d.index);
        active
    }

    pub fn main_document(&self) -> Option<&Document> {
        self.active_documents()
            .into_iter()
            .find(|d| d.role == DocumentRole::Main)
    }

    pub fn document(&self, reference: &str) -> Option<&Document> {
        self.documents
            .iter()
            .find(|d| d.is_active() && d.reference == reference)
    }

    pub fn document_mut(&mut self, reference: &str) -> Option<&mut Document> {
        self.documents
            .iter_mut()
            .find(|d| d.is_active() && d.reference == reference)
    }

    /// Explicit title, falling back to the main document's
    pub fn effective_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .or_else(|| self.main_document().map(|d| d.title.as_str()))
    }

    pub fn touch(&mut self, actor: &Actor, now: DateTime<Utc>) {
        self.updated_by = actor.ident.clone();
        self.updated_at = now;
    }
}

/// Who performs an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub ident: String,
    pub name: Option<String>,
}

impl Actor {
    pub const SYSTEM_IDENT: &'static str = "dispatch-orchestrator";

    pub fn new(ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            name: None,
        }
    }

    /// Background jobs and event-triggered transitions
    pub fn system() -> Self {
        Self::new(Self::SYSTEM_IDENT)
    }
}

/// One entry of a create/update/attach request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    /// Own reference of an already attached document (updates only)
    pub reference: Option<String>,
    pub title: Option<String>,
    pub template_code: Option<String>,
    /// Set for copies; absent for newly produced documents
    pub original: Option<OriginalReference>,
    /// Remove the referenced document instead of keeping it
    #[serde(default)]
    pub detach: bool,
}

impl DocumentRequest {
    pub fn produced(title: impl Into<String>, template_code: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            template_code: Some(template_code.into()),
            ..Default::default()
        }
    }

    pub fn existing(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateDispatchRequest {
    #[validate(length(min = 1, message = "case number is required"))]
    pub case_number: String,
    #[validate(length(min = 1, message = "subject is required"))]
    pub subject_ident: String,
    #[validate(nested)]
    pub recipient: Option<Recipient>,
    pub kind: DispatchKind,
    pub tema: Tema,
    #[validate(length(min = 1, message = "unit is required"))]
    pub unit: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub proceeding: Option<ProceedingRef>,
    #[validate(nested)]
    pub follow_up: Option<FollowUpRequest>,
    #[serde(default)]
    pub documents: Vec<DocumentRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDispatchRequest {
    pub title: Option<String>,
    #[validate(nested)]
    pub recipient: Option<Recipient>,
    pub language: Option<String>,
    #[validate(nested)]
    pub follow_up: Option<FollowUpRequest>,
    /// Full desired document list; `None` leaves documents untouched
    pub documents: Option<Vec<DocumentRequest>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDocumentRequest {
    pub document: DocumentRequest,
    #[serde(default)]
    pub role: DocumentRole,
}

/// Caller choices for `distribute`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeRequest {
    pub address_override: Option<PostalAddress>,
    pub batch_id: Option<String>,
    #[serde(default)]
    pub local_print: bool,
}
