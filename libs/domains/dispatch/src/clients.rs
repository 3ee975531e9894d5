//! Contracts of the external services the orchestrator talks to.
//!
//! HTTP implementations live in [`crate::http`]; tests use mocks or fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::DispatchResult;
use crate::events::DispatchDistributedEvent;
use crate::models::{DistributionChannel, PostalAddress, ProceedingRef, Tema};

/// Request to produce one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentOrder {
    /// Key the production service publishes status events under
    pub document_reference: String,
    pub dispatch_id: Uuid,
    pub template_code: Option<String>,
    pub title: String,
    pub case_number: String,
    pub subject_ident: String,
    pub recipient_ident: Option<String>,
    pub language: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionReceipt {
    pub external_ref: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductionClient: Send + Sync {
    async fn order(&self, order: &DocumentOrder) -> DispatchResult<ProductionReceipt>;

    async fn is_finished(&self, document_reference: &str) -> DispatchResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveDocument {
    pub document_reference: String,
    pub title: String,
    pub role: crate::models::DocumentRole,
    /// Existing archive document this one was copied from
    pub original_archive_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecordRequest {
    /// Stable per dispatch so the archive can detect repeated submissions
    pub correlation_id: String,
    pub title: String,
    pub case_number: String,
    pub subject_ident: String,
    pub recipient_ident: Option<String>,
    pub recipient_name: Option<String>,
    pub tema: Tema,
    pub unit: String,
    pub outbound: bool,
    pub documents: Vec<ArchiveDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedDocument {
    pub document_reference: String,
    pub archive_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReceipt {
    pub archive_id: String,
    #[serde(default)]
    pub documents: Vec<ArchivedDocument>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn create_record(&self, request: &ArchiveRecordRequest)
    -> DispatchResult<ArchiveReceipt>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRequest {
    pub archive_id: String,
    pub recipient_ident: Option<String>,
    pub address: Option<PostalAddress>,
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReceipt {
    pub order_id: String,
    pub channel: Option<DistributionChannel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStatus {
    pub order_id: Option<String>,
    pub channel: Option<DistributionChannel>,
    pub delivered: bool,
    pub distributed_at: Option<DateTime<Utc>>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DistributionClient: Send + Sync {
    async fn distribute(&self, request: &DistributionRequest)
    -> DispatchResult<DistributionReceipt>;

    /// `None` while the distribution service knows nothing about the record
    async fn status(&self, archive_id: &str) -> DispatchResult<Option<DistributionStatus>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TitleDeriver: Send + Sync {
    async fn derive_title(&self, proceeding: &ProceedingRef) -> DispatchResult<Option<String>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AddressLookup: Send + Sync {
    async fn lookup(&self, ident: &str) -> DispatchResult<Option<PostalAddress>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpSubmission {
    pub dispatch_id: Uuid,
    pub archive_id: String,
    pub subject_ident: String,
    pub tema: Tema,
    pub title: String,
    pub due_date: chrono::NaiveDate,
    pub attachment_codes: Vec<String>,
}

/// Intake service receiving follow-up attachment requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IntakeClient: Send + Sync {
    /// Returns the intake service's id for the request
    async fn submit_follow_up(&self, submission: &FollowUpSubmission) -> DispatchResult<String>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DispatchEventPublisher: Send + Sync {
    async fn publish_distributed(&self, event: &DispatchDistributedEvent) -> DispatchResult<()>;
}

/// Every external collaborator, injected into the services as one bundle
#[derive(Clone)]
pub struct ExternalServices {
    pub production: Arc<dyn ProductionClient>,
    pub archive: Arc<dyn ArchiveClient>,
    pub distribution: Arc<dyn DistributionClient>,
    pub titles: Arc<dyn TitleDeriver>,
    pub addresses: Arc<dyn AddressLookup>,
    pub intake: Arc<dyn IntakeClient>,
    pub events: Arc<dyn DispatchEventPublisher>,
}
