//! Recording fakes of every external collaborator, wired into the services
//! over an in-memory repository.

#![allow(dead_code)]

use async_trait::async_trait;
use domain_dispatch::clients::{
    AddressLookup, ArchiveClient, ArchiveReceipt, ArchiveRecordRequest, ArchivedDocument,
    DispatchEventPublisher, DistributionClient, DistributionReceipt, DistributionRequest,
    DistributionStatus, DocumentOrder, FollowUpSubmission, IntakeClient, ProductionClient,
    ProductionReceipt, TitleDeriver,
};
use domain_dispatch::models::{PostalAddress, ProceedingRef, Recipient, Tema};
use domain_dispatch::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeProduction {
    pub orders: Mutex<Vec<DocumentOrder>>,
    pub fail_orders: AtomicBool,
    pub finished: Mutex<HashSet<String>>,
}

impl FakeProduction {
    pub fn fail(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl ProductionClient for FakeProduction {
    async fn order(&self, order: &DocumentOrder) -> DispatchResult<ProductionReceipt> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(DispatchError::unavailable("production service", "timeout"));
        }
        self.orders.lock().unwrap().push(order.clone());
        Ok(ProductionReceipt {
            external_ref: format!("PROD-{}", order.document_reference),
        })
    }

    async fn is_finished(&self, document_reference: &str) -> DispatchResult<bool> {
        Ok(self.finished.lock().unwrap().contains(document_reference))
    }
}

#[derive(Default)]
pub struct FakeArchive {
    pub requests: Mutex<Vec<ArchiveRecordRequest>>,
}

impl FakeArchive {
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ArchiveClient for FakeArchive {
    async fn create_record(&self, request: &ArchiveRecordRequest) -> DispatchResult<ArchiveReceipt> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let record = requests.len();
        Ok(ArchiveReceipt {
            archive_id: format!("JP-{}", record),
            documents: request
                .documents
                .iter()
                .enumerate()
                .map(|(i, d)| ArchivedDocument {
                    document_reference: d.document_reference.clone(),
                    archive_reference: format!("DOK-{}-{}", record, i),
                })
                .collect(),
        })
    }
}

#[derive(Default)]
pub struct FakeDistribution {
    pub requests: Mutex<Vec<DistributionRequest>>,
    pub statuses: Mutex<HashMap<String, DistributionStatus>>,
}

impl FakeDistribution {
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl DistributionClient for FakeDistribution {
    async fn distribute(&self, request: &DistributionRequest) -> DispatchResult<DistributionReceipt> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(DistributionReceipt {
            order_id: format!("BEST-{}", requests.len()),
            channel: None,
        })
    }

    async fn status(&self, archive_id: &str) -> DispatchResult<Option<DistributionStatus>> {
        Ok(self.statuses.lock().unwrap().get(archive_id).cloned())
    }
}

pub struct FakeTitles;

#[async_trait]
impl TitleDeriver for FakeTitles {
    async fn derive_title(&self, _proceeding: &ProceedingRef) -> DispatchResult<Option<String>> {
        Ok(None)
    }
}

pub struct FakeAddresses;

#[async_trait]
impl AddressLookup for FakeAddresses {
    async fn lookup(&self, _ident: &str) -> DispatchResult<Option<PostalAddress>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct FakeIntake {
    pub submissions: Mutex<Vec<FollowUpSubmission>>,
    pub fail_submissions: AtomicBool,
}

impl FakeIntake {
    pub fn fail(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IntakeClient for FakeIntake {
    async fn submit_follow_up(&self, submission: &FollowUpSubmission) -> DispatchResult<String> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            return Err(DispatchError::unavailable("intake service", "503"));
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(submission.clone());
        Ok(format!("ETT-{}", submissions.len()))
    }
}

#[derive(Default)]
pub struct FakeEvents {
    pub published: Mutex<Vec<DispatchDistributedEvent>>,
}

#[async_trait]
impl DispatchEventPublisher for FakeEvents {
    async fn publish_distributed(&self, event: &DispatchDistributedEvent) -> DispatchResult<()> {
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Every service of the domain over one in-memory repository
pub struct Harness {
    pub repository: Arc<InMemoryDispatchRepository>,
    pub production: Arc<FakeProduction>,
    pub archive: Arc<FakeArchive>,
    pub distribution: Arc<FakeDistribution>,
    pub intake: Arc<FakeIntake>,
    pub events: Arc<FakeEvents>,
    pub assembly: DispatchAssemblyService<InMemoryDispatchRepository>,
    pub orchestrator: Arc<ArchiveOrchestrator<InMemoryDispatchRepository>>,
    pub processor: DocumentStatusProcessor<InMemoryDispatchRepository>,
    pub reconciliation: ReconciliationService<InMemoryDispatchRepository>,
}

impl Harness {
    pub fn new() -> Self {
        let config = DispatchConfig::new("http://localhost:8080");
        let repository = Arc::new(InMemoryDispatchRepository::new());
        let production = Arc::new(FakeProduction::default());
        let archive = Arc::new(FakeArchive::default());
        let distribution = Arc::new(FakeDistribution::default());
        let intake = Arc::new(FakeIntake::default());
        let events = Arc::new(FakeEvents::default());

        let services = ExternalServices {
            production: production.clone(),
            archive: archive.clone(),
            distribution: distribution.clone(),
            titles: Arc::new(FakeTitles),
            addresses: Arc::new(FakeAddresses),
            intake: intake.clone(),
            events: events.clone(),
        };

        let orchestrator = Arc::new(ArchiveOrchestrator::new(
            repository.clone(),
            services.clone(),
            &config,
        ));
        let handler = Arc::new(DocumentEventHandler::new(
            repository.clone(),
            orchestrator.clone(),
            &config,
        ));

        Self {
            assembly: DispatchAssemblyService::new(
                repository.clone(),
                orchestrator.clone(),
                services.clone(),
                &config,
            ),
            processor: DocumentStatusProcessor::new(handler.clone()),
            reconciliation: ReconciliationService::new(
                repository.clone(),
                handler,
                orchestrator.clone(),
                &services,
                &config,
            ),
            orchestrator,
            repository,
            production,
            archive,
            distribution,
            intake,
            events,
        }
    }

    pub async fn stored(&self, id: uuid::Uuid) -> Dispatch {
        self.repository.get(id).await.unwrap().unwrap()
    }
}

pub fn clerk() -> Actor {
    Actor::new("Z990001")
}

pub fn request(kind: DispatchKind, documents: Vec<DocumentRequest>) -> CreateDispatchRequest {
    CreateDispatchRequest {
        case_number: "2400117".into(),
        subject_ident: "01018012345".into(),
        recipient: Some(Recipient::new("01018012345")),
        kind,
        tema: Tema::Far,
        unit: "4833".into(),
        language: None,
        title: None,
        proceeding: None,
        follow_up: None,
        documents,
    }
}

pub fn archive_copy(title: &str, reference: &str) -> DocumentRequest {
    DocumentRequest {
        title: Some(title.into()),
        original: Some(domain_dispatch::models::OriginalReference {
            dispatch_id: None,
            archive_id: Some("JP-OLD".into()),
            document_reference: Some(reference.into()),
        }),
        ..Default::default()
    }
}

pub fn status_event(reference: &str, status: ProductionEventStatus) -> DocumentStatusEvent {
    DocumentStatusEvent {
        document_reference: reference.to_string(),
        status,
        source_system: Some("production".into()),
    }
}
