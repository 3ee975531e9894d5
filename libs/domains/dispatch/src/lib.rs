//! Dispatch Domain
//!
//! Lifecycle of outbound letters and internal notes ("dispatches") and their
//! documents: assembly, production ordering, archiving, distribution, and
//! reconciliation with the external services involved.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ┌──────────────┐  ┌────────────────┐
//! │   Assembly   │  │ Event stream │  │ Reconciliation │
//! └──────┬───────┘  └──────┬───────┘  └───────┬────────┘
//!        │                 │                  │
//! ┌──────▼─────────────────▼──────────────────▼───────┐
//! │  Production gateway  ·  Archive orchestrator      │  ← external calls
//! └──────────────────────┬────────────────────────────┘
//!                        │
//! ┌──────────────────────▼────────────────────────────┐
//! │  State machine  ·  Repository (optimistic lock)   │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_dispatch::{
//!     ArchiveOrchestrator, DispatchAssemblyService, DispatchConfig, ExternalServices,
//!     PgDispatchRepository, StreamEventPublisher,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     db: sea_orm::DatabaseConnection,
//! #     redis: redis::aio::ConnectionManager,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatchConfig::new("http://localhost:8080");
//! let repository = Arc::new(PgDispatchRepository::new(db));
//! let services = ExternalServices::http(&config, Arc::new(StreamEventPublisher::new(redis)))?;
//!
//! let orchestrator = Arc::new(ArchiveOrchestrator::new(repository.clone(), services.clone(), &config));
//! let assembly = DispatchAssemblyService::new(repository, orchestrator, services, &config);
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod clients;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod postgres;
pub mod processor;
pub mod production;
pub mod repository;
pub mod scheduler;
pub mod state_machine;

// Re-export commonly used types
pub use assembly::DispatchAssemblyService;
pub use clients::{
    AddressLookup, ArchiveClient, DispatchEventPublisher, DistributionClient, ExternalServices,
    IntakeClient, ProductionClient, TitleDeriver,
};
pub use config::{DispatchConfig, ServiceUrls};
pub use error::{DispatchError, DispatchResult};
pub use events::{
    DispatchDistributedEvent, DispatchDistributedStream, DocumentEventHandler,
    DocumentStatusEvent, DocumentStatusStream, EventOutcome, ProductionEventStatus,
    StreamEventPublisher,
};
pub use models::{
    Actor, AttachDocumentRequest, CreateDispatchRequest, Deviation, DistributeRequest, Dispatch,
    DispatchKind, DispatchStatus, Document, DocumentRequest, DocumentRole, DocumentStatus,
    UpdateDispatchRequest,
};
pub use orchestrator::{ArchiveOrchestrator, DistributionOutcome};
pub use postgres::PgDispatchRepository;
pub use processor::DocumentStatusProcessor;
pub use production::{OrderSummary, ProductionGateway};
pub use repository::{DispatchRepository, InMemoryDispatchRepository, mutate_dispatch};
pub use scheduler::{JobReport, ReconciliationJob, ReconciliationService};
