//! Dispatch Worker Service
//!
//! Background process keeping dispatches in step with the external services.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (dispatch:document-status)
//!   ↓ (Consumer Group: dispatch_workers)
//! StreamWorker<DocumentStatusEvent, DocumentStatusProcessor>
//!   ↓ (status fan-out, note archiving)
//! DocumentEventHandler ──→ ArchiveOrchestrator ──→ archive service
//!   ↓
//! PostgreSQL (dispatches, dispatch_documents)
//!   ↑
//! ReconciliationService (cron: retry orders, promote documents, distribution)
//!   ↓
//! Redis Stream (dispatch:distributed)
//! ```

pub mod scheduler;

use core_config::FromEnv;
use database::{
    postgres::{PostgresConfig, connect_from_config_with_retry, run_migrations},
    redis::{ConnectionManager, RedisConfig},
};
use domain_dispatch::{
    ArchiveOrchestrator, DispatchConfig, DocumentEventHandler, DocumentStatusEvent,
    DocumentStatusProcessor, DocumentStatusStream, ExternalServices, JobReport,
    PgDispatchRepository, ReconciliationJob, ReconciliationService, StreamEventPublisher,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use stream_worker::{StreamWorker, WorkerConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::scheduler::{ScheduleConfig, run_schedules};

/// Connected services shared by the consumer and the schedules
pub struct DispatchWorker {
    redis: ConnectionManager,
    processor: Arc<DocumentStatusProcessor<PgDispatchRepository>>,
    reconciliation: Arc<ReconciliationService<PgDispatchRepository>>,
    schedules: ScheduleConfig,
}

impl DispatchWorker {
    /// Load configuration from the environment and connect to PostgreSQL and Redis
    pub async fn connect(migrate: bool) -> Result<Self> {
        let dispatch_config =
            DispatchConfig::from_env().wrap_err("Failed to load dispatch configuration")?;
        let schedules =
            ScheduleConfig::from_env().wrap_err("Failed to load schedule configuration")?;
        let pg_config =
            PostgresConfig::from_env().wrap_err("Failed to load PostgreSQL configuration")?;
        let redis_config =
            RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

        info!("Connecting to PostgreSQL...");
        let db = connect_from_config_with_retry(pg_config, None)
            .await
            .wrap_err("Failed to connect to PostgreSQL")?;
        if migrate {
            run_migrations::<migration::Migrator>(&db, "dispatch-worker")
                .await
                .wrap_err("Failed to run migrations")?;
        }

        info!("Connecting to Redis...");
        let redis = database::redis::connect_with_retry(&redis_config.url, None)
            .await
            .wrap_err("Failed to connect to Redis")?;

        let repository = Arc::new(PgDispatchRepository::new(db));
        let publisher = Arc::new(StreamEventPublisher::new(redis.clone()));
        let services = ExternalServices::http(&dispatch_config, publisher)
            .wrap_err("Failed to build service clients")?;

        let orchestrator = Arc::new(ArchiveOrchestrator::new(
            repository.clone(),
            services.clone(),
            &dispatch_config,
        ));
        let handler = Arc::new(DocumentEventHandler::new(
            repository.clone(),
            orchestrator.clone(),
            &dispatch_config,
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            repository,
            handler.clone(),
            orchestrator,
            &services,
            &dispatch_config,
        ));

        Ok(Self {
            redis,
            processor: Arc::new(DocumentStatusProcessor::new(handler)),
            reconciliation,
            schedules,
        })
    }

    /// Consume document status events until shutdown
    pub async fn consume(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let worker_config = WorkerConfig::from_stream_def::<DocumentStatusStream>()
            .with_block_timeout_ms(1_000);
        info!(
            stream = %worker_config.stream_name,
            consumer_group = %worker_config.consumer_group,
            consumer_id = %worker_config.consumer_id,
            max_retries = worker_config.max_retries,
            "Starting document status consumer"
        );

        let worker = StreamWorker::<DocumentStatusEvent, _>::new(
            self.redis.clone(),
            self.processor.clone(),
            worker_config,
        );
        worker
            .run(shutdown)
            .await
            .map_err(|e| eyre::eyre!("Document status consumer failed: {}", e))
    }

    pub async fn schedule(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        run_schedules(self.reconciliation.clone(), &self.schedules, shutdown).await
    }

    /// Consumer and schedules side by side; either failing stops both
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::try_join!(self.consume(shutdown.clone()), self.schedule(shutdown))?;
        Ok(())
    }

    pub async fn reconcile(&self, job: ReconciliationJob) -> Result<JobReport> {
        self.reconciliation
            .run(job, chrono::Utc::now())
            .await
            .wrap_err_with(|| format!("Reconciliation job {} failed", job))
    }
}

/// Receiver that flips to `true` on SIGINT or SIGTERM
pub fn shutdown_channel() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
