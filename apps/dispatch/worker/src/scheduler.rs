//! Cron schedules for the reconciliation jobs

use chrono::Utc;
use core_config::{ConfigError, FromEnv, env_or_default};
use domain_dispatch::{PgDispatchRepository, ReconciliationJob, ReconciliationService};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Six-field cron expressions (seconds first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub retry_orders: String,
    pub promote_documents: String,
    pub reconcile_distribution: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            retry_orders: "0 */10 * * * *".to_string(),
            promote_documents: "0 0 * * * *".to_string(),
            reconcile_distribution: "0 */15 * * * *".to_string(),
        }
    }
}

impl FromEnv for ScheduleConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            retry_orders: env_or_default("RETRY_ORDERS_CRON", &defaults.retry_orders),
            promote_documents: env_or_default("PROMOTE_DOCUMENTS_CRON", &defaults.promote_documents),
            reconcile_distribution: env_or_default(
                "RECONCILE_DISTRIBUTION_CRON",
                &defaults.reconcile_distribution,
            ),
        };
        for (key, expr) in [
            ("RETRY_ORDERS_CRON", &config.retry_orders),
            ("PROMOTE_DOCUMENTS_CRON", &config.promote_documents),
            ("RECONCILE_DISTRIBUTION_CRON", &config.reconcile_distribution),
        ] {
            if expr.split_whitespace().count() != 6 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    details: format!("expected six cron fields, got '{}'", expr),
                });
            }
        }
        Ok(config)
    }
}

impl ScheduleConfig {
    fn jobs(&self) -> [(ReconciliationJob, &str); 3] {
        [
            (ReconciliationJob::RetryOrders, self.retry_orders.as_str()),
            (ReconciliationJob::PromoteDocuments, self.promote_documents.as_str()),
            (ReconciliationJob::Distribution, self.reconcile_distribution.as_str()),
        ]
    }
}

fn reconciliation_job(
    service: Arc<ReconciliationService<PgDispatchRepository>>,
    job: ReconciliationJob,
    cron: &str,
) -> Result<Job> {
    // A run still in progress makes the next tick a no-op
    let running = Arc::new(Mutex::new(()));

    Job::new_async(cron, move |_uuid, _lock| {
        let service = service.clone();
        let running = running.clone();

        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!(job = %job, "Previous run still in progress, skipping");
                return;
            };
            if let Err(e) = service.run(job, Utc::now()).await {
                error!(job = %job, error = %e, "Reconciliation job failed");
            }
        })
    })
    .wrap_err_with(|| format!("Invalid schedule '{}' for {}", cron, job))
}

/// Run the reconciliation jobs on their schedules until shutdown
pub async fn run_schedules(
    service: Arc<ReconciliationService<PgDispatchRepository>>,
    config: &ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut scheduler = JobScheduler::new()
        .await
        .wrap_err("Failed to create job scheduler")?;

    for (job, cron) in config.jobs() {
        scheduler
            .add(reconciliation_job(service.clone(), job, cron)?)
            .await
            .wrap_err_with(|| format!("Failed to schedule {}", job))?;
        info!(job = %job, cron = %cron, "Scheduled reconciliation job");
    }

    scheduler.start().await.wrap_err("Failed to start job scheduler")?;

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("Stopping reconciliation schedules");
    scheduler
        .shutdown()
        .await
        .wrap_err("Failed to stop job scheduler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        temp_env::with_vars_unset(
            [
                "RETRY_ORDERS_CRON",
                "PROMOTE_DOCUMENTS_CRON",
                "RECONCILE_DISTRIBUTION_CRON",
            ],
            || {
                let config = ScheduleConfig::from_env().unwrap();
                assert_eq!(config, ScheduleConfig::default());
                assert_eq!(config.retry_orders, "0 */10 * * * *");
            },
        );
    }

    #[test]
    fn test_schedule_override() {
        temp_env::with_var("PROMOTE_DOCUMENTS_CRON", Some("0 30 */2 * * *"), || {
            let config = ScheduleConfig::from_env().unwrap();
            assert_eq!(config.promote_documents, "0 30 */2 * * *");
        });
    }

    #[test]
    fn test_five_field_cron_is_rejected() {
        temp_env::with_var("RETRY_ORDERS_CRON", Some("*/10 * * * *"), || {
            let err = ScheduleConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("RETRY_ORDERS_CRON"));
        });
    }
}
