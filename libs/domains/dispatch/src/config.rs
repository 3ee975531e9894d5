use chrono::Duration as ChronoDuration;
use core_config::{ConfigError, FromEnv, env_parse, env_required};
use database::RetryConfig;
use std::time::Duration;

/// Base URLs of the external services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    pub production: String,
    pub archive: String,
    pub distribution: String,
    pub title: String,
    pub address: String,
    pub intake: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub urls: ServiceUrls,
    pub external_timeout_secs: u64,
    pub external_max_retries: u32,
    pub external_initial_backoff_ms: u64,
    pub external_max_backoff_ms: u64,
    /// Documents older than this are checked against the production service
    pub stuck_document_threshold_hours: i64,
    /// FINALIZED dispatches older than this are polled for distribution status
    pub finalized_distribution_threshold_hours: i64,
    pub distribution_reconcile_page_size: u64,
    /// Optimistic-lock attempts per aggregate mutation
    pub mutation_max_attempts: u32,
}

impl DispatchConfig {
    /// Defaults with every service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        Self {
            urls: ServiceUrls {
                production: base.clone(),
                archive: base.clone(),
                distribution: base.clone(),
                title: base.clone(),
                address: base.clone(),
                intake: base,
            },
            external_timeout_secs: 10,
            external_max_retries: 3,
            external_initial_backoff_ms: 200,
            external_max_backoff_ms: 5_000,
            stuck_document_threshold_hours: 12,
            finalized_distribution_threshold_hours: 2,
            distribution_reconcile_page_size: 100,
            mutation_max_attempts: 3,
        }
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    /// Backoff applied uniformly to every external call
    pub fn retry_policy(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(self.external_max_retries)
            .with_initial_delay(self.external_initial_backoff_ms)
            .with_max_delay(self.external_max_backoff_ms)
    }

    pub fn stuck_document_threshold(&self) -> ChronoDuration {
        ChronoDuration::hours(self.stuck_document_threshold_hours)
    }

    pub fn finalized_distribution_threshold(&self) -> ChronoDuration {
        ChronoDuration::hours(self.finalized_distribution_threshold_hours)
    }
}

fn url(key: &str) -> Result<String, ConfigError> {
    let value = env_required(key)?;
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            details: "expected an http(s) URL".to_string(),
        });
    }
    Ok(value.trim_end_matches('/').to_string())
}

impl FromEnv for DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new("http://localhost");
        let config = Self {
            urls: ServiceUrls {
                production: url("PRODUCTION_SERVICE_URL")?,
                archive: url("ARCHIVE_SERVICE_URL")?,
                distribution: url("DISTRIBUTION_SERVICE_URL")?,
                title: url("TITLE_SERVICE_URL")?,
                address: url("ADDRESS_SERVICE_URL")?,
                intake: url("INTAKE_SERVICE_URL")?,
            },
            external_timeout_secs: env_parse(
                "EXTERNAL_TIMEOUT_SECS",
                defaults.external_timeout_secs,
            )?,
            external_max_retries: env_parse("EXTERNAL_MAX_RETRIES", defaults.external_max_retries)?,
            external_initial_backoff_ms: env_parse(
                "EXTERNAL_INITIAL_BACKOFF_MS",
                defaults.external_initial_backoff_ms,
            )?,
            external_max_backoff_ms: env_parse(
                "EXTERNAL_MAX_BACKOFF_MS",
                defaults.external_max_backoff_ms,
            )?,
            stuck_document_threshold_hours: env_parse(
                "STUCK_DOCUMENT_THRESHOLD_HOURS",
                defaults.stuck_document_threshold_hours,
            )?,
            finalized_distribution_threshold_hours: env_parse(
                "FINALIZED_DISTRIBUTION_THRESHOLD_HOURS",
                defaults.finalized_distribution_threshold_hours,
            )?,
            distribution_reconcile_page_size: env_parse(
                "DISTRIBUTION_RECONCILE_PAGE_SIZE",
                defaults.distribution_reconcile_page_size,
            )?,
            mutation_max_attempts: env_parse(
                "MUTATION_MAX_ATTEMPTS",
                defaults.mutation_max_attempts,
            )?,
        };

        if config.distribution_reconcile_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISTRIBUTION_RECONCILE_PAGE_SIZE".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}
