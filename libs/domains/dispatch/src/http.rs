//! reqwest implementations of the collaborator traits.
//!
//! Every call carries the configured timeout and goes through the shared
//! retry-with-backoff policy. Only `ExternalServiceUnavailable` is retried.

use async_trait::async_trait;
use database::{RetryConfig, retry_with_backoff_if};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clients::{
    AddressLookup, ArchiveClient, ArchiveReceipt, ArchiveRecordRequest, DispatchEventPublisher,
    DistributionClient, DistributionReceipt, DistributionRequest, DistributionStatus,
    DocumentOrder, ExternalServices, FollowUpSubmission, IntakeClient, ProductionClient,
    ProductionReceipt, TitleDeriver,
};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{PostalAddress, ProceedingRef};

pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Map a non-success response to the error taxonomy
pub fn classify_status(service: &str, status: StatusCode, body: String) -> DispatchError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        DispatchError::unavailable(service, format!("status {}: {}", status.as_u16(), body))
    } else {
        DispatchError::ExternalRejected {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        }
    }
}

fn transport_error(service: &str, err: reqwest::Error) -> DispatchError {
    if err.is_decode() {
        DispatchError::Internal(format!("{} returned an unreadable body: {}", service, err))
    } else {
        // timeouts, refused connections, resets
        DispatchError::unavailable(service, err)
    }
}

/// JSON-over-HTTP client for one external service
#[derive(Clone)]
pub struct ServiceClient {
    http: Client,
    service: &'static str,
    base_url: String,
    retry: RetryConfig,
}

impl ServiceClient {
    pub fn new(
        service: &'static str,
        base_url: impl Into<String>,
        config: &DispatchConfig,
    ) -> DispatchResult<Self> {
        let http = Client::builder()
            .timeout(config.external_timeout())
            .build()
            .map_err(|e| DispatchError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            service,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: config.retry_policy(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `Ok(None)` for 404 responses
    async fn send_once<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> DispatchResult<Option<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(self.service, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(self.service, status, body));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| transport_error(self.service, e))
    }

    async fn call<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: &[(&str, &str)],
    ) -> DispatchResult<Option<T>>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        retry_with_backoff_if(
            || {
                let mut request = self.http.request(method.clone(), &url);
                for (name, value) in headers {
                    request = request.header(*name, *value);
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                self.send_once(request)
            },
            &self.retry,
            |e: &DispatchError| matches!(e, DispatchError::ExternalServiceUnavailable { .. }),
        )
        .await
    }

    fn not_found(&self, path: &str) -> DispatchError {
        DispatchError::ExternalRejected {
            service: self.service.to_string(),
            status: StatusCode::NOT_FOUND.as_u16(),
            body: format!("{} not found", path),
        }
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> DispatchResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.call(Method::POST, path, Some(body), &[])
            .await?
            .ok_or_else(|| self.not_found(path))
    }

    pub async fn post_with_headers<B, T>(
        &self,
        path: &str,
        body: &B,
        headers: &[(&str, &str)],
    ) -> DispatchResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.call(Method::POST, path, Some(body), headers)
            .await?
            .ok_or_else(|| self.not_found(path))
    }

    pub async fn post_optional<B, T>(&self, path: &str, body: &B) -> DispatchResult<Option<T>>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.call(Method::POST, path, Some(body), &[]).await
    }

    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> DispatchResult<Option<T>> {
        self.call::<(), T>(Method::GET, path, None, &[]).await
    }
}

pub struct HttpProductionClient {
    client: ServiceClient,
}

impl HttpProductionClient {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: ServiceClient::new("production service", &config.urls.production, config)?,
        })
    }
}

#[derive(Deserialize)]
struct ProductionState {
    finished: bool,
}

#[async_trait]
impl ProductionClient for HttpProductionClient {
    async fn order(&self, order: &DocumentOrder) -> DispatchResult<ProductionReceipt> {
        self.client.post("/api/v1/orders", order).await
    }

    async fn is_finished(&self, document_reference: &str) -> DispatchResult<bool> {
        let state: Option<ProductionState> = self
            .client
            .get_optional(&format!("/api/v1/documents/{}/status", document_reference))
            .await?;
        Ok(state.is_some_and(|s| s.finished))
    }
}

pub struct HttpArchiveClient {
    client: ServiceClient,
}

impl HttpArchiveClient {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: ServiceClient::new("archive service", &config.urls.archive, config)?,
        })
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    async fn create_record(
        &self,
        request: &ArchiveRecordRequest,
    ) -> DispatchResult<ArchiveReceipt> {
        self.client
            .post_with_headers(
                "/api/v1/records",
                request,
                &[(CORRELATION_HEADER, request.correlation_id.as_str())],
            )
            .await
    }
}

pub struct HttpDistributionClient {
    client: ServiceClient,
}

impl HttpDistributionClient {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: ServiceClient::new("distribution service", &config.urls.distribution, config)?,
        })
    }
}

#[async_trait]
impl DistributionClient for HttpDistributionClient {
    async fn distribute(
        &self,
        request: &DistributionRequest,
    ) -> DispatchResult<DistributionReceipt> {
        self.client.post("/api/v1/distributions", request).await
    }

    async fn status(&self, archive_id: &str) -> DispatchResult<Option<DistributionStatus>> {
        self.client
            .get_optional(&format!("/api/v1/distributions/{}", archive_id))
            .await
    }
}

pub struct HttpTitleDeriver {
    client: ServiceClient,
}

impl HttpTitleDeriver {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: ServiceClient::new("title service", &config.urls.title, config)?,
        })
    }
}

#[derive(Deserialize)]
struct DerivedTitle {
    title: Option<String>,
}

#[async_trait]
impl TitleDeriver for HttpTitleDeriver {
    async fn derive_title(&self, proceeding: &ProceedingRef) -> DispatchResult<Option<String>> {
        let derived: Option<DerivedTitle> = self
            .client
            .post_optional("/api/v1/titles", proceeding)
            .await?;
        Ok(derived.and_then(|d| d.title).filter(|t| !t.trim().is_empty()))
    }
}

pub struct HttpAddressLookup {
    client: ServiceClient,
}

impl HttpAddressLookup {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: ServiceClient::new("address service", &config.urls.address, config)?,
        })
    }
}

#[derive(Serialize)]
struct AddressQuery<'a> {
    ident: &'a str,
}

#[async_trait]
impl AddressLookup for HttpAddressLookup {
    async fn lookup(&self, ident: &str) -> DispatchResult<Option<PostalAddress>> {
        // Person idents stay out of URLs and access logs
        self.client
            .post_optional("/api/v1/addresses/lookup", &AddressQuery { ident })
            .await
    }
}

pub struct HttpIntakeClient {
    client: ServiceClient,
}

impl HttpIntakeClient {
    pub fn new(config: &DispatchConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: ServiceClient::new("intake service", &config.urls.intake, config)?,
        })
    }
}

#[derive(Deserialize)]
struct SubmissionReceipt {
    id: String,
}

#[async_trait]
impl IntakeClient for HttpIntakeClient {
    async fn submit_follow_up(&self, submission: &FollowUpSubmission) -> DispatchResult<String> {
        let receipt: SubmissionReceipt = self.client.post("/api/v1/follow-ups", submission).await?;
        Ok(receipt.id)
    }
}

impl ExternalServices {
    /// HTTP clients for every service in `config`; events go to `events`
    pub fn http(
        config: &DispatchConfig,
        events: Arc<dyn DispatchEventPublisher>,
    ) -> DispatchResult<Self> {
        Ok(Self {
            production: Arc::new(HttpProductionClient::new(config)?),
            archive: Arc::new(HttpArchiveClient::new(config)?),
            distribution: Arc::new(HttpDistributionClient::new(config)?),
            titles: Arc::new(HttpTitleDeriver::new(config)?),
            addresses: Arc::new(HttpAddressLookup::new(config)?),
            intake: Arc::new(HttpIntakeClient::new(config)?),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            let err = classify_status("archive service", status, String::new());
            assert!(err.is_transient(), "{} should be transient", status);
        }
    }

    #[test]
    fn test_client_errors_are_rejections() {
        let err = classify_status("archive service", StatusCode::BAD_REQUEST, "bad title".into());
        match err {
            DispatchError::ExternalRejected {
                service,
                status,
                body,
            } => {
                assert_eq!(service, "archive service");
                assert_eq!(status, 400);
                assert_eq!(body, "bad title");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let config = DispatchConfig::new("http://localhost");
        let client = ServiceClient::new("archive service", "http://archive:8080/", &config).unwrap();
        assert_eq!(
            client.url("/api/v1/records"),
            "http://archive:8080/api/v1/records"
        );
        assert_eq!(client.url("health"), "http://archive:8080/health");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable_after_retries() {
        let mut config = DispatchConfig::new("http://127.0.0.1:9");
        config.external_max_retries = 1;
        config.external_initial_backoff_ms = 1;
        config.external_timeout_secs = 1;
        let client = HttpProductionClient::new(&config).unwrap();

        let err = client.is_finished("BIF1").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ExternalServiceUnavailable { .. }
        ));
    }
}
