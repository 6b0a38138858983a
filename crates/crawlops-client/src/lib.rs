//! Job Service / Bulk Extraction API contracts and their HTTP implementation.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crawlops_core::{
    AggregateProgress, BulkCancelAck, BulkExtractionPreview, BulkExtractionRequest, BulkTriggerAck,
    CancelAck, Job, JobFilter, JobId, JobSpec, JobSummary,
};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "crawlops-client";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("could not send request: {0}")]
    Request(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Unknown and unauthorized ids are indistinguishable to the caller.
    pub fn from_status(status: StatusCode, url: &str, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            url.to_string()
        } else {
            format!("{url}: {}", body.trim())
        };
        if matches!(
            status,
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return ApiError::NotFound(message);
        }
        match classify_status(status) {
            RetryDisposition::Retryable => ApiError::Transient(format!("http {}: {message}", status.as_u16())),
            RetryDisposition::NonRetryable => ApiError::Rejected {
                status: status.as_u16(),
                message,
            },
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if classify_reqwest_error(&err) == RetryDisposition::Retryable {
            ApiError::Transient(err.to_string())
        } else {
            ApiError::Request(err.to_string())
        }
    }
}

/// External Job Service. Every call is a network round-trip.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobId, ApiError>;
    async fn get_job(&self, id: JobId) -> Result<Job, ApiError>;
    async fn cancel_job(&self, id: JobId) -> Result<CancelAck, ApiError>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, ApiError>;
}

#[async_trait]
pub trait BulkExtractionApi: Send + Sync {
    async fn preview(&self, request: &BulkExtractionRequest) -> Result<BulkExtractionPreview, ApiError>;
    async fn trigger(&self, request: &BulkExtractionRequest) -> Result<BulkTriggerAck, ApiError>;
    async fn status(&self) -> Result<AggregateProgress, ApiError>;
    /// Cancels pending bulk jobs; running ones finish.
    async fn cancel(&self) -> Result<BulkCancelAck, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_token: Option<String>,
    /// Applied to one-shot idempotent reads (job lists, bulk preview). Polled
    /// reads and mutations are sent once.
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedJob {
    id: JobId,
}

#[derive(Debug, Serialize)]
struct EmptyBody {}

#[derive(Debug, Clone)]
pub struct HttpJobService {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpJobService {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GET with up to `backoff.max_retries` retries on transient failures.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        backoff: &BackoffPolicy,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let span = info_span!("job_api", method = "GET", url = %url);
        async {
            let mut attempt = 0usize;
            loop {
                let can_retry = attempt < backoff.max_retries;
                match self.request(Method::GET, &url).query(query).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if !status.is_success()
                            && classify_status(status) == RetryDisposition::Retryable
                            && can_retry
                        {
                            debug!(status = status.as_u16(), attempt, "retrying read");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return decode(resp).await;
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                            debug!(error = %err, attempt, "retrying read");
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(ApiError::from_reqwest(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        let span = info_span!("job_api", method = "POST", url = %url);
        async {
            let resp = self
                .request(Method::POST, &url)
                .json(body)
                .send()
                .await
                .map_err(ApiError::from_reqwest)?;
            let result = decode(resp).await;
            if let Err(err) = &result {
                warn!(error = %err, "mutation failed");
            }
            result
        }
        .instrument(span)
        .await
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    let url = resp.url().to_string();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(format!("{url}: {err}")));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::from_status(status, &url, &body))
}

pub fn job_filter_query(filter: &JobFilter) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    if let Some(status) = filter.status {
        query.push(("status", status.to_string()));
    }
    if let Some(kind) = filter.kind {
        query.push(("kind", kind.to_string()));
    }
    if let Some(limit) = filter.limit {
        query.push(("limit", limit.to_string()));
    }
    query
}

pub fn bulk_preview_query(request: &BulkExtractionRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![("mode", request.mode.to_string())];
    if !request.data_types.is_empty() {
        let types = request
            .data_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(",");
        query.push(("data_types", types));
    }
    if !request.formats.is_empty() {
        query.push(("formats", request.formats.join(",")));
    }
    query
}

#[async_trait]
impl JobService for HttpJobService {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobId, ApiError> {
        let created: CreatedJob = self.post_json("jobs", spec).await?;
        Ok(created.id)
    }

    /// Sent once. Pollers call this on their own cadence and count failures
    /// against their own budget.
    async fn get_job(&self, id: JobId) -> Result<Job, ApiError> {
        self.get_json(&format!("jobs/{id}"), &[], &BackoffPolicy::none())
            .await
    }

    async fn cancel_job(&self, id: JobId) -> Result<CancelAck, ApiError> {
        self.post_json(&format!("jobs/{id}/cancel"), &EmptyBody {}).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, ApiError> {
        self.get_json("jobs", &job_filter_query(filter), &self.backoff)
            .await
    }
}

#[async_trait]
impl BulkExtractionApi for HttpJobService {
    async fn preview(&self, request: &BulkExtractionRequest) -> Result<BulkExtractionPreview, ApiError> {
        self.get_json(
            "bulk-extraction/preview",
            &bulk_preview_query(request),
            &self.backoff,
        )
        .await
    }

    async fn trigger(&self, request: &BulkExtractionRequest) -> Result<BulkTriggerAck, ApiError> {
        self.post_json("bulk-extraction/trigger", request).await
    }

    /// Sent once, like `get_job`: the bulk monitor polls it on a fixed interval.
    async fn status(&self) -> Result<AggregateProgress, ApiError> {
        self.get_json("bulk-extraction/status", &[], &BackoffPolicy::none())
            .await
    }

    async fn cancel(&self) -> Result<BulkCancelAck, ApiError> {
        self.post_json("bulk-extraction/cancel", &EmptyBody {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlops_core::{BulkExtractionMode, DataType, JobKind, JobStatus};

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn statuses_map_onto_the_error_taxonomy() {
        let url = "http://svc/jobs/1";
        assert!(ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, url, "").is_transient());
        assert!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, url, "").is_transient());
        assert!(ApiError::from_status(StatusCode::NOT_FOUND, url, "").is_not_found());
        assert!(ApiError::from_status(StatusCode::FORBIDDEN, url, "").is_not_found());
        assert_eq!(
            ApiError::from_status(StatusCode::CONFLICT, url, "already terminal"),
            ApiError::Rejected {
                status: 409,
                message: "http://svc/jobs/1: already terminal".to_string()
            }
        );
    }

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let svc = HttpJobService::new(HttpClientConfig {
            base_url: "http://svc/api/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(svc.endpoint("/jobs"), "http://svc/api/jobs");
        assert_eq!(svc.endpoint("jobs/abc/cancel"), "http://svc/api/jobs/abc/cancel");
    }

    #[test]
    fn query_builders_skip_unset_fields() {
        assert!(job_filter_query(&JobFilter::default()).is_empty());
        let query = job_filter_query(&JobFilter {
            status: Some(JobStatus::Running),
            kind: Some(JobKind::Crawl),
            limit: Some(20),
        });
        assert_eq!(
            query,
            vec![
                ("status", "running".to_string()),
                ("kind", "crawl".to_string()),
                ("limit", "20".to_string())
            ]
        );

        let bulk = bulk_preview_query(&BulkExtractionRequest {
            mode: BulkExtractionMode::FlaggedOnly,
            data_types: vec![DataType::Budget, DataType::Actuals],
            formats: vec![],
        });
        assert_eq!(
            bulk,
            vec![
                ("mode", "flagged_only".to_string()),
                ("data_types", "budget,actuals".to_string())
            ]
        );
    }
}
