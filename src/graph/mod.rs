pub mod apps;
pub mod auth;
pub mod content;
pub mod groups;

use crate::config::{ConfigManager, TenantConfig};
use crate::error::{IntunePackError, Result};
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

const JITTER_FACTOR: f64 = 0.3; // +/- 30% jitter

/// OData string literal: `'O''Brien'`
pub fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `$filter=<expression>` with the expression url-encoded
pub fn odata_filter(expression: &str) -> String {
    format!("$filter={}", urlencoding::encode(expression))
}

/// Retry behavior for transient failures (429, 5xx, connection errors)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30000),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter for the given zero-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let base_backoff = initial.saturating_mul(2u64.saturating_pow(attempt));
        let capped_backoff = base_backoff.min(self.max_backoff.as_millis() as u64);

        let jitter_range = (capped_backoff as f64 * JITTER_FACTOR) as i64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };

        Duration::from_millis((capped_backoff as i64 + jitter).max(1) as u64)
    }
}

/// Graph API client with retry support
#[derive(Clone)]
pub struct GraphClient {
    client: Client,
    access_token: String,
    base_url: String,
    retry: RetryPolicy,
}

impl GraphClient {
    pub fn new(access_token: String) -> Self {
        Self {
            client: Client::new(),
            access_token,
            base_url: GRAPH_API_BASE.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Point the client at another Graph root (beta, national clouds, mocks)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create a GraphClient for a configured tenant using its cached token
    pub async fn from_config(config: &ConfigManager, tenant: &TenantConfig) -> Result<Self> {
        let graph_auth = auth::GraphAuth::new(config.clone());
        let access_token = graph_auth.get_access_token(tenant).await?;

        Ok(Self::new(access_token))
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
            return endpoint.to_string();
        }
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// GET an endpoint and deserialize the JSON body
    pub async fn get<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        let resp = self.send(Method::GET, endpoint, None).await?;
        Ok(resp.json::<T>().await?)
    }

    /// POST a JSON body and deserialize the JSON response
    pub async fn post<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        let body = serde_json::to_value(body)?;
        let resp = self.send(Method::POST, endpoint, Some(&body)).await?;
        Ok(resp.json::<R>().await?)
    }

    /// POST for actions that answer with an empty body (commit, assign, renewUpload)
    pub async fn post_empty<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let body = serde_json::to_value(body)?;
        self.send(Method::POST, endpoint, Some(&body)).await?;
        Ok(())
    }

    /// PATCH an entity; Graph answers 204 No Content
    pub async fn patch<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let body = serde_json::to_value(body)?;
        self.send(Method::PATCH, endpoint, Some(&body)).await?;
        Ok(())
    }

    pub async fn delete(&self, endpoint: &str) -> Result<()> {
        self.send(Method::DELETE, endpoint, None).await?;
        Ok(())
    }

    /// Send a request, retrying throttling, server errors and connection failures
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = self.url(endpoint);
        let max_retries = self.retry.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_retries {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.access_token);
            if let Some(body) = body {
                request = request.json(body);
            }

            tracing::debug!("{} {} (attempt {}/{})", method, url, attempt + 1, max_retries);

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let retries_left = attempt < max_retries - 1;

                    if status == StatusCode::TOO_MANY_REQUESTS && retries_left {
                        let wait_time = resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| self.retry.backoff(attempt));

                        tracing::warn!(
                            "Rate limited (429). Retrying in {:?}... (attempt {}/{})",
                            wait_time,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(wait_time).await;
                        continue;
                    }

                    if status.is_server_error() && retries_left {
                        let wait_time = self.retry.backoff(attempt);
                        tracing::warn!(
                            "Server error ({}). Retrying in {:?}... (attempt {}/{})",
                            status,
                            wait_time,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(wait_time).await;
                        continue;
                    }

                    if !status.is_success() {
                        let error_text = resp.text().await.unwrap_or_default();
                        let enhanced_error = crate::error::enhance_graph_error(&error_text);
                        return Err(IntunePackError::GraphApiError(format!(
                            "HTTP {}: {}",
                            status, enhanced_error
                        )));
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < max_retries - 1 {
                        let wait_time = self.retry.backoff(attempt);
                        tracing::warn!(
                            "Connection error: {}. Retrying in {:?}... (attempt {}/{})",
                            e,
                            wait_time,
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(wait_time).await;
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }

        Err(last_error.map(|e| e.into()).unwrap_or_else(|| {
            IntunePackError::GraphApiError(format!(
                "{} {} failed after {} retries",
                method, url, max_retries
            ))
        }))
    }
}

// ============================================================================
// Pagination Helpers
// ============================================================================

/// Generic paginated response from Graph API
#[derive(Debug, Deserialize)]
pub struct PaginatedResponse<T> {
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

impl GraphClient {
    /// Fetch all pages of a collection, following `@odata.nextLink`
    pub async fn get_all_pages<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
    ) -> Result<Vec<T>> {
        let mut all_items: Vec<T> = Vec::new();
        let mut current = self.url(endpoint);

        loop {
            let response: PaginatedResponse<T> = self.get(&current).await?;
            all_items.extend(response.value);

            match response.next_link {
                Some(next) => current = next,
                None => break,
            }
        }

        Ok(all_items)
    }
}
