//! HTTP client for the remote resource API.
//!
//! Wraps a shared `reqwest::Client` with three layers, innermost first:
//! a transparent exponential-backoff retry for transient faults (connection
//! resets, timeouts, configured retryable statuses), the 401 token-refresh
//! loop from [`crate::uplink::auth`], and typed helpers for the resource
//! operations (POST a record, GET a filtered collection, DELETE by id).
//!
//! URL discovery follows the API's own base document: a GET on the
//! configured base URL yields the OAuth, dependencies, schema-metadata, and
//! data URLs.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::uplink::auth::{AuthError, AuthSession};
use crate::uplink::config::AppConfig;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("request to {url} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        source: reqwest::Error,
    },

    #[error("could not discover API URLs from {0}: missing `urls.{1}`")]
    Discovery(String, String),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// URLs discovered from the API base document.
#[derive(Debug, Clone)]
pub struct ApiUrls {
    pub oauth: String,
    pub dependencies: String,
    pub open_api_metadata: String,
    pub data: String,
}

#[derive(Debug, Clone)]
struct RetryPolicy {
    attempts: usize,
    backoff_factor: f64,
    statuses: Vec<u16>,
}

const BASE_RETRY_DELAY_MS: u64 = 1000;

pub struct ApiClient {
    http: Client,
    pub urls: ApiUrls,
    pub auth: Arc<AuthSession>,
    namespace: String,
    retry: RetryPolicy,
}

/// Joins URL parts with single slashes regardless of trailing slashes on
/// the inputs.
pub fn url_join(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.trim_end_matches('/'))
        .collect::<Vec<_>>()
        .join("/")
}

impl ApiClient {
    /// Builds the client, discovers the API's URLs, and obtains the first
    /// token. Any failure here is fatal for the run.
    pub async fn connect(config: &AppConfig) -> ApiResult<Self> {
        let http = Client::builder()
            .user_agent(format!("uplink/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.connection.timeout_secs))
            .pool_max_idle_per_host(config.connection.pool_size)
            .gzip(true)
            .build()?;

        debug!("fetching API base document from {}", config.api.base_url);
        let base: Value = http.get(&config.api.base_url).send().await?.json().await?;
        let url_for = |key: &str| -> ApiResult<String> {
            base.pointer(&format!("/urls/{key}"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ApiError::Discovery(config.api.base_url.clone(), key.to_string())
                })
        };

        let mut data = url_for("dataManagementApi")?;
        if let Some(year) = config.api.year {
            data = url_join(&[&data, &year.to_string()]);
        }
        let urls = ApiUrls {
            oauth: url_for("oauth")?,
            dependencies: url_for("dependencies")?,
            open_api_metadata: url_for("openApiMetadata")?,
            data,
        };

        let auth = Arc::new(AuthSession::new(
            http.clone(),
            urls.oauth.clone(),
            config.api.client_id.clone(),
            config.api.client_secret.clone(),
        ));
        auth.login().await?;

        Ok(Self {
            http,
            urls,
            auth,
            namespace: config.api.namespace.clone(),
            retry: RetryPolicy {
                attempts: config.connection.num_retries.max(1),
                backoff_factor: config.connection.backoff_factor,
                statuses: config.connection.retry_statuses.clone(),
            },
        })
    }

    /// Collection URL for a resource: `<data>/<namespace>/<resource>`.
    pub fn resource_url(&self, resource: &str) -> String {
        url_join(&[&self.urls.data, &self.namespace, resource])
    }

    /// Plain GET returning parsed JSON; used for the discovery, dependency,
    /// and schema endpoints which sit outside the authorized data paths.
    pub async fn get_json(&self, url: &str) -> ApiResult<Value> {
        let response = self
            .with_backoff(&|| self.http.get(url), url)
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// POST one raw NDJSON payload line to a resource collection.
    pub async fn post_record(&self, resource: &str, body: String) -> ApiResult<Response> {
        let url = self.resource_url(resource);
        self.authorized(&url, move |client, token, url| {
            client
                .post(url)
                .bearer_auth(token)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::ACCEPT, "application/json")
                .body(body.clone())
        })
        .await
    }

    /// GET a resource collection, optionally filtered/paginated by query
    /// parameters.
    pub async fn get_collection(
        &self,
        resource: &str,
        query: &[(String, String)],
    ) -> ApiResult<Response> {
        let url = self.resource_url(resource);
        let query = query.to_vec();
        self.authorized(&url, move |client, token, url| {
            client
                .get(url)
                .query(&query)
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, "application/json")
        })
        .await
    }

    /// DELETE one record by its opaque id.
    pub async fn delete_by_id(&self, resource: &str, id: &str) -> ApiResult<Response> {
        let url = url_join(&[&self.resource_url(resource), id]);
        self.authorized(&url, move |client, token, url| {
            client
                .delete(url)
                .bearer_auth(token)
                .header(reqwest::header::ACCEPT, "application/json")
        })
        .await
    }

    /// The capture-version 401 loop. Issues the request with the current
    /// token; on a 401, refreshes (or waits out another task's refresh) and
    /// retries. The loop has no iteration cap: token refresh is expected to
    /// eventually succeed or the operator aborts the run.
    async fn authorized<F>(&self, url: &str, build: F) -> ApiResult<Response>
    where
        F: Fn(&Client, &str, &str) -> RequestBuilder,
    {
        loop {
            let (token, version) = self.auth.current();
            let response = self
                .with_backoff(&|| build(&self.http, &token, url), url)
                .await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                let retry_now = self.auth.refresh_if_stale(version).await;
                if !retry_now {
                    sleep(Duration::from_secs(1)).await;
                }
                continue;
            }
            return Ok(response);
        }
    }

    /// Exponential-backoff wrapper for transient faults. Retries transport
    /// errors and the configured retryable statuses; everything else is
    /// returned to the caller as-is. A still-retryable status after the last
    /// attempt is also returned (it becomes a per-payload failure upstream);
    /// a transport error after the last attempt surfaces as
    /// [`ApiError::RetriesExhausted`].
    async fn with_backoff<F>(&self, build: &F, url: &str) -> ApiResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay = Duration::from_millis(BASE_RETRY_DELAY_MS);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if self.retry.statuses.contains(&status) && attempt < self.retry.attempts {
                        debug!("{url} returned {status}, retrying in {delay:?}");
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) => {
                    if attempt >= self.retry.attempts {
                        return Err(ApiError::RetriesExhausted {
                            url: url.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    warn!("request to {url} failed ({e}), retrying in {delay:?}");
                }
            }
            sleep(delay).await;
            delay = delay.mul_f64(self.retry.backoff_factor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_handles_trailing_slashes() {
        assert_eq!(
            url_join(&["https://api.example.org/data/v3/", "ed-fi", "students"]),
            "https://api.example.org/data/v3/ed-fi/students"
        );
    }

    #[test]
    fn url_join_skips_empty_parts() {
        assert_eq!(url_join(&["https://x.org", "", "schools"]), "https://x.org/schools");
    }
}
