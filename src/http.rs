use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use reqwest::multipart::Form;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

const USER_AGENT: &str = concat!("scansync/", env!("CARGO_PKG_VERSION"));
const MAX_ATTEMPTS: usize = 5;
const RETRY_BASE_DELAY_MS: u64 = 300;
const MAX_BACKOFF_SECS: u64 = 8;

/// Thin wrapper over `reqwest::Client` bound to the scanner API base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("API URL is empty");
        }
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get_response(path).await?;
        response
            .json()
            .await
            .with_context(|| format!("failed to decode response from {path}"))
    }

    /// GET with the response status checked; the body is left unread.
    pub async fn get_response(&self, path: &str) -> Result<Response> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        check_status(response).await
    }

    /// GET that retries network errors and 5xx responses with exponential
    /// backoff. Used by one-shot commands, never by the periodic poller.
    pub async fn get_with_retry<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let attempt_counter = Arc::new(AtomicUsize::new(0));

        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(RETRY_BASE_DELAY_MS))
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_secs(MAX_BACKOFF_SECS))
            .with_max_elapsed_time(None)
            .build();

        let result = retry_notify(
            backoff,
            || {
                let http = self.http.clone();
                let url = url.clone();
                let attempt_counter = Arc::clone(&attempt_counter);

                async move {
                    let attempt = attempt_counter.fetch_add(1, Ordering::Relaxed) + 1;
                    match http.get(&url).send().await {
                        Ok(response) => {
                            let status = response.status();
                            if status.is_success() {
                                return response.json::<T>().await.map_err(|err| {
                                    BackoffError::permanent(anyhow!(
                                        "failed to decode response from {url}: {err}"
                                    ))
                                });
                            }

                            let body = response.text().await.unwrap_or_default();
                            if status.is_server_error() && attempt < MAX_ATTEMPTS {
                                Err(BackoffError::transient(anyhow!(
                                    "{url} returned {status} on attempt {attempt}/{MAX_ATTEMPTS}: {body}"
                                )))
                            } else {
                                Err(BackoffError::permanent(anyhow!(
                                    "{url} returned {status}: {}",
                                    error_detail(&body)
                                )))
                            }
                        }
                        Err(err) if attempt < MAX_ATTEMPTS => Err(BackoffError::transient(
                            anyhow!("network error on attempt {attempt}/{MAX_ATTEMPTS}: {err}"),
                        )),
                        Err(err) => Err(BackoffError::permanent(anyhow!(
                            "request to {url} failed: {err}"
                        ))),
                    }
                }
            },
            |err: anyhow::Error, delay: Duration| debug!(error = %err, ?delay, "retrying request"),
        )
        .await;

        result.map_err(|err| {
            let attempts = attempt_counter.load(Ordering::Relaxed).max(1);
            err.context(format!("giving up after {attempts} attempt(s)"))
        })
    }

    pub async fn post_multipart<T: DeserializeOwned>(&self, path: &str, form: Form) -> Result<T> {
        let response = self.send_multipart(path, form).await?;
        response
            .json()
            .await
            .with_context(|| format!("failed to decode response from {path}"))
    }

    /// Multipart POST where only the status code matters.
    pub async fn post_multipart_accepted(&self, path: &str, form: Form) -> Result<()> {
        self.send_multipart(path, form).await.map(|_| ())
    }

    async fn send_multipart(&self, path: &str, form: Form) -> Result<Response> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    bail!("{url} returned {status}: {}", error_detail(&body))
}

/// The backend reports failures as `{"detail": "..."}`; fall back to the raw
/// body for anything else.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|detail| detail.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
