//! Shared HTTP transport for upstream APIs.
//!
//! Every outbound call made by connectors, the identity client and the
//! recovery sink goes through [`HttpClient::request`]. The only timeout in
//! the system lives here: a fixed per-request timeout set when the client
//! is built. There is no overall wall-clock budget for a sync.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry with exponential backoff
//! - Network errors → retry
//! - Any other status → returned to the caller as-is

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Status, headers and body of a completed request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into an error carrying the body text.
    pub fn error_for_status(self, what: &str) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        bail!("{} returned HTTP {}: {}", what, self.status, self.text());
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("Failed to decode JSON response body")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Thin wrapper over [`reqwest::Client`] with timeout and retry policy.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    /// Override the base backoff delay (doubles on every retry).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send one request, retrying transient failures.
    ///
    /// Returns the response for every status that is not retryable, so
    /// callers can inspect 4xx bodies (e.g. "index not found").
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Option<Vec<u8>>,
        params: &[(&str, String)],
    ) -> Result<HttpResponse> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                debug!(url, attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), url);
            for (name, value) in headers {
                req = req.header(*name, value);
            }
            if !params.is_empty() {
                req = req.query(params);
            }
            if let Some(ref b) = body {
                req = req.body(b.clone());
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let bytes = response.bytes().await.unwrap_or_default().to_vec();

                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(url, status = status.as_u16(), attempt, "transient upstream error");
                        last_err = Some(anyhow!(
                            "{} {} returned HTTP {}: {}",
                            method,
                            url,
                            status,
                            String::from_utf8_lossy(&bytes)
                        ));
                        continue;
                    }

                    return Ok(HttpResponse {
                        status: status.as_u16(),
                        headers,
                        body: bytes,
                    });
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "request failed");
                    last_err = Some(anyhow::Error::new(e).context(format!("{} {}", method, url)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} {} failed after retries", method, url)))
    }

    /// GET a JSON document, failing on any non-2xx status.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, String)],
        params: &[(&str, String)],
    ) -> Result<(T, HeaderMap)> {
        let resp = self
            .request(Method::GET, url, headers, None, params)
            .await?
            .error_for_status(url)?;
        let value = resp.json()?;
        Ok((value, resp.headers))
    }
}
