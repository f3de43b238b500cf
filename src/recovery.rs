//! Gap (recovery) sink.
//!
//! When a batch cannot be written because its destination collection
//! cannot be provisioned, the batch writer hands the unwritten items to a
//! [`RecoverySink`] instead of dropping them. Errors from the sink are
//! final: there is no second-level fallback.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Method;
use serde_json::json;
use tracing::info;

use crate::http::HttpClient;
use crate::models::BulkItem;

#[async_trait]
pub trait RecoverySink: Send + Sync {
    async fn submit(&self, items: &[BulkItem]) -> Result<()>;
}

/// Encode items as the gap payload: `{"payload": base64(json(items))}`.
pub fn encode_payload(items: &[BulkItem]) -> Result<serde_json::Value> {
    let raw = serde_json::to_vec(items).context("Failed to serialize diverted batch")?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
    Ok(json!({ "payload": encoded }))
}

/// POSTs diverted batches to a gap ingestion endpoint.
pub struct HttpRecoverySink {
    http: HttpClient,
    url: String,
    token: Option<String>,
}

impl HttpRecoverySink {
    pub fn new(http: HttpClient, url: &str, token: Option<String>) -> Self {
        Self {
            http,
            url: url.to_string(),
            token,
        }
    }
}

#[async_trait]
impl RecoverySink for HttpRecoverySink {
    async fn submit(&self, items: &[BulkItem]) -> Result<()> {
        let body = serde_json::to_vec(&encode_payload(items)?)?;
        let mut headers = vec![("Content-Type", "application/json".to_string())];
        if let Some(ref t) = self.token {
            headers.push(("Authorization", format!("Bearer {}", t)));
        }

        let resp = self
            .http
            .request(Method::POST, &self.url, &headers, Some(body), &[])
            .await
            .with_context(|| format!("Failed to reach recovery endpoint {}", self.url))?;
        if !resp.is_success() {
            bail!(
                "recovery endpoint {} returned HTTP {}: {}",
                self.url,
                resp.status,
                resp.text()
            );
        }

        info!(items = items.len(), url = %self.url, "batch diverted to recovery sink");
        Ok(())
    }
}

/// Used when no recovery endpoint is configured: diverting is an error.
pub struct NoRecoverySink;

#[async_trait]
impl RecoverySink for NoRecoverySink {
    async fn submit(&self, items: &[BulkItem]) -> Result<()> {
        bail!(
            "{} items could not be written and no recovery endpoint is configured",
            items.len()
        )
    }
}
