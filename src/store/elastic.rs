//! Elasticsearch / OpenSearch [`DocumentStore`] over the REST API.
//!
//! - writes: `POST /_bulk` with NDJSON `index` actions
//! - provisioning: `PUT /{index}` with the collection mapping
//! - marker reads: `GET /{index}/_doc/{id}`
//! - resume fallback: a `max` aggregation
//! - enrich paging: a `range` query sorted ascending

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde_json::{json, Value};

use crate::error::{StoreError, StoreResult};
use crate::http::{HttpClient, HttpResponse};
use crate::models::BulkItem;

use super::{parse_timestamp, DocumentStore, ScanFrom, ScannedDoc};

pub struct ElasticStore {
    http: HttpClient,
    base_url: String,
    auth: Option<String>,
}

impl ElasticStore {
    pub fn new(http: HttpClient, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: None,
        }
    }

    /// Use HTTP basic auth on every request.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        self.auth = Some(format!("Basic {}", token));
        self
    }

    async fn send(&self, method: Method, path: &str, body: Option<(&str, Vec<u8>)>) -> StoreResult<HttpResponse> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut headers = Vec::new();
        if let Some(ref auth) = self.auth {
            headers.push(("Authorization", auth.clone()));
        }
        let payload = body.map(|(content_type, bytes)| {
            headers.push(("Content-Type", content_type.to_string()));
            bytes
        });
        self.http
            .request(method, &url, &headers, payload, &[])
            .await
            .map_err(|e| StoreError::Unavailable(format!("{:#}", e)))
    }

    async fn search(&self, collection: &str, query: Value) -> StoreResult<Option<Value>> {
        let resp = self
            .send(
                Method::POST,
                &format!("{}/_search", collection),
                Some(("application/json", query.to_string().into_bytes())),
            )
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        let body: Value = serde_json::from_slice(&resp.body)?;
        if !resp.is_success() {
            return Err(StoreError::Backend(format!(
                "search on '{}' returned HTTP {}: {}",
                collection,
                resp.status,
                error_type(&body).unwrap_or("unknown")
            )));
        }
        Ok(Some(body))
    }
}

/// Build the NDJSON body of a `_bulk` request.
pub(crate) fn bulk_body(items: &[BulkItem]) -> String {
    let mut out = String::new();
    for item in items {
        let action = json!({ "index": { "_index": item.index, "_id": item.id } });
        out.push_str(&action.to_string());
        out.push('\n');
        out.push_str(&item.data.to_string());
        out.push('\n');
    }
    out
}

fn error_type(body: &Value) -> Option<&str> {
    body.get("error")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
}

/// Interpret a `_bulk` response. A missing index anywhere in the batch
/// takes precedence over other per-item failures.
pub(crate) fn check_bulk_response(body: &Value) -> StoreResult<()> {
    if !body.get("errors").and_then(|e| e.as_bool()).unwrap_or(false) {
        return Ok(());
    }

    let items = body
        .get("items")
        .and_then(|i| i.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[]);

    let mut first_failure: Option<StoreError> = None;
    for entry in items {
        let Some(result) = entry.get("index") else {
            continue;
        };
        let Some(err) = result.get("error") else {
            continue;
        };
        let index = result
            .get("_index")
            .and_then(|i| i.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = err.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        if kind == "index_not_found_exception" {
            return Err(StoreError::CollectionMissing(index));
        }
        if first_failure.is_none() {
            let reason = err
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or(kind)
                .to_string();
            first_failure = Some(StoreError::Rejected {
                collection: index,
                reason,
            });
        }
    }

    Err(first_failure.unwrap_or_else(|| {
        StoreError::Backend("bulk request reported errors without item details".to_string())
    }))
}

#[async_trait]
impl DocumentStore for ElasticStore {
    async fn ping(&self) -> StoreResult<()> {
        let resp = self.send(Method::GET, "", None).await?;
        if resp.status == 401 || resp.status == 403 {
            return Err(StoreError::Unavailable(format!(
                "credentials rejected (HTTP {})",
                resp.status
            )));
        }
        if !resp.is_success() {
            return Err(StoreError::Unavailable(format!("HTTP {}", resp.status)));
        }
        Ok(())
    }

    async fn create_collection(&self, name: &str, mapping: &Value) -> StoreResult<()> {
        let resp = self
            .send(
                Method::PUT,
                name,
                Some(("application/json", mapping.to_string().into_bytes())),
            )
            .await?;
        if resp.is_success() {
            return Ok(());
        }
        let body: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
        if error_type(&body) == Some("resource_already_exists_exception") {
            return Ok(());
        }
        Err(StoreError::Backend(format!(
            "create index '{}' returned HTTP {}: {}",
            name,
            resp.status,
            resp.text()
        )))
    }

    async fn bulk_write(&self, items: &[BulkItem]) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let resp = self
            .send(
                Method::POST,
                "_bulk?refresh=true",
                Some(("application/x-ndjson", bulk_body(items).into_bytes())),
            )
            .await?;
        let body: Value = serde_json::from_slice(&resp.body)?;
        if !resp.is_success() {
            if error_type(&body) == Some("index_not_found_exception") {
                return Err(StoreError::CollectionMissing(
                    items.first().map(|i| i.index.clone()).unwrap_or_default(),
                ));
            }
            return Err(StoreError::Backend(format!(
                "bulk request returned HTTP {}",
                resp.status
            )));
        }
        check_bulk_response(&body)
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        let resp = self
            .send(Method::GET, &format!("{}/_doc/{}", collection, id), None)
            .await?;
        if resp.status == 404 {
            return Ok(None);
        }
        if !resp.is_success() {
            return Err(StoreError::Backend(format!(
                "get {}/{} returned HTTP {}",
                collection, id, resp.status
            )));
        }
        let body: Value = serde_json::from_slice(&resp.body)?;
        Ok(body.get("_source").cloned())
    }

    async fn stat_max(&self, collection: &str, field: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let query = json!({
            "size": 0,
            "aggs": { "max_value": { "max": { "field": field } } }
        });
        let Some(body) = self.search(collection, query).await? else {
            return Ok(None);
        };
        let agg = &body["aggregations"]["max_value"];
        if let Some(s) = agg.get("value_as_string") {
            return Ok(parse_timestamp(s));
        }
        // Date fields aggregate to epoch milliseconds.
        Ok(agg
            .get("value")
            .and_then(|v| v.as_f64())
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64)))
    }

    async fn scan(
        &self,
        collection: &str,
        field: &str,
        from: &ScanFrom,
        limit: usize,
    ) -> StoreResult<Vec<ScannedDoc>> {
        let Some(body) = self.search(collection, scan_query(field, from, limit)).await? else {
            return Ok(Vec::new());
        };
        let hits = body["hits"]["hits"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        Ok(hits.iter().filter_map(|h| scanned_hit(h, field)).collect())
    }
}

/// Query for one scan page. Ties on `field` are broken by the `uuid`
/// keyword, and pages continue with `search_after` rather than `from`,
/// so deep scans stay under `index.max_result_window`.
pub(crate) fn scan_query(field: &str, from: &ScanFrom, limit: usize) -> Value {
    let mut query = json!({
        "size": limit,
        "query": { "range": { field: { "gte": from.since.to_rfc3339_opts(SecondsFormat::Millis, true) } } },
        "sort": [
            { field: { "order": "asc" } },
            { "uuid": { "order": "asc", "unmapped_type": "keyword" } }
        ]
    });
    if let Some(ref after) = from.after_id {
        query["search_after"] = json!([from.since.timestamp_millis(), after]);
    }
    query
}

fn scanned_hit(hit: &Value, field: &str) -> Option<ScannedDoc> {
    let body = hit.get("_source")?.clone();
    let sort = hit.get("sort");
    let at = sort
        .and_then(|s| s.get(0))
        .and_then(|v| v.as_i64())
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| body.get(field).and_then(parse_timestamp))?;
    let id = sort
        .and_then(|s| s.get(1))
        .and_then(|v| v.as_str())
        .or_else(|| hit.get("_id").and_then(|v| v.as_str()))?
        .to_string();
    Some(ScannedDoc { id, at, body })
}
