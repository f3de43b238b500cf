//! Storage abstraction for the sync engine.
//!
//! The [`DocumentStore`] trait is the only view the engine has of its
//! destination: collections of JSON documents keyed by id, written in
//! bulk and upserted on id. Backends:
//!
//! - [`memory::InMemoryStore`]: process-local, used by tests.
//! - [`sqlite::SqliteStore`]: one table per collection in a local database.
//! - [`elastic::ElasticStore`]: an Elasticsearch/OpenSearch cluster over HTTP.
//!
//! Implementations must be `Send + Sync`; both phase tasks hold the same
//! store behind an `Arc`.

pub mod elastic;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreResult;
use crate::models::BulkItem;

/// Abstract destination for raw, enriched and checkpoint documents.
///
/// # Operations
///
/// | Method | Used by |
/// |--------|---------|
/// | [`ping`](DocumentStore::ping) | startup check, before any phase runs |
/// | [`create_collection`](DocumentStore::create_collection) | batch writer, on a missing collection |
/// | [`bulk_write`](DocumentStore::bulk_write) | batch writer |
/// | [`get`](DocumentStore::get) | checkpoint store, marker lookup |
/// | [`stat_max`](DocumentStore::stat_max) | checkpoint store, fallback resume point |
/// | [`scan`](DocumentStore::scan) | enrich phase, keyset paging of raw documents |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Verify the store is reachable and credentials are accepted.
    async fn ping(&self) -> StoreResult<()>;

    /// Create a collection. Creating one that already exists is not an error.
    async fn create_collection(&self, name: &str, mapping: &Value) -> StoreResult<()>;

    /// Upsert every item. Either all items are accepted or an error is returned.
    ///
    /// Returns [`StoreError::CollectionMissing`](crate::error::StoreError::CollectionMissing)
    /// when any target collection has not been created.
    async fn bulk_write(&self, items: &[BulkItem]) -> StoreResult<()>;

    /// Fetch one document. A missing collection reads as `None`.
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Largest timestamp stored in `field` across the collection.
    async fn stat_max(&self, collection: &str, field: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Documents after `from` in ascending `(field, id)` order, at most
    /// `limit` of them. Documents without a parseable `field` are never
    /// returned.
    async fn scan(
        &self,
        collection: &str,
        field: &str,
        from: &ScanFrom,
        limit: usize,
    ) -> StoreResult<Vec<ScannedDoc>>;
}

/// Keyset position of a time-ordered scan.
///
/// Selects documents with `field > since`, plus those with `field == since`
/// and id greater than `after_id`. Without `after_id` every document at
/// `since` is included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFrom {
    pub since: DateTime<Utc>,
    pub after_id: Option<String>,
}

impl ScanFrom {
    pub fn at(since: DateTime<Utc>) -> Self {
        Self {
            since,
            after_id: None,
        }
    }

    /// Position just past `doc`.
    pub fn after(doc: &ScannedDoc) -> Self {
        Self {
            since: doc.at,
            after_id: Some(doc.id.clone()),
        }
    }

    /// Whether a document keyed `(at, id)` lies after this position.
    pub fn admits(&self, at: DateTime<Utc>, id: &str) -> bool {
        match self.after_id {
            Some(ref after) => at > self.since || (at == self.since && id > after.as_str()),
            None => at >= self.since,
        }
    }
}

/// One document returned by [`DocumentStore::scan`] with its sort key.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDoc {
    pub id: String,
    pub at: DateTime<Utc>,
    pub body: Value,
}

/// Parse a stored timestamp field. Accepts RFC 3339 strings and epoch seconds.
pub(crate) fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_rfc3339_and_epoch() {
        let a = parse_timestamp(&json!("2024-03-01T10:00:00Z")).unwrap();
        let b = parse_timestamp(&json!(a.timestamp())).unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(null)).is_none());
    }

    #[test]
    fn scan_position_excludes_ties_already_read() {
        let t = parse_timestamp(&json!("2024-03-01T10:00:00Z")).unwrap();
        let later = parse_timestamp(&json!("2024-03-01T10:00:01Z")).unwrap();

        let start = ScanFrom::at(t);
        assert!(start.admits(t, "a"));
        assert!(!start.admits(t - chrono::Duration::seconds(1), "z"));

        let next = ScanFrom::after(&ScannedDoc {
            id: "b".into(),
            at: t,
            body: json!({}),
        });
        assert!(!next.admits(t, "a"));
        assert!(!next.admits(t, "b"));
        assert!(next.admits(t, "c"));
        assert!(next.admits(later, "a"));
    }
}
