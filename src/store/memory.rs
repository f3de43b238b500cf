//! In-memory [`DocumentStore`] implementation for tests.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Like a real
//! cluster it refuses writes to collections that were never created, so
//! the batch writer's provisioning path is exercised without a network.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::models::BulkItem;

use super::{parse_timestamp, DocumentStore, ScanFrom, ScannedDoc};

struct Collection {
    mapping: Value,
    docs: BTreeMap<String, Value>,
}

/// In-memory store. Counts bulk calls so tests can assert flush counts.
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    bulk_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            bulk_calls: AtomicUsize::new(0),
        }
    }

    /// Number of successful `bulk_write` calls so far.
    pub fn bulk_write_count(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections
            .read()
            .map(|c| c.contains_key(name))
            .unwrap_or(false)
    }

    /// Mapping the collection was created with.
    pub fn mapping(&self, name: &str) -> Option<Value> {
        let collections = self.collections.read().ok()?;
        collections.get(name).map(|c| c.mapping.clone())
    }

    /// All documents of a collection in id order.
    pub fn documents(&self, name: &str) -> Vec<Value> {
        self.collections
            .read()
            .ok()
            .and_then(|c| c.get(name).map(|col| col.docs.values().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.collections
            .read()
            .ok()
            .and_then(|c| c.get(name).map(|col| col.docs.len()))
            .unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("in-memory store lock poisoned".to_string())
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create_collection(&self, name: &str, mapping: &Value) -> StoreResult<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.entry(name.to_string()).or_insert_with(|| Collection {
            mapping: mapping.clone(),
            docs: BTreeMap::new(),
        });
        Ok(())
    }

    async fn bulk_write(&self, items: &[BulkItem]) -> StoreResult<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;

        // All-or-nothing: refuse the whole call before touching anything.
        if let Some(missing) = items.iter().find(|i| !collections.contains_key(&i.index)) {
            return Err(StoreError::CollectionMissing(missing.index.clone()));
        }

        for item in items {
            if let Some(col) = collections.get_mut(&item.index) {
                col.docs.insert(item.id.clone(), item.data.clone());
            }
        }
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections
            .get(collection)
            .and_then(|c| c.docs.get(id).cloned()))
    }

    async fn stat_max(&self, collection: &str, field: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections.get(collection).and_then(|c| {
            c.docs
                .values()
                .filter_map(|doc| doc.get(field).and_then(parse_timestamp))
                .max()
        }))
    }

    async fn scan(
        &self,
        collection: &str,
        field: &str,
        from: &ScanFrom,
        limit: usize,
    ) -> StoreResult<Vec<ScannedDoc>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let Some(col) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matching: Vec<ScannedDoc> = col
            .docs
            .iter()
            .filter_map(|(id, doc)| {
                let at = doc.get(field).and_then(parse_timestamp)?;
                from.admits(at, id).then(|| ScannedDoc {
                    id: id.clone(),
                    at,
                    body: doc.clone(),
                })
            })
            .collect();
        matching.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(index: &str, id: &str, data: Value) -> BulkItem {
        BulkItem {
            index: index.into(),
            id: id.into(),
            data,
        }
    }

    #[tokio::test]
    async fn write_to_missing_collection_is_refused_atomically() {
        let store = InMemoryStore::new();
        store.create_collection("a", &json!({})).await.unwrap();

        let err = store
            .bulk_write(&[item("a", "1", json!({})), item("b", "2", json!({}))])
            .await
            .unwrap_err();
        assert!(err.is_collection_missing());
        assert_eq!(store.count("a"), 0);
        assert_eq!(store.bulk_write_count(), 0);
    }

    #[tokio::test]
    async fn upsert_by_id() {
        let store = InMemoryStore::new();
        store.create_collection("a", &json!({})).await.unwrap();
        store.bulk_write(&[item("a", "1", json!({"v": 1}))]).await.unwrap();
        store.bulk_write(&[item("a", "1", json!({"v": 2}))]).await.unwrap();
        assert_eq!(store.count("a"), 1);
        assert_eq!(store.get("a", "1").await.unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn scan_orders_by_field_and_pages() {
        let store = InMemoryStore::new();
        store.create_collection("raw", &json!({})).await.unwrap();
        store
            .bulk_write(&[
                item("raw", "c", json!({"updated_at": "2024-01-03T00:00:00Z"})),
                item("raw", "a", json!({"updated_at": "2024-01-01T00:00:00Z"})),
                item("raw", "b", json!({"updated_at": "2024-01-02T00:00:00Z"})),
            ])
            .await
            .unwrap();

        let since = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let page = store
            .scan("raw", "updated_at", &ScanFrom::at(since), 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "b");
        assert_eq!(page[0].body["updated_at"], "2024-01-02T00:00:00Z");

        let rest = store
            .scan("raw", "updated_at", &ScanFrom::after(&page[0]), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c");

        let max = store.stat_max("raw", "updated_at").await.unwrap().unwrap();
        assert_eq!(max.to_rfc3339(), "2024-01-03T00:00:00+00:00");
        assert!(store.stat_max("nope", "updated_at").await.unwrap().is_none());
    }
}
