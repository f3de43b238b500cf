//! Batch writer.
//!
//! Flushes the records of a [`WriteBatch`] to the store in chunks of at
//! most `max_write_size` items, then writes the checkpoint document in a
//! bulk call of its own. A chunk refused because its collection does not
//! exist triggers provisioning:
//!
//! ```text
//! bulk_write ──CollectionMissing──▶ create_collection ─▶ sleep(delay) ─▶ bulk_write
//!      │                                  (up to `retries` rounds)
//!      │                                          │ exhausted
//!      ▼                                          ▼
//!   any other error: returned         unwritten records ─▶ RecoverySink
//! ```
//!
//! Bulk calls are not assumed atomic: a store may accept some items of a
//! call and refuse others. The checkpoint therefore never shares a call
//! with records, is only sent after every record chunk was accepted, and
//! is never handed to the recovery sink.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{BulkItem, WriteBatch};
use crate::recovery::RecoverySink;
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub max_write_size: usize,
    /// Provisioning rounds before a chunk is diverted.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_write_size: 1000,
            retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every item, checkpoint included, was accepted by the store.
    Written { items: usize, chunks: usize },
    /// Provisioning was exhausted. `items` were handed to the recovery sink.
    Diverted { items: usize },
}

enum ChunkResult {
    Written,
    Unprovisionable(String),
}

pub struct BatchWriter {
    store: Arc<dyn DocumentStore>,
    recovery: Arc<dyn RecoverySink>,
    settings: WriterSettings,
    mappings: HashMap<String, Value>,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        recovery: Arc<dyn RecoverySink>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            store,
            recovery,
            settings,
            mappings: HashMap::new(),
        }
    }

    /// Mapping to create `collection` with if it turns out to be missing.
    pub fn register_mapping(&mut self, collection: &str, mapping: Value) {
        self.mappings.insert(collection.to_string(), mapping);
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    pub async fn flush(&self, batch: WriteBatch) -> Result<FlushOutcome> {
        let WriteBatch { items, checkpoint } = batch;
        let size = self.settings.max_write_size.max(1);
        let data_chunks = items.len().div_ceil(size);

        for (n, chunk) in items.chunks(size).enumerate() {
            match self.write_chunk(chunk).await? {
                ChunkResult::Written => {
                    debug!(chunk = n + 1, of = data_chunks, items = chunk.len(), "chunk written");
                }
                ChunkResult::Unprovisionable(collection) => {
                    let rest = &items[n * size..];
                    warn!(
                        collection = %collection,
                        items = rest.len(),
                        "provisioning retries exhausted, diverting to recovery sink"
                    );
                    self.recovery
                        .submit(rest)
                        .await
                        .context("Failed to divert batch to recovery sink")?;
                    return Ok(FlushOutcome::Diverted { items: rest.len() });
                }
            }
        }

        if let ChunkResult::Unprovisionable(collection) =
            self.write_chunk(std::slice::from_ref(&checkpoint)).await?
        {
            bail!(
                "checkpoint collection '{}' could not be provisioned; {} records were written without advancing the marker",
                collection,
                items.len()
            );
        }
        debug!(collection = %checkpoint.index, id = %checkpoint.id, "checkpoint written");

        Ok(FlushOutcome::Written {
            items: items.len() + 1,
            chunks: data_chunks + 1,
        })
    }

    async fn write_chunk(&self, chunk: &[BulkItem]) -> Result<ChunkResult> {
        let mut attempt = 0u32;
        loop {
            match self.store.bulk_write(chunk).await {
                Ok(()) => return Ok(ChunkResult::Written),
                Err(StoreError::CollectionMissing(collection)) => {
                    if attempt >= self.settings.retries {
                        return Ok(ChunkResult::Unprovisionable(collection));
                    }
                    attempt += 1;
                    self.provision(&collection, attempt).await;
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => return Err(e).context("Bulk write failed"),
            }
        }
    }

    async fn provision(&self, collection: &str, attempt: u32) {
        let empty = json!({});
        let mapping = self.mappings.get(collection).unwrap_or(&empty);
        match self.store.create_collection(collection, mapping).await {
            Ok(()) => info!(collection, attempt, "collection created"),
            Err(e) => warn!(collection, attempt, error = %e, "collection create failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        submitted: Mutex<Vec<Vec<BulkItem>>>,
    }

    #[async_trait]
    impl RecoverySink for Recorder {
        async fn submit(&self, items: &[BulkItem]) -> Result<()> {
            self.submitted.lock().unwrap().push(items.to_vec());
            Ok(())
        }
    }

    fn item(index: &str, id: &str) -> BulkItem {
        BulkItem {
            index: index.into(),
            id: id.into(),
            data: json!({ "id": id }),
        }
    }

    fn settings(max: usize, retries: u32) -> WriterSettings {
        WriterSettings {
            max_write_size: max,
            retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn chunks_respect_max_write_size() {
        let store = Arc::new(InMemoryStore::new());
        store.create_collection("data", &json!({})).await.unwrap();
        store.create_collection("cp", &json!({})).await.unwrap();
        let writer = BatchWriter::new(store.clone(), Arc::new(Recorder::default()), settings(2, 0));

        let batch = WriteBatch::new(
            vec![item("data", "a"), item("data", "b"), item("data", "c")],
            item("cp", "fetch"),
        );
        let outcome = writer.flush(batch).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Written { items: 4, chunks: 3 });
        assert_eq!(store.bulk_write_count(), 3);
        assert_eq!(store.count("data"), 3);
        assert_eq!(store.count("cp"), 1);
    }

    #[tokio::test]
    async fn missing_collection_is_provisioned_with_registered_mapping() {
        let store = Arc::new(InMemoryStore::new());
        let mut writer = BatchWriter::new(store.clone(), Arc::new(Recorder::default()), settings(10, 3));
        writer.register_mapping("data", json!({ "mappings": { "dynamic": true } }));
        writer.register_mapping("cp", json!({}));

        let batch = WriteBatch::new(vec![item("data", "a")], item("cp", "fetch"));
        let outcome = writer.flush(batch).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Written { .. }));
        assert_eq!(
            store.mapping("data"),
            Some(json!({ "mappings": { "dynamic": true } }))
        );
        assert_eq!(store.count("cp"), 1);
    }

    #[tokio::test]
    async fn zero_retries_diverts_everything_unwritten() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let writer = BatchWriter::new(store.clone(), recorder.clone(), settings(10, 0));

        let batch = WriteBatch::new(vec![item("data", "a"), item("data", "b")], item("cp", "fetch"));
        let outcome = writer.flush(batch).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Diverted { items: 2 });

        let submitted = recorder.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let ids: Vec<_> = submitted[0].iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!store.has_collection("cp"));
    }

    #[tokio::test]
    async fn checkpoint_waits_for_every_record_chunk() {
        let store = Arc::new(InMemoryStore::new());
        store.create_collection("data", &json!({})).await.unwrap();
        store.create_collection("cp", &json!({})).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let writer = BatchWriter::new(store.clone(), recorder.clone(), settings(1, 0));

        // The second record chunk targets a collection that is never created.
        let batch = WriteBatch::new(
            vec![item("data", "a"), item("missing", "b"), item("data", "c")],
            item("cp", "fetch"),
        );
        let outcome = writer.flush(batch).await.unwrap();
        assert_eq!(outcome, FlushOutcome::Diverted { items: 2 });
        assert_eq!(store.count("data"), 1);
        assert_eq!(store.count("cp"), 0);
        assert!(recorder.submitted.lock().unwrap()[0]
            .iter()
            .all(|i| i.index != "cp"));
    }
}
