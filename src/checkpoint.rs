//! Checkpoint markers.
//!
//! Every connector index `X` has a companion collection
//! `X-last-action-date-cache` holding one document per stream
//! (`fetch`, `enrich`):
//!
//! ```json
//! { "id": "fetch", "changed_at": "2024-05-01T12:00:00Z" }
//! ```
//!
//! There is no `set_marker`. A marker is only ever written as
//! the tail item of a [`WriteBatch`](crate::models::WriteBatch), built with
//! [`CheckpointStore::marker_item`], so it lands if and only if the
//! records it measures land.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::models::{BulkItem, Marker};
use crate::store::{parse_timestamp, DocumentStore};

/// Field of the marker document holding the resume timestamp.
pub const MARKER_FIELD: &str = "changed_at";

/// Name of the checkpoint collection for a connector index.
pub fn checkpoint_collection(index: &str) -> String {
    format!("{}-last-action-date-cache", index)
}

/// Where a phase starts reading and the lowest marker it may write back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Lower bound passed to the source.
    pub since: DateTime<Utc>,
    /// Markers written by this run never go below this value.
    pub floor: DateTime<Utc>,
    pub origin: ResumeOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOrigin {
    Marker,
    StatMax,
    Caller,
    Epoch,
}

pub struct CheckpointStore {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn DocumentStore>, index: &str) -> Self {
        Self {
            store,
            collection: checkpoint_collection(index),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Mapping used when the checkpoint collection has to be provisioned.
    pub fn mapping() -> Value {
        json!({
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    MARKER_FIELD: { "type": "date" }
                }
            }
        })
    }

    /// Read the stored marker for `stream`. Absent on a first run.
    pub async fn get_marker(&self, stream: &str) -> Result<Option<Marker>> {
        let doc = self
            .store
            .get(&self.collection, stream)
            .await
            .with_context(|| format!("Failed to read checkpoint '{}'", stream))?;

        Ok(doc
            .as_ref()
            .and_then(|d| d.get(MARKER_FIELD))
            .and_then(parse_timestamp)
            .map(|as_of| Marker {
                stream_id: stream.to_string(),
                as_of,
            }))
    }

    /// Decide where `stream` resumes.
    ///
    /// Lookup order: stored marker, then the newest `updated_at` already in
    /// `data_collection`, then the caller's `from`, then the Unix epoch.
    /// With `full`, the query starts from `from` (or the epoch) but the
    /// stored marker still bounds what gets written back.
    pub async fn resolve_from(
        &self,
        stream: &str,
        data_collection: &str,
        from: Option<DateTime<Utc>>,
        full: bool,
    ) -> Result<ResumePoint> {
        let marker = self.get_marker(stream).await?.map(|m| m.as_of);

        if full {
            let since = from.unwrap_or(DateTime::UNIX_EPOCH);
            let floor = marker.map_or(since, |m| m.max(since));
            debug!(stream, %since, %floor, "full resync requested");
            return Ok(ResumePoint {
                since,
                floor,
                origin: if from.is_some() {
                    ResumeOrigin::Caller
                } else {
                    ResumeOrigin::Epoch
                },
            });
        }

        let (since, origin) = if let Some(m) = marker {
            (m, ResumeOrigin::Marker)
        } else if let Some(max) = self
            .store
            .stat_max(data_collection, "updated_at")
            .await
            .with_context(|| format!("Failed to read newest record of '{}'", data_collection))?
        {
            (max, ResumeOrigin::StatMax)
        } else if let Some(f) = from {
            (f, ResumeOrigin::Caller)
        } else {
            (DateTime::UNIX_EPOCH, ResumeOrigin::Epoch)
        };

        debug!(stream, %since, ?origin, "resolved resume point");
        Ok(ResumePoint {
            since,
            floor: since,
            origin,
        })
    }

    /// Build the checkpoint document that closes a write batch.
    pub fn marker_item(&self, stream: &str, as_of: DateTime<Utc>) -> BulkItem {
        BulkItem {
            index: self.collection.clone(),
            id: stream.to_string(),
            data: json!({
                "id": stream,
                MARKER_FIELD: as_of.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            }),
        }
    }
}
