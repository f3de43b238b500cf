//! Core data models used throughout the sync engine.
//!
//! These types represent the records, identities, and write batches that
//! flow from a connector through the fetch and enrich phases into the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sentinel used wherever an identity or organization could not be resolved.
pub const UNKNOWN: &str = "Unknown";

/// The two phases of a sync invocation. Each one owns its own checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    Fetch,
    Enrich,
}

impl Phase {
    /// Stream identifier, also the id of the phase's checkpoint document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Enrich => "enrich",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable resume point for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub stream_id: String,
    pub as_of: DateTime<Utc>,
}

/// An upstream item plus synchronization metadata.
///
/// `uuid` is derived from stable upstream identifiers (see [`crate::ids`]),
/// so fetching the same item twice yields the same document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub uuid: String,
    pub origin: String,
    pub fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: Value,
}

/// A raw record annotated with resolved author identity.
///
/// Keyed by the same `uuid` as the raw record it was built from.
/// Connector-specific fields are flattened into the top-level document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub uuid: String,
    pub origin: String,
    pub updated_at: DateTime<Utc>,
    pub enriched_at: DateTime<Utc>,
    pub author_id: Option<String>,
    pub author_uuid: Option<String>,
    pub author_name: String,
    pub author_user_name: String,
    pub author_domain: String,
    pub author_org_name: String,
    pub author_multi_org_names: Vec<String>,
    pub author_bot: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EnrichedRecord {
    pub fn new(raw: &RawRecord, identity: &Identity, fields: Map<String, Value>) -> Self {
        Self {
            uuid: raw.uuid.clone(),
            origin: raw.origin.clone(),
            updated_at: raw.updated_at,
            enriched_at: Utc::now(),
            author_id: identity.id.clone(),
            author_uuid: identity.uuid.clone(),
            author_name: identity.name.clone(),
            author_user_name: identity.username.clone(),
            author_domain: identity.domain.clone(),
            author_org_name: identity.org_name.clone(),
            author_multi_org_names: identity.multi_org_names.clone(),
            author_bot: identity.is_bot,
            fields,
        }
    }
}

/// A contributor identity resolved from a natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Option<String>,
    pub uuid: Option<String>,
    pub name: String,
    pub username: String,
    pub email: Option<String>,
    pub domain: String,
    pub org_name: String,
    pub is_bot: bool,
    pub multi_org_names: Vec<String>,
}

impl Identity {
    /// Placeholder used when resolution fails. `is_bot` comes from the
    /// record's own trigger metadata, never from the identity service.
    pub fn unknown(is_bot: bool) -> Self {
        Self {
            id: None,
            uuid: None,
            name: UNKNOWN.to_string(),
            username: UNKNOWN.to_string(),
            email: None,
            domain: UNKNOWN.to_string(),
            org_name: UNKNOWN.to_string(),
            is_bot,
            multi_org_names: vec![UNKNOWN.to_string()],
        }
    }
}

/// A time-bounded assignment of an identity to an organization.
/// Open ends are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub organization: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Enrollment {
    pub fn contains(&self, as_of: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| s <= as_of) && self.end.map_or(true, |e| as_of <= e)
    }
}

/// One `(index, document id, document)` triple of a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    pub index: String,
    pub id: String,
    pub data: Value,
}

/// Records of one page plus the checkpoint document measuring them.
///
/// The checkpoint is only written once every record has been accepted.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub items: Vec<BulkItem>,
    pub checkpoint: BulkItem,
}

impl WriteBatch {
    pub fn new(items: Vec<BulkItem>, checkpoint: BulkItem) -> Self {
        Self { items, checkpoint }
    }

    /// Number of documents including the checkpoint.
    pub fn document_count(&self) -> usize {
        self.items.len() + 1
    }
}
