//! Connector trait and registry.
//!
//! A connector is the only per-source code in the system: it knows how to
//! fetch one page of upstream items, how to map them to [`RawRecord`]s, and
//! which fields of a raw record describe its author and its enriched
//! document. Everything else (checkpoints, paging, batching, identity
//! resolution, recovery) is handled by the engine in [`crate::sync`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌──────────┐  ┌──────────────────────┐  │
//! │  │ CircleCI │  │  Custom (Rust impls) │  │
//! │  └──────────┘  └──────────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        SyncEngine::run() → fetch + enrich
//! ```
//!
//! # Usage
//!
//! ```rust
//! use bulk_sync::traits::ConnectorRegistry;
//!
//! let mut connectors = ConnectorRegistry::new();
//! // connectors.register(Arc::new(MyConnector::new()));
//! assert!(connectors.is_empty());
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::models::RawRecord;
use crate::source::{Page, PageRequest};

/// Author handle extracted from a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorRef {
    /// Username or email; see [`IdentityKey::from_handle`](crate::identity::IdentityKey::from_handle).
    pub handle: String,
    /// Set when the record's own metadata says an automated actor did it.
    pub automated: bool,
}

// ═══════════════════════════════════════════════════════════════════════
// Connector Trait
// ═══════════════════════════════════════════════════════════════════════

/// A paginated upstream source.
///
/// # Lifecycle
///
/// 1. The connector is registered via [`ConnectorRegistry::register`].
/// 2. `bsync sync <type>:<name>` builds a [`SyncEngine`](crate::sync::SyncEngine) for it.
/// 3. The fetch phase calls [`fetch_page`](Connector::fetch_page) until
///    the source is exhausted.
/// 4. The enrich phase calls [`author`](Connector::author) and
///    [`enrich_fields`](Connector::enrich_fields) for every raw record.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Instance name (e.g. `"kubernetes"`).
    fn name(&self) -> &str;

    /// One-line description, shown by `bsync connectors`.
    fn description(&self) -> &str;

    /// Connector type identifier. Custom connectors default to `"custom"`.
    fn connector_type(&self) -> &str {
        "custom"
    }

    /// `"{type}:{name}"`.
    fn source_label(&self) -> String {
        format!("{}:{}", self.connector_type(), self.name())
    }

    /// Upstream origin stamped on every record (project slug, repo URL, ...).
    fn origin(&self) -> &str;

    /// Base index name. Raw records go to `{index}-raw`, enriched records
    /// to `{index}`, checkpoints to `{index}-last-action-date-cache`.
    fn index(&self) -> &str;

    fn raw_index(&self) -> String {
        format!("{}-raw", self.index())
    }

    fn enriched_index(&self) -> String {
        self.index().to_string()
    }

    /// Mapping for the raw collection.
    fn raw_mapping(&self) -> Value {
        json!({
            "mappings": {
                "properties": {
                    "uuid": { "type": "keyword" },
                    "origin": { "type": "keyword" },
                    "fetched_at": { "type": "date" },
                    "updated_at": { "type": "date" },
                    "payload": { "type": "object", "enabled": false }
                }
            }
        })
    }

    /// Mapping for the enriched collection.
    fn enriched_mapping(&self) -> Value {
        json!({
            "mappings": {
                "dynamic": true,
                "properties": {
                    "uuid": { "type": "keyword" },
                    "origin": { "type": "keyword" },
                    "updated_at": { "type": "date" },
                    "enriched_at": { "type": "date" },
                    "author_org_name": { "type": "keyword" },
                    "author_bot": { "type": "boolean" }
                }
            }
        })
    }

    /// Fetch one page of records updated at or after `request.since`.
    ///
    /// Items that cannot be decoded are dropped and counted in
    /// [`Page::skipped`]; any other failure is an error and aborts the phase.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;

    /// Author of a raw record, if it has one.
    fn author(&self, record: &RawRecord) -> Option<AuthorRef>;

    /// Connector-specific fields of the enriched document.
    fn enrich_fields(&self, record: &RawRecord) -> Result<Map<String, Value>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry of connectors (built-in and custom).
///
/// Use [`ConnectorRegistry::from_config`] to load every connector declared
/// in the config file, then optionally [`register`](ConnectorRegistry::register)
/// custom ones. Connectors are held in `Arc`s because both phase tasks of
/// a sync use the same instance.
pub struct ConnectorRegistry {
    connectors: Vec<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Create a registry pre-loaded with every connector from the config.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::connector_circleci::CircleCiConnector;

        let mut registry = Self::new();
        for (name, cfg) in &config.connectors.circleci {
            registry.register(Arc::new(CircleCiConnector::from_config(
                name,
                cfg,
                &config.sync,
            )?));
        }
        Ok(registry)
    }

    /// Register a connector.
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.push(connector);
    }

    /// Get all registered connectors.
    pub fn connectors(&self) -> &[Arc<dyn Connector>] {
        &self.connectors
    }

    /// Get connectors filtered by type (e.g. `"circleci"`).
    pub fn connectors_by_type(&self, connector_type: &str) -> Vec<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .filter(|c| c.connector_type() == connector_type)
            .cloned()
            .collect()
    }

    /// Find a specific connector by type and name.
    pub fn find(&self, connector_type: &str, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .iter()
            .find(|c| c.connector_type() == connector_type && c.name() == name)
            .cloned()
    }

    /// Resolve a CLI specifier: `all`, `<type>`, or `<type>:<name>`.
    pub fn resolve(&self, selector: &str) -> Vec<Arc<dyn Connector>> {
        if selector == "all" {
            return self.connectors.clone();
        }
        match selector.split_once(':') {
            Some((t, n)) => self.find(t, n).into_iter().collect(),
            None => self.connectors_by_type(selector),
        }
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Return the count of registered connectors.
    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
