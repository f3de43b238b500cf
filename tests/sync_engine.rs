//! End-to-end tests of the sync engine against in-memory collaborators.
//!
//! A scripted connector serves records by offset (no upstream cursor), so
//! these tests also cover the engine's extra fetch after a full page.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bulk_sync::checkpoint::CheckpointStore;
use bulk_sync::error::{StoreError, StoreResult, SyncError};
use bulk_sync::identity::{IdentityKey, IdentityService, KeyKind};
use bulk_sync::models::{BulkItem, Enrollment, Identity, RawRecord};
use bulk_sync::recovery::RecoverySink;
use bulk_sync::source::{Cursor, Page, PageRequest};
use bulk_sync::store::memory::InMemoryStore;
use bulk_sync::store::{DocumentStore, ScanFrom, ScannedDoc};
use bulk_sync::sync::{SyncEngine, SyncOptions, SyncSettings, SyncState};
use bulk_sync::traits::{AuthorRef, Connector};
use bulk_sync::writer::WriterSettings;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const INDEX: &str = "test-items";

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
}

fn record(id: &str, day: u32, author: &str) -> RawRecord {
    RawRecord {
        uuid: id.to_string(),
        origin: "test".to_string(),
        fetched_at: Utc::now(),
        updated_at: at(day),
        payload: json!({ "title": format!("item {}", id), "author": author }),
    }
}

// ─── Scripted connector ─────────────────────────────────────────────

struct ScriptedConnector {
    records: Mutex<Vec<RawRecord>>,
    requests: Mutex<Vec<PageRequest>>,
    fail: bool,
}

impl ScriptedConnector {
    fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            requests: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    fn push(&self, r: RawRecord) {
        self.records.lock().unwrap().push(r);
    }

    fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn description(&self) -> &str {
        "Scripted test connector"
    }

    fn origin(&self) -> &str {
        "test"
    }

    fn index(&self) -> &str {
        INDEX
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(anyhow!("upstream returned HTTP 401"));
        }
        let offset = match request.cursor {
            Some(Cursor::Offset(n)) => n,
            _ => 0,
        };
        let mut window: Vec<RawRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.updated_at >= request.since)
            .cloned()
            .collect();
        window.sort_by_key(|r| r.updated_at);
        Ok(Page::new(
            window.into_iter().skip(offset).take(request.limit).collect(),
            None,
        ))
    }

    fn author(&self, record: &RawRecord) -> Option<AuthorRef> {
        let handle = record.payload.get("author")?.as_str()?;
        Some(AuthorRef {
            handle: handle.to_string(),
            automated: false,
        })
    }

    fn enrich_fields(&self, record: &RawRecord) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        fields.insert("title".into(), record.payload["title"].clone());
        Ok(fields)
    }
}

// ─── Identity directory ─────────────────────────────────────────────

#[derive(Default)]
struct Directory {
    people: HashMap<String, (Identity, Vec<Enrollment>)>,
    key_calls: AtomicUsize,
}

impl Directory {
    fn with(mut self, username: &str, orgs: Vec<Enrollment>) -> Self {
        let identity = Identity {
            id: Some(format!("id-{}", username)),
            uuid: Some(format!("uuid-{}", username)),
            name: username.to_uppercase(),
            username: username.to_string(),
            email: None,
            domain: "example.com".to_string(),
            org_name: String::new(),
            is_bot: false,
            multi_org_names: Vec::new(),
        };
        self.people.insert(username.to_string(), (identity, orgs));
        self
    }

    fn calls(&self) -> usize {
        self.key_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityService for Directory {
    async fn resolve_by_key(&self, key: &IdentityKey) -> Result<Identity> {
        self.key_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(key.kind, KeyKind::Username);
        self.people
            .get(&key.value)
            .map(|(i, _)| i.clone())
            .ok_or_else(|| anyhow!("identity service unavailable"))
    }

    async fn resolve_organizations(&self, uuid: &str, _as_of: DateTime<Utc>) -> Result<Vec<Enrollment>> {
        self.people
            .values()
            .find(|(i, _)| i.uuid.as_deref() == Some(uuid))
            .map(|(_, orgs)| orgs.clone())
            .ok_or_else(|| anyhow!("unknown uuid"))
    }
}

// ─── Recovery recorder ──────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<BulkItem>>>,
}

#[async_trait]
impl RecoverySink for Recorder {
    async fn submit(&self, items: &[BulkItem]) -> Result<()> {
        self.batches.lock().unwrap().push(items.to_vec());
        Ok(())
    }
}

// ─── Store that can never provision one collection ──────────────────

struct Unprovisionable {
    inner: InMemoryStore,
    collection: String,
}

#[async_trait]
impl DocumentStore for Unprovisionable {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn create_collection(&self, name: &str, mapping: &Value) -> StoreResult<()> {
        if name == self.collection {
            return Err(StoreError::Rejected {
                collection: name.to_string(),
                reason: "cluster is read-only".to_string(),
            });
        }
        self.inner.create_collection(name, mapping).await
    }

    async fn bulk_write(&self, items: &[BulkItem]) -> StoreResult<()> {
        self.inner.bulk_write(items).await
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        self.inner.get(collection, id).await
    }

    async fn stat_max(&self, collection: &str, field: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.stat_max(collection, field).await
    }

    async fn scan(
        &self,
        collection: &str,
        field: &str,
        from: &ScanFrom,
        limit: usize,
    ) -> StoreResult<Vec<ScannedDoc>> {
        self.inner.scan(collection, field, from, limit).await
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn settings(page_size: usize) -> SyncSettings {
    SyncSettings {
        fetch_size: page_size,
        enrich_size: page_size,
        writer: WriterSettings {
            max_write_size: 1000,
            retries: 3,
            retry_delay: Duration::ZERO,
        },
    }
}

fn fetch_only() -> SyncOptions {
    SyncOptions {
        enrich: false,
        ..SyncOptions::default()
    }
}

fn enrich_only() -> SyncOptions {
    SyncOptions {
        fetch: false,
        ..SyncOptions::default()
    }
}

fn engine(
    connector: Arc<ScriptedConnector>,
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityService>,
    page_size: usize,
) -> SyncEngine {
    SyncEngine::new(
        connector,
        store,
        identity,
        Arc::new(Recorder::default()),
        settings(page_size),
    )
}

async fn marker(store: Arc<dyn DocumentStore>, stream: &str) -> Option<DateTime<Utc>> {
    CheckpointStore::new(store, INDEX)
        .get_marker(stream)
        .await
        .unwrap()
        .map(|m| m.as_of)
}

async fn seed_raw(store: &InMemoryStore, docs: Vec<Value>) {
    let raw = format!("{}-raw", INDEX);
    store.create_collection(&raw, &json!({})).await.unwrap();
    let items: Vec<BulkItem> = docs
        .into_iter()
        .enumerate()
        .map(|(i, data)| BulkItem {
            index: raw.clone(),
            id: data["uuid"].as_str().map(str::to_string).unwrap_or_else(|| format!("junk-{}", i)),
            data,
        })
        .collect();
    store.bulk_write(&items).await.unwrap();
}

// ─── Fetch phase ────────────────────────────────────────────────────

#[tokio::test]
async fn three_records_two_per_page() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        record("r1", 1, "alice"),
        record("r2", 2, "alice"),
        record("r3", 3, "bob"),
    ]));
    let store = Arc::new(InMemoryStore::new());
    let identity = Arc::new(Directory::default());

    let report = engine(connector.clone(), store.clone(), identity, 2)
        .run(fetch_only())
        .await
        .unwrap();

    let fetch = report.fetch.unwrap();
    assert_eq!(fetch.records, 3);
    assert_eq!(fetch.flushes, 2);
    assert_eq!(fetch.pages, 2);
    assert_eq!(fetch.marker, Some(at(3)));
    assert!(report.enrich.is_none());

    assert_eq!(store.count("test-items-raw"), 3);
    assert_eq!(marker(store.clone(), "fetch").await, Some(at(3)));
    assert_eq!(marker(store, "enrich").await, None);

    let requests = connector.requests();
    assert_eq!(requests[0].cursor, None);
    assert_eq!(requests[1].cursor, Some(Cursor::Offset(2)));
    assert!(requests.iter().all(|r| r.since == DateTime::UNIX_EPOCH));
}

#[tokio::test]
async fn exactly_full_page_triggers_one_extra_fetch() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        record("r1", 1, "alice"),
        record("r2", 2, "alice"),
    ]));
    let store = Arc::new(InMemoryStore::new());

    let report = engine(connector.clone(), store.clone(), Arc::new(Directory::default()), 2)
        .run(fetch_only())
        .await
        .unwrap();

    let fetch = report.fetch.unwrap();
    assert_eq!(fetch.pages, 2);
    assert_eq!(fetch.flushes, 1);
    assert_eq!(connector.requests().len(), 2);
    assert_eq!(store.count("test-items-raw"), 2);
}

#[tokio::test]
async fn empty_source_writes_nothing() {
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));
    let store = Arc::new(InMemoryStore::new());

    let report = engine(connector.clone(), store.clone(), Arc::new(Directory::default()), 5)
        .run(fetch_only())
        .await
        .unwrap();

    assert_eq!(report.fetch.unwrap().flushes, 0);
    assert_eq!(store.bulk_write_count(), 0);
    assert_eq!(marker(store, "fetch").await, None);
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        record("r1", 1, "alice"),
        record("r2", 2, "alice"),
        record("r3", 3, "bob"),
    ]));
    let store = Arc::new(InMemoryStore::new());
    let e = engine(connector.clone(), store.clone(), Arc::new(Directory::default()), 2);

    e.run(fetch_only()).await.unwrap();
    let before = store.documents("test-items-raw");
    let second = e.run(fetch_only()).await.unwrap().fetch.unwrap();

    // Resumes from the marker, so only the boundary record comes back.
    assert_eq!(second.records, 1);
    assert_eq!(connector.requests().last().unwrap().since, at(3));
    assert_eq!(store.count("test-items-raw"), 3);
    let after = store.documents("test-items-raw");
    let ids = |docs: &[Value]| docs.iter().map(|d| d["uuid"].clone()).collect::<Vec<_>>();
    assert_eq!(ids(&before), ids(&after));
    assert_eq!(marker(store, "fetch").await, Some(at(3)));
}

#[tokio::test]
async fn marker_never_moves_backwards() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        record("r1", 1, "alice"),
        record("r5", 5, "alice"),
    ]));
    let store = Arc::new(InMemoryStore::new());
    let e = engine(connector.clone(), store.clone(), Arc::new(Directory::default()), 10);

    e.run(fetch_only()).await.unwrap();
    assert_eq!(marker(store.clone(), "fetch").await, Some(at(5)));

    // A late record older than the marker is invisible to an incremental run.
    connector.push(record("r3", 3, "bob"));
    e.run(fetch_only()).await.unwrap();
    assert_eq!(store.count("test-items-raw"), 2);
    assert_eq!(marker(store.clone(), "fetch").await, Some(at(5)));

    // A full run picks it up without pulling the marker back.
    let full = SyncOptions {
        full: true,
        ..fetch_only()
    };
    let report = e.run(full).await.unwrap().fetch.unwrap();
    assert_eq!(report.records, 3);
    assert_eq!(store.count("test-items-raw"), 3);
    assert_eq!(marker(store, "fetch").await, Some(at(5)));
}

#[tokio::test]
async fn from_date_applies_only_without_marker() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        record("r1", 1, "alice"),
        record("r4", 4, "alice"),
    ]));
    let store = Arc::new(InMemoryStore::new());
    let e = engine(connector.clone(), store.clone(), Arc::new(Directory::default()), 10);

    let from = SyncOptions {
        from: Some(at(2)),
        ..fetch_only()
    };
    let report = e.run(from.clone()).await.unwrap().fetch.unwrap();
    assert_eq!(report.records, 1);
    assert_eq!(connector.requests()[0].since, at(2));

    let earlier = SyncOptions {
        from: Some(at(1)),
        ..fetch_only()
    };
    e.run(earlier).await.unwrap();
    assert_eq!(connector.requests().last().unwrap().since, at(4));
}

#[tokio::test]
async fn diverted_batch_does_not_advance_marker() {
    let connector = Arc::new(ScriptedConnector::new(vec![record("r1", 1, "alice")]));
    let store = Arc::new(Unprovisionable {
        inner: InMemoryStore::new(),
        collection: "test-items-raw".to_string(),
    });
    let recorder = Arc::new(Recorder::default());
    let mut s = settings(10);
    s.writer.retries = 2;

    let engine = SyncEngine::new(
        connector,
        store.clone(),
        Arc::new(Directory::default()),
        recorder.clone(),
        s,
    );
    let err = engine.run(fetch_only()).await.unwrap_err();

    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Diverted { phase, items, .. }) => {
            assert_eq!(phase, "fetch");
            assert_eq!(*items, 1);
        }
        other => panic!("expected a diverted batch, got {:?}", other),
    }

    // Only the record is diverted; the checkpoint is never sent anywhere.
    let batches = recorder.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(batches[0][0].index, "test-items-raw");
    drop(batches);

    assert_eq!(store.inner.count("test-items-raw"), 0);
    assert_eq!(store.inner.get("test-items-last-action-date-cache", "fetch").await.unwrap(), None);
}

#[tokio::test]
async fn page_error_fails_the_phase() {
    let connector = Arc::new(ScriptedConnector::failing());
    let store = Arc::new(InMemoryStore::new());
    let e = engine(connector, store.clone(), Arc::new(Directory::default()), 10);

    let err = e.run(fetch_only()).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::PhaseFailed { .. })
    ));
    assert!(format!("{:#}", err).contains("HTTP 401"));
    assert_eq!(store.bulk_write_count(), 0);
    assert_ne!(e.state(), SyncState::Done);
}

// ─── Enrich phase ───────────────────────────────────────────────────

#[tokio::test]
async fn failed_identity_lookups_are_not_cached() {
    let store = Arc::new(InMemoryStore::new());
    seed_raw(
        &store,
        vec![
            serde_json::to_value(record("r1", 1, "alice")).unwrap(),
            serde_json::to_value(record("r2", 2, "alice")).unwrap(),
        ],
    )
    .await;
    let directory = Arc::new(Directory::default());
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));

    let report = engine(connector, store.clone(), directory.clone(), 10)
        .run(enrich_only())
        .await
        .unwrap();

    assert_eq!(report.enrich.unwrap().records, 2);
    assert_eq!(directory.calls(), 2);
    for doc in store.documents("test-items") {
        assert_eq!(doc["author_name"], "Unknown");
        assert_eq!(doc["author_org_name"], "Unknown");
        assert_eq!(doc["author_bot"], false);
    }
    assert_eq!(marker(store, "enrich").await, Some(at(2)));
}

#[tokio::test]
async fn resolved_identities_carry_the_organization_of_the_day() {
    let store = Arc::new(InMemoryStore::new());
    seed_raw(
        &store,
        vec![
            serde_json::to_value(record("r1", 1, "bob")).unwrap(),
            serde_json::to_value(record("r9", 9, "bob")).unwrap(),
        ],
    )
    .await;
    let directory = Arc::new(Directory::default().with(
        "bob",
        vec![
            Enrollment {
                organization: "Acme".into(),
                start: None,
                end: Some(at(5)),
            },
            Enrollment {
                organization: "Initech".into(),
                start: Some(at(5)),
                end: None,
            },
        ],
    ));
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));

    engine(connector, store.clone(), directory.clone(), 10)
        .run(enrich_only())
        .await
        .unwrap();

    // One lookup serves both records.
    assert_eq!(directory.calls(), 1);
    let r1 = store.get("test-items", "r1").await.unwrap().unwrap();
    let r9 = store.get("test-items", "r9").await.unwrap().unwrap();
    assert_eq!(r1["author_org_name"], "Acme");
    assert_eq!(r9["author_org_name"], "Initech");
    assert_eq!(r1["author_multi_org_names"], json!(["Acme", "Initech"]));
    assert_eq!(r1["author_user_name"], "bob");
    assert_eq!(r1["title"], "item r1");
}

#[tokio::test]
async fn malformed_raw_records_are_skipped() {
    let store = Arc::new(InMemoryStore::new());
    seed_raw(
        &store,
        vec![
            serde_json::to_value(record("r1", 1, "bob")).unwrap(),
            json!({ "updated_at": "2024-03-02T12:00:00Z", "payload": "not a record" }),
            serde_json::to_value(record("r3", 3, "bob")).unwrap(),
        ],
    )
    .await;
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));

    let report = engine(connector, store.clone(), Arc::new(Directory::default()), 10)
        .run(enrich_only())
        .await
        .unwrap()
        .enrich
        .unwrap();

    assert_eq!(report.records, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.count("test-items"), 2);
    assert_eq!(marker(store, "enrich").await, Some(at(3)));
}

#[tokio::test]
async fn enrich_pages_through_raw_collection() {
    let store = Arc::new(InMemoryStore::new());
    let docs = (1..=5)
        .map(|d| serde_json::to_value(record(&format!("r{}", d), d, "bob")).unwrap())
        .collect();
    seed_raw(&store, docs).await;
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));

    let report = engine(connector, store.clone(), Arc::new(Directory::default()), 2)
        .run(enrich_only())
        .await
        .unwrap()
        .enrich
        .unwrap();

    assert_eq!(report.records, 5);
    assert_eq!(report.flushes, 3);
    assert_eq!(store.count("test-items"), 5);
}

#[tokio::test]
async fn enrich_pages_through_records_sharing_a_timestamp() {
    let store = Arc::new(InMemoryStore::new());
    let docs = ["e", "a", "d", "b", "c"]
        .iter()
        .map(|id| serde_json::to_value(record(id, 4, "bob")).unwrap())
        .collect();
    seed_raw(&store, docs).await;
    let connector = Arc::new(ScriptedConnector::new(Vec::new()));

    let report = engine(connector, store.clone(), Arc::new(Directory::default()), 2)
        .run(enrich_only())
        .await
        .unwrap()
        .enrich
        .unwrap();

    // Pages of 2, 2 and 1, each resuming after the last id read.
    assert_eq!(report.records, 5);
    assert_eq!(report.flushes, 3);
    assert_eq!(report.pages, 3);
    assert_eq!(store.count("test-items"), 5);
    assert_eq!(marker(store, "enrich").await, Some(at(4)));
}

// ─── Both phases ────────────────────────────────────────────────────

#[tokio::test]
async fn full_invocation_ends_done() {
    let connector = Arc::new(ScriptedConnector::new(vec![record("r1", 1, "alice")]));
    let store = Arc::new(InMemoryStore::new());
    let e = engine(connector.clone(), store.clone(), Arc::new(Directory::default()), 10);
    let mut states = e.subscribe();
    assert_eq!(e.state(), SyncState::Idle);

    e.run(SyncOptions::default()).await.unwrap();
    assert_eq!(e.state(), SyncState::Done);
    assert_eq!(*states.borrow_and_update(), SyncState::Done);

    // The enrich phase may have started before any raw record landed; a
    // second run always catches up.
    e.run(enrich_only()).await.unwrap();
    assert_eq!(store.count("test-items"), 1);
    assert!(store.has_collection("test-items-last-action-date-cache"));
}
