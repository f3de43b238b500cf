//! Sync orchestration.
//!
//! A [`SyncEngine`] runs one invocation for one connector. It drives two
//! phases as separate tokio tasks and waits on both handles:
//!
//! ```text
//!              ┌────────────── fetch task ──────────────┐
//!  ping store ─┤ source pages ─▶ {index}-raw + marker   ├─▶ join ─▶ Done
//!              │ raw pages ─▶ identity ─▶ {index} + mk  │
//!              └────────────── enrich task ─────────────┘
//! ```
//!
//! Each phase:
//!
//! 1. resolves its resume point from the checkpoint store
//! 2. requests one page at a time, in upstream order
//! 3. flushes every non-empty page as one write batch whose tail is the
//!    phase marker (the newest `updated_at` flushed so far)
//! 4. follows the upstream cursor; without one, a full page triggers one
//!    more fetch at [`Cursor::Offset`] to tell "exactly full" from "more"
//! 5. stops on an empty or short page without cursor, or on the first error
//!
//! There is no cancellation: a phase runs to completion or to its first
//! fatal error, and the other phase is still awaited.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::SyncError;
use crate::identity::{IdentityCache, IdentityKey, IdentityService};
use crate::models::{BulkItem, EnrichedRecord, Identity, Phase, RawRecord, WriteBatch};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::recovery::RecoverySink;
use crate::source::{Cursor, PageRequest};
use crate::store::{DocumentStore, ScanFrom};
use crate::traits::Connector;
use crate::writer::{BatchWriter, FlushOutcome, WriterSettings};

/// Observable lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    Enriching,
    Done,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Page size of the fetch phase.
    pub fetch_size: usize,
    /// Page size of the enrich phase.
    pub enrich_size: usize,
    pub writer: WriterSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_size: 1000,
            enrich_size: 1000,
            writer: WriterSettings::default(),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub fetch: bool,
    pub enrich: bool,
    /// Ignore stored markers when choosing where to start reading.
    pub full: bool,
    /// Lower bound used when no marker exists.
    pub from: Option<DateTime<Utc>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch: true,
            enrich: true,
            full: false,
            from: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    /// Page requests issued, including the final empty one.
    pub pages: usize,
    /// Records written.
    pub records: usize,
    /// Upstream items dropped as malformed.
    pub skipped: usize,
    /// Successful write batches.
    pub flushes: usize,
    /// Marker written by the last successful batch.
    pub marker: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub fetch: Option<PhaseReport>,
    pub enrich: Option<PhaseReport>,
}

// ═══════════════════════════════════════════════════════════════════════
// Phase sources
// ═══════════════════════════════════════════════════════════════════════

/// One page of work already mapped to documents for the phase's target.
struct PhasePage {
    items: Vec<BulkItem>,
    newest: Option<DateTime<Utc>>,
    /// Items upstream delivered, including skipped ones.
    fetched: usize,
    skipped: usize,
    next_cursor: Option<Cursor>,
}

#[async_trait]
trait PhaseSource: Send {
    fn target_index(&self) -> String;

    fn target_mapping(&self) -> Value;

    async fn next_page(&mut self, request: &PageRequest) -> Result<PhasePage>;
}

/// Fetch phase: upstream pages become raw documents.
struct FetchSource {
    connector: Arc<dyn Connector>,
}

#[async_trait]
impl PhaseSource for FetchSource {
    fn target_index(&self) -> String {
        self.connector.raw_index()
    }

    fn target_mapping(&self) -> Value {
        self.connector.raw_mapping()
    }

    async fn next_page(&mut self, request: &PageRequest) -> Result<PhasePage> {
        let page = self.connector.fetch_page(request).await?;
        let fetched = page.fetched();
        let index = self.connector.raw_index();

        let mut items = Vec::with_capacity(page.records.len());
        let mut newest: Option<DateTime<Utc>> = None;
        let mut skipped = page.skipped;
        for record in page.records {
            match serde_json::to_value(&record) {
                Ok(data) => {
                    newest = Some(newest.map_or(record.updated_at, |n| n.max(record.updated_at)));
                    items.push(BulkItem {
                        index: index.clone(),
                        id: record.uuid,
                        data,
                    });
                }
                Err(e) => {
                    warn!(uuid = %record.uuid, error = %e, "skipping unserializable record");
                    skipped += 1;
                }
            }
        }

        Ok(PhasePage {
            items,
            newest,
            fetched,
            skipped,
            next_cursor: page.next_cursor,
        })
    }
}

/// Enrich phase: raw documents become enriched documents.
///
/// Raw documents are read by keyset: after each page the position moves to
/// the last `(updated_at, id)` read, so the engine's offset cursor is only a
/// "keep going" signal here.
struct EnrichSource {
    connector: Arc<dyn Connector>,
    store: Arc<dyn DocumentStore>,
    cache: IdentityCache,
    position: Option<ScanFrom>,
}

impl EnrichSource {
    async fn enrich(&mut self, raw: &RawRecord) -> Result<EnrichedRecord> {
        let identity = match self.connector.author(raw) {
            Some(author) => {
                let key = IdentityKey::from_handle(&author.handle);
                self.cache
                    .resolve(&key, raw.updated_at, author.automated)
                    .await
            }
            None => Identity::unknown(false),
        };
        let fields = self.connector.enrich_fields(raw)?;
        Ok(EnrichedRecord::new(raw, &identity, fields))
    }
}

#[async_trait]
impl PhaseSource for EnrichSource {
    fn target_index(&self) -> String {
        self.connector.enriched_index()
    }

    fn target_mapping(&self) -> Value {
        self.connector.enriched_mapping()
    }

    async fn next_page(&mut self, request: &PageRequest) -> Result<PhasePage> {
        let from = self
            .position
            .clone()
            .unwrap_or_else(|| ScanFrom::at(request.since));
        let raw_index = self.connector.raw_index();
        let docs = self
            .store
            .scan(&raw_index, "updated_at", &from, request.limit)
            .await
            .with_context(|| format!("Failed to read raw records from '{}'", raw_index))?;
        if let Some(last) = docs.last() {
            self.position = Some(ScanFrom::after(last));
        }

        let fetched = docs.len();
        let index = self.connector.enriched_index();
        let mut items = Vec::with_capacity(fetched);
        let mut newest: Option<DateTime<Utc>> = None;
        let mut skipped = 0;

        for doc in docs {
            let raw: RawRecord = match serde_json::from_value(doc.body) {
                Ok(r) => r,
                Err(e) => {
                    warn!(id = %doc.id, error = %e, "skipping malformed raw record");
                    skipped += 1;
                    continue;
                }
            };
            let enriched = match self.enrich(&raw).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(uuid = %raw.uuid, error = %e, "skipping record that failed to enrich");
                    skipped += 1;
                    continue;
                }
            };
            let data = match serde_json::to_value(&enriched) {
                Ok(d) => d,
                Err(e) => {
                    warn!(uuid = %raw.uuid, error = %e, "skipping unserializable enriched record");
                    skipped += 1;
                    continue;
                }
            };
            newest = Some(newest.map_or(raw.updated_at, |n| n.max(raw.updated_at)));
            items.push(BulkItem {
                index: index.clone(),
                id: enriched.uuid,
                data,
            });
        }

        Ok(PhasePage {
            items,
            newest,
            fetched,
            skipped,
            next_cursor: None,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Phase loop
// ═══════════════════════════════════════════════════════════════════════

struct PhaseContext {
    phase: Phase,
    label: String,
    checkpoints: CheckpointStore,
    writer: BatchWriter,
    page_size: usize,
    from: Option<DateTime<Utc>>,
    full: bool,
    progress: Arc<dyn SyncProgressReporter>,
}

async fn run_phase<S: PhaseSource>(mut source: S, ctx: PhaseContext) -> Result<PhaseReport> {
    let stream = ctx.phase.as_str();
    let target = source.target_index();
    let resume = ctx
        .checkpoints
        .resolve_from(stream, &target, ctx.from, ctx.full)
        .await?;

    info!(
        connector = %ctx.label,
        phase = stream,
        since = %resume.since,
        origin = ?resume.origin,
        "phase started"
    );
    ctx.progress.report(SyncProgressEvent::PhaseStarted {
        connector: ctx.label.clone(),
        phase: ctx.phase,
    });

    let mut report = PhaseReport::default();
    let mut mark = resume.floor;
    let mut seen = 0usize;
    let mut request = PageRequest {
        stream: stream.to_string(),
        since: resume.since,
        cursor: None,
        limit: ctx.page_size,
    };

    loop {
        let page = source
            .next_page(&request)
            .await
            .with_context(|| format!("{} page request failed for {}", stream, ctx.label))?;
        report.pages += 1;
        report.skipped += page.skipped;
        seen += page.fetched;

        if !page.items.is_empty() {
            let newest = page.newest.map_or(mark, |n| n.max(mark));
            let count = page.items.len();
            let batch = WriteBatch::new(page.items, ctx.checkpoints.marker_item(stream, newest));

            match ctx.writer.flush(batch).await? {
                FlushOutcome::Written { .. } => {
                    mark = newest;
                    report.flushes += 1;
                    report.records += count;
                    report.marker = Some(mark);
                    ctx.progress.report(SyncProgressEvent::PageFlushed {
                        connector: ctx.label.clone(),
                        phase: ctx.phase,
                        records: report.records as u64,
                    });
                }
                FlushOutcome::Diverted { items } => {
                    return Err(SyncError::Diverted {
                        phase: stream.to_string(),
                        stream: ctx.label.clone(),
                        items,
                    }
                    .into());
                }
            }
        }

        // An empty page ends the phase unless upstream handed back a cursor.
        request.cursor = match page.next_cursor {
            Some(cursor) => Some(cursor),
            None if page.fetched > 0 && page.fetched >= ctx.page_size => {
                Some(Cursor::Offset(seen))
            }
            None => break,
        };
    }

    info!(
        connector = %ctx.label,
        phase = stream,
        records = report.records,
        flushes = report.flushes,
        skipped = report.skipped,
        "phase finished"
    );
    ctx.progress.report(SyncProgressEvent::PhaseDone {
        connector: ctx.label.clone(),
        phase: ctx.phase,
        records: report.records as u64,
    });
    Ok(report)
}

async fn await_phase(
    phase: Phase,
    handle: Option<JoinHandle<Result<PhaseReport>>>,
) -> Result<Option<PhaseReport>> {
    let Some(handle) = handle else {
        return Ok(None);
    };
    match handle.await {
        Ok(Ok(report)) => Ok(Some(report)),
        Ok(Err(e)) if e.is::<SyncError>() => Err(e),
        Ok(Err(e)) => Err(SyncError::PhaseFailed {
            phase: phase.to_string(),
            source: e,
        }
        .into()),
        Err(_) => Err(SyncError::PhasePanicked(phase.to_string()).into()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════

/// Runs fetch and enrich for one connector.
///
/// A fresh [`IdentityCache`] is created for every [`run`](SyncEngine::run),
/// so nothing learned about identities outlives the invocation.
pub struct SyncEngine {
    connector: Arc<dyn Connector>,
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityService>,
    recovery: Arc<dyn RecoverySink>,
    settings: SyncSettings,
    progress: Arc<dyn SyncProgressReporter>,
    state: watch::Sender<SyncState>,
}

impl SyncEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityService>,
        recovery: Arc<dyn RecoverySink>,
        settings: SyncSettings,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            connector,
            store,
            identity,
            recovery,
            settings,
            progress: Arc::new(NoProgress),
            state,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Watch state transitions of this engine.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    fn phase_context(&self, phase: Phase, page_size: usize, target: &str, target_mapping: Value, options: &SyncOptions) -> PhaseContext {
        let checkpoints = CheckpointStore::new(self.store.clone(), self.connector.index());
        let mut writer = BatchWriter::new(
            self.store.clone(),
            self.recovery.clone(),
            self.settings.writer.clone(),
        );
        writer.register_mapping(target, target_mapping);
        writer.register_mapping(checkpoints.collection(), CheckpointStore::mapping());

        PhaseContext {
            phase,
            label: self.connector.source_label(),
            checkpoints,
            writer,
            page_size,
            from: options.from,
            full: options.full,
            progress: self.progress.clone(),
        }
    }

    /// Run one invocation. Returns the first phase error, fetch first.
    pub async fn run(&self, options: SyncOptions) -> Result<SyncReport> {
        self.store
            .ping()
            .await
            .context("Store is not reachable; no phase was started")?;

        let fetch_task = if options.fetch {
            let source = FetchSource {
                connector: self.connector.clone(),
            };
            let ctx = self.phase_context(
                Phase::Fetch,
                self.settings.fetch_size,
                &source.target_index(),
                source.target_mapping(),
                &options,
            );
            self.state.send_replace(SyncState::Fetching);
            Some(tokio::spawn(run_phase(source, ctx)))
        } else {
            None
        };

        let enrich_task = if options.enrich {
            let source = EnrichSource {
                connector: self.connector.clone(),
                store: self.store.clone(),
                cache: IdentityCache::new(self.identity.clone()),
                position: None,
            };
            let ctx = self.phase_context(
                Phase::Enrich,
                self.settings.enrich_size,
                &source.target_index(),
                source.target_mapping(),
                &options,
            );
            self.state.send_replace(SyncState::Enriching);
            Some(tokio::spawn(run_phase(source, ctx)))
        } else {
            None
        };

        let (fetch, enrich) = tokio::join!(
            await_phase(Phase::Fetch, fetch_task),
            await_phase(Phase::Enrich, enrich_task)
        );

        let report = SyncReport {
            fetch: fetch?,
            enrich: enrich?,
        };
        self.state.send_replace(SyncState::Done);
        Ok(report)
    }
}
