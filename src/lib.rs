//! # Bulk Sync
//!
//! An incremental bulk-sync engine: it copies records from paginated
//! upstream APIs into a document store, then derives enriched documents
//! annotated with author identity and affiliation.
//!
//! Each sync runs two phases for one connector:
//!
//! - **fetch** pulls upstream pages and writes raw records to `{index}-raw`
//! - **enrich** reads raw records back, resolves authors through a
//!   per-invocation identity cache, and writes `{index}`
//!
//! Both phases resume from a checkpoint marker that is written in the same
//! bulk request as the records it covers, so a marker never runs ahead of
//! the data.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Connectors  │──▶│  SyncEngine   │──▶│ DocumentStore│
//! │  CircleCI   │   │ fetch+enrich  │   │ SQLite / ES  │
//! └─────────────┘   └──────┬────────┘   └──────────────┘
//!                          │
//!              ┌───────────┼─────────────┐
//!              ▼           ▼             ▼
//!        ┌──────────┐ ┌──────────┐ ┌──────────┐
//!        │ Identity │ │  Batch   │ │ Recovery │
//!        │  Cache   │ │  Writer  │ │   Sink   │
//!        └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bsync init                       # prepare the store
//! bsync connectors                 # list configured connectors
//! bsync sync circleci:app          # incremental sync of one connector
//! bsync sync all --full            # ignore checkpoints
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed store and sync errors |
//! | [`ids`] | Stable record identifiers |
//! | [`http`] | Retrying HTTP client |
//! | [`source`] | Cursors and pages |
//! | [`traits`] | Connector trait and registry |
//! | [`connector_circleci`] | CircleCI connector |
//! | [`store`] | Document store abstraction (SQLite, Elasticsearch, memory) |
//! | [`checkpoint`] | Resume markers |
//! | [`identity`] | Identity service and cache |
//! | [`writer`] | Chunked bulk writes with retry and diversion |
//! | [`recovery`] | Recovery sink for undeliverable documents |
//! | [`sync`] | Fetch/enrich orchestration |
//! | [`progress`] | Progress reporting |
//! | [`ingest`] | CLI command drivers |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |

pub mod checkpoint;
pub mod config;
pub mod connector_circleci;
pub mod db;
pub mod error;
pub mod http;
pub mod identity;
pub mod ids;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod recovery;
pub mod source;
pub mod store;
pub mod sync;
pub mod traits;
pub mod writer;
