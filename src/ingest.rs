//! Command drivers for `bsync`.
//!
//! Builds the collaborators named in the config (store, identity service,
//! recovery sink, connectors) and runs one [`SyncEngine`] per selected
//! connector, one after another. Output follows the same shape for every
//! connector: a header line, indented counters, and a trailing `ok`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{env_secret, parse_date, Config};
use crate::http::HttpClient;
use crate::identity::{AffiliationClient, DisabledIdentityService, IdentityService};
use crate::progress::ProgressMode;
use crate::recovery::{HttpRecoverySink, NoRecoverySink, RecoverySink};
use crate::store::elastic::ElasticStore;
use crate::store::memory::InMemoryStore;
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;
use crate::sync::{PhaseReport, SyncEngine, SyncOptions};
use crate::traits::ConnectorRegistry;

/// Flags of `bsync sync`.
#[derive(Debug, Clone)]
pub struct SyncArgs {
    pub connector: String,
    pub full: bool,
    pub from: Option<String>,
    pub fetch_only: bool,
    pub enrich_only: bool,
    pub progress: ProgressMode,
}

fn http_client(config: &Config) -> Result<HttpClient> {
    HttpClient::new(config.sync.http_timeout(), config.sync.http_retries)
}

fn optional_secret(var: &Option<String>) -> Result<Option<String>> {
    var.as_deref().map(env_secret).transpose()
}

/// Open the document store selected by `store.backend`.
pub async fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    let store: Arc<dyn DocumentStore> = match config.store.backend.as_str() {
        "sqlite" => {
            let path = config
                .store
                .path
                .as_deref()
                .context("store.path is required for the sqlite backend")?;
            Arc::new(SqliteStore::open(path).await?)
        }
        "elastic" => {
            let url = config
                .store
                .url
                .as_deref()
                .context("store.url is required for the elastic backend")?;
            let mut store = ElasticStore::new(http_client(config)?, url);
            if let Some(ref username) = config.store.username {
                let password = optional_secret(&config.store.password_env)?.unwrap_or_default();
                store = store.with_basic_auth(username, &password);
            }
            Arc::new(store)
        }
        "memory" => Arc::new(InMemoryStore::new()),
        other => bail!("Unknown store backend: '{}'", other),
    };
    Ok(store)
}

pub fn identity_service(config: &Config) -> Result<Arc<dyn IdentityService>> {
    match config.identity {
        Some(ref cfg) => {
            let token = optional_secret(&cfg.token_env)?;
            Ok(Arc::new(AffiliationClient::new(
                http_client(config)?,
                &cfg.base_url,
                &cfg.project_slug,
                token,
            )))
        }
        None => Ok(Arc::new(DisabledIdentityService)),
    }
}

pub fn recovery_sink(config: &Config) -> Result<Arc<dyn RecoverySink>> {
    match config.recovery {
        Some(ref cfg) => {
            let token = optional_secret(&cfg.token_env)?;
            Ok(Arc::new(HttpRecoverySink::new(
                http_client(config)?,
                &cfg.url,
                token,
            )))
        }
        None => Ok(Arc::new(NoRecoverySink)),
    }
}

/// `bsync init`: make sure the store is reachable. For SQLite this also
/// creates the database file and runs migrations.
pub async fn run_init(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    store.ping().await.context("Store is not reachable")?;
    println!("store: {} ready", config.store.backend);
    println!("ok");
    Ok(())
}

/// `bsync connectors`: list configured connectors and their indices.
pub fn list_connectors(config: &Config) -> Result<()> {
    let registry = ConnectorRegistry::from_config(config)?;
    if registry.is_empty() {
        println!("No connectors configured.");
        return Ok(());
    }
    println!("{:<28} {:<32} DESCRIPTION", "CONNECTOR", "INDEX");
    for c in registry.connectors() {
        println!("{:<28} {:<32} {}", c.source_label(), c.index(), c.description());
    }
    Ok(())
}

/// `bsync sync <connector>`.
pub async fn run_sync(config: &Config, args: &SyncArgs) -> Result<()> {
    if args.fetch_only && args.enrich_only {
        bail!("--fetch-only and --enrich-only are mutually exclusive");
    }
    let from: Option<DateTime<Utc>> = match args.from.as_deref().or(config.sync.from_date.as_deref()) {
        Some(s) => Some(parse_date(s)?),
        None => None,
    };

    let registry = ConnectorRegistry::from_config(config)?;
    let selected = registry.resolve(&args.connector);
    if selected.is_empty() {
        bail!(
            "No connector matches '{}'. Use `all`, a type, or <type>:<name> (see `bsync connectors`).",
            args.connector
        );
    }

    let store = open_store(config).await?;
    let identity = identity_service(config)?;
    let recovery = recovery_sink(config)?;
    let progress = args.progress.reporter();

    let options = SyncOptions {
        fetch: !args.enrich_only,
        enrich: !args.fetch_only,
        full: args.full,
        from,
    };

    for connector in selected {
        let label = connector.source_label();
        let engine = SyncEngine::new(
            connector,
            store.clone(),
            identity.clone(),
            recovery.clone(),
            config.sync.settings(),
        )
        .with_progress(progress.clone());

        let report = engine
            .run(options.clone())
            .await
            .with_context(|| format!("sync {} failed", label))?;

        println!("sync {}", label);
        print_phase("fetch", report.fetch.as_ref());
        print_phase("enrich", report.enrich.as_ref());
    }
    println!("ok");
    Ok(())
}

fn print_phase(name: &str, report: Option<&PhaseReport>) {
    let Some(r) = report else {
        println!("  {}: skipped", name);
        return;
    };
    println!("  {} records written: {}", name, r.records);
    println!("  {} items skipped: {}", name, r.skipped);
    println!("  {} batches: {}", name, r.flushes);
    match r.marker {
        Some(m) => println!("  {} checkpoint: {}", name, m.to_rfc3339()),
        None => println!("  {} checkpoint: unchanged", name),
    }
}
