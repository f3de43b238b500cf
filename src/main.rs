//! # Bulk Sync CLI (`bsync`)
//!
//! ## Usage
//!
//! ```bash
//! bsync --config ./config/bsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bsync init` | Prepare the document store (SQLite: create file and run migrations) |
//! | `bsync connectors` | List configured connectors |
//! | `bsync sync <connector>` | Run fetch and enrich for one or more connectors |
//!
//! ## Examples
//!
//! ```bash
//! # Incremental sync of one CircleCI project
//! bsync sync circleci:app
//!
//! # Re-read everything since a date, fetch phase only
//! bsync sync circleci --full --from 2024-01-01 --fetch-only
//!
//! # Verbose engine logs
//! RUST_LOG=bulk_sync=debug bsync sync all
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use bulk_sync::config;
use bulk_sync::ingest::{self, SyncArgs};
use bulk_sync::progress::ProgressMode;

/// Bulk Sync CLI: incremental fetch and enrichment of upstream records.
#[derive(Parser)]
#[command(
    name = "bsync",
    about = "Incremental bulk-sync of paginated upstream APIs into a document store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the document store. Safe to run repeatedly.
    Init,

    /// List configured connectors.
    Connectors,

    /// Run a sync.
    ///
    /// Connector format: `all`, `<type>`, or `<type>:<name>`.
    Sync {
        connector: String,

        /// Ignore stored checkpoints and read from `--from` (or the epoch).
        #[arg(long)]
        full: bool,

        /// Lower bound when no checkpoint exists (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        from: Option<String>,

        /// Run only the fetch phase.
        #[arg(long, conflicts_with = "enrich_only")]
        fetch_only: bool,

        /// Run only the enrich phase.
        #[arg(long)]
        enrich_only: bool,

        /// Progress output on stderr: off, human, json.
        /// Defaults to human when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            ingest::run_init(&cfg).await?;
        }
        Commands::Connectors => {
            ingest::list_connectors(&cfg)?;
        }
        Commands::Sync {
            connector,
            full,
            from,
            fetch_only,
            enrich_only,
            progress,
        } => {
            let progress = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(v) => match ProgressMode::parse(v) {
                    Some(mode) => mode,
                    None => bail!("Invalid --progress value '{}': use off, human, or json", v),
                },
            };
            let args = SyncArgs {
                connector,
                full,
                from,
                fetch_only,
                enrich_only,
                progress,
            };
            ingest::run_sync(&cfg, &args).await?;
        }
    }

    Ok(())
}
