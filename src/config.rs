use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::SyncSettings;
use crate::writer::WriterSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub fetch_size: usize,
    #[serde(default = "default_page_size")]
    pub enrich_size: usize,
    #[serde(default = "default_page_size")]
    pub max_write_size: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub http_retries: u32,
    #[serde(default)]
    pub from_date: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_size: 1000,
            enrich_size: 1000,
            max_write_size: 1000,
            retries: 3,
            retry_delay_secs: 5,
            http_timeout_secs: 60,
            http_retries: 3,
            from_date: None,
        }
    }
}

fn default_page_size() -> usize {
    1000
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_http_timeout_secs() -> u64 {
    60
}

impl SyncConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            fetch_size: self.fetch_size,
            enrich_size: self.enrich_size,
            writer: WriterSettings {
                max_write_size: self.max_write_size,
                retries: self.retries,
                retry_delay: Duration::from_secs(self.retry_delay_secs),
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    pub base_url: String,
    pub project_slug: String,
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub url: String,
    #[serde(default)]
    pub token_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(default)]
    pub circleci: BTreeMap<String, CircleCiConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircleCiConnectorConfig {
    /// Project slug, e.g. `gh/org/repo`.
    pub project: String,
    pub index: String,
    #[serde(default = "default_circleci_token_env")]
    pub token_env: String,
    #[serde(default = "default_circleci_api_url")]
    pub api_url: String,
}

fn default_circleci_token_env() -> String {
    "CIRCLECI_TOKEN".to_string()
}
fn default_circleci_api_url() -> String {
    "https://circleci.com/api/v2".to_string()
}

/// Parse `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected YYYY-MM-DD or RFC 3339", value))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .with_context(|| format!("Invalid date '{}'", value))
}

/// Read a secret from the environment variable named in the config.
pub fn env_secret(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("Environment variable {} is not set", var))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate store
    match config.store.backend.as_str() {
        "sqlite" => {
            if config.store.path.is_none() {
                anyhow::bail!("store.path is required for the sqlite backend");
            }
        }
        "elastic" => {
            if config.store.url.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("store.url is required for the elastic backend");
            }
        }
        "memory" => {}
        other => anyhow::bail!(
            "Unknown store backend: '{}'. Must be sqlite, elastic, or memory.",
            other
        ),
    }

    // Validate sync sizes
    if config.sync.fetch_size == 0 {
        anyhow::bail!("sync.fetch_size must be > 0");
    }
    if config.sync.enrich_size == 0 {
        anyhow::bail!("sync.enrich_size must be > 0");
    }
    if config.sync.max_write_size == 0 {
        anyhow::bail!("sync.max_write_size must be > 0");
    }
    if let Some(ref from) = config.sync.from_date {
        parse_date(from).context("sync.from_date")?;
    }

    // Validate connectors
    for (name, cc) in &config.connectors.circleci {
        if cc.project.trim().is_empty() {
            anyhow::bail!("connectors.circleci.{}.project must not be empty", name);
        }
        if cc.index.trim().is_empty() {
            anyhow::bail!("connectors.circleci.{}.index must not be empty", name);
        }
    }

    Ok(config)
}
