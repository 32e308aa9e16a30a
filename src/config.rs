//! TOML configuration.
//!
//! Loaded once by the CLI with [`load_config`]. Every section except
//! `[db]` is optional and falls back to the defaults below.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use corpus_sync_core::acl::StaticDirectory;
use corpus_sync_core::chunk::ChunkingOptions;
use corpus_sync_core::models::Principal;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub libraries: BTreeMap<String, LibraryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_boundary_window")]
    pub boundary_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            boundary_window: default_boundary_window(),
        }
    }
}

impl ChunkingConfig {
    pub fn options(&self) -> ChunkingOptions {
        ChunkingOptions {
            max_chunk_size: self.max_chunk_size,
            overlap: self.chunk_overlap,
            boundary_window: self.boundary_window,
        }
    }
}

fn default_max_chunk_size() -> usize {
    corpus_sync_core::chunk::DEFAULT_MAX_CHUNK_SIZE
}
fn default_chunk_overlap() -> usize {
    corpus_sync_core::chunk::DEFAULT_CHUNK_OVERLAP
}
fn default_boundary_window() -> usize {
    corpus_sync_core::chunk::DEFAULT_BOUNDARY_WINDOW
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_failure_tolerance")]
    pub failure_tolerance_fraction: f64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms", alias = "retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_tolerance_fraction: default_failure_tolerance(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            publish_batch_size: default_publish_batch_size(),
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: true,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}
fn default_failure_tolerance() -> f64 {
    0.1
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_publish_batch_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default, alias = "embedding_enabled")]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Base URL. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the API key (OpenAI-compatible only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AclConfig {
    /// Static principal expansions, e.g. `"group:finance" = ["user:carol"]`.
    /// Without it principals pass through unchanged.
    #[serde(default)]
    pub directory: Option<BTreeMap<String, Vec<String>>>,
}

impl AclConfig {
    pub fn static_directory(&self) -> Result<Option<StaticDirectory>> {
        let Some(table) = &self.directory else {
            return Ok(None);
        };
        let mut dir = StaticDirectory::new();
        for (principal, members) in table {
            let principal = parse_principal(principal, "acl.directory")?;
            let members = members
                .iter()
                .map(|m| parse_principal(m, "acl.directory"))
                .collect::<Result<Vec<_>>>()?;
            dir.insert(&principal, members);
        }
        Ok(Some(dir))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// A local directory synced as one document library.
#[derive(Debug, Deserialize, Clone)]
pub struct LibraryConfig {
    /// Library identity in records and state. Defaults to the table name.
    #[serde(default)]
    pub library_id: Option<String>,
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Readers of files without an `.acl.json` sidecar.
    #[serde(default)]
    pub default_acl: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl LibraryConfig {
    pub fn resolved_id(&self, name: &str) -> String {
        self.library_id.clone().unwrap_or_else(|| name.to_string())
    }

    pub fn default_principals(&self) -> Result<Vec<Principal>> {
        self.default_acl
            .iter()
            .map(|p| parse_principal(p, "default_acl"))
            .collect()
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

fn parse_principal(raw: &str, field: &str) -> Result<Principal> {
    raw.parse::<Principal>()
        .map_err(|e| anyhow::anyhow!("{}: {}", field, e))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if let Err(e) = config.chunking.options().validate() {
        bail!("chunking: {}", e);
    }

    // Validate sync
    let sync = &config.sync;
    if sync.max_concurrency == 0 {
        bail!("sync.max_concurrency must be >= 1");
    }
    if !(0.0..=1.0).contains(&sync.failure_tolerance_fraction) {
        bail!("sync.failure_tolerance_fraction must be in [0.0, 1.0]");
    }
    if sync.retry_max_attempts == 0 {
        bail!("sync.retry_max_attempts must be >= 1");
    }
    if sync.retry_base_delay_ms > sync.retry_max_delay_ms {
        bail!("sync.retry_base_delay_ms must not exceed sync.retry_max_delay_ms");
    }
    if sync.call_timeout_secs == 0 {
        bail!("sync.call_timeout_secs must be >= 1");
    }
    if sync.publish_batch_size == 0 {
        bail!("sync.publish_batch_size must be >= 1");
    }

    // Validate embedding
    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }
    if embedding.enabled {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when embedding is enabled (provider '{}')",
                embedding.provider
            );
        }
        if embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when embedding is enabled (provider '{}')",
                embedding.provider
            );
        }
        if embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
    }

    // Validate logging
    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => bail!("logging.format must be pretty or json, got '{}'", other),
    }

    // Validate ACL directory and libraries
    config.acl.static_directory()?;
    let mut ids = HashSet::new();
    for (name, lib) in &config.libraries {
        lib.default_principals()
            .with_context(|| format!("libraries.{}", name))?;
        if !ids.insert(lib.resolved_id(name)) {
            bail!("libraries.{}: duplicate library_id '{}'", name, lib.resolved_id(name));
        }
    }

    Ok(config)
}
