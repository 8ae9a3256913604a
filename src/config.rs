//! TOML configuration.
//!
//! Every section except `[db]` and `[server]` is optional and falls back to
//! the defaults below. [`load_config`] parses and validates the file; tests
//! build a [`Config`] directly with `toml::from_str`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Sources declared in the config file, keyed by source id.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Upper bound on concurrently running syncs across all sources.
    #[serde(default = "default_max_active_syncs")]
    pub max_active_syncs: usize,
}

fn default_max_active_syncs() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    /// Payloads at or below this size are stored inline in SQLite.
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,
    #[serde(default = "default_true")]
    pub dedup: bool,
    /// Root directory of the external object store. Absent means inline only.
    #[serde(default)]
    pub object_store_path: Option<PathBuf>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: default_inline_threshold(),
            dedup: true,
            object_store_path: None,
        }
    }
}

fn default_inline_threshold() -> usize {
    64 * 1024
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_lease_renew_secs")]
    pub lease_renew_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            consumers: default_consumers(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            lease_renew_secs: default_lease_renew_secs(),
        }
    }
}

fn default_queue_max_retries() -> i64 {
    3
}
fn default_consumers() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_retry_interval_secs() -> u64 {
    300
}
fn default_lease_renew_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_reaper_interval() -> u64 {
    60
}
fn default_stale_after() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval(),
            grace_period_secs: default_grace_period(),
            batch_size: default_gc_batch_size(),
        }
    }
}

fn default_gc_interval() -> u64 {
    3600
}
fn default_grace_period() -> u64 {
    7 * 24 * 3600
}
fn default_gc_batch_size() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Connectors checkpoint after this many emitted documents.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

fn default_checkpoint_every() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// How often `serve` looks for sources due for a scheduled sync.
    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,
    /// A running sync with no activity for this long is failed as timed out.
    #[serde(default = "default_stale_sync_timeout")]
    pub stale_sync_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scheduler_interval(),
            stale_sync_timeout_secs: default_stale_sync_timeout(),
        }
    }
}

fn default_scheduler_interval() -> u64 {
    60
}
fn default_stale_sync_timeout() -> u64 {
    1800
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            chunk_max_tokens: 700,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_chunk_max_tokens() -> usize {
    700
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_min_batch")]
    pub min_batch_size: i64,
    #[serde(default = "default_max_batch")]
    pub max_batch_size: i64,
    #[serde(default = "default_accumulation_timeout")]
    pub accumulation_timeout_secs: u64,
    #[serde(default = "default_batch_poll")]
    pub poll_interval_secs: u64,
    /// Root of the object store holding batch input/output files.
    /// Absent means an in-memory store.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch(),
            max_batch_size: default_max_batch(),
            accumulation_timeout_secs: default_accumulation_timeout(),
            poll_interval_secs: default_batch_poll(),
            storage_path: None,
        }
    }
}

fn default_min_batch() -> i64 {
    1
}
fn default_max_batch() -> i64 {
    500
}
fn default_accumulation_timeout() -> u64 {
    300
}
fn default_batch_poll() -> u64 {
    30
}

/// A source declared in `[sources.<id>]`.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Connector type that syncs this source (e.g. `"filesystem"`).
    pub connector: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_object")]
    pub config: serde_json::Value,
    #[serde(default = "default_object")]
    pub credentials: serde_json::Value,
    /// Sync this source every N seconds while `serve` runs.
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
}

fn default_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.queue.consumers == 0 {
        anyhow::bail!("queue.consumers must be >= 1");
    }
    if config.queue.max_retries < 1 {
        anyhow::bail!("queue.max_retries must be >= 1");
    }

    // A live worker renews its claim every lease_renew_secs; the reaper must
    // never see a renewed claim as stale.
    if config.reaper.stale_after_secs <= config.queue.lease_renew_secs {
        anyhow::bail!(
            "reaper.stale_after_secs ({}) must exceed queue.lease_renew_secs ({})",
            config.reaper.stale_after_secs,
            config.queue.lease_renew_secs
        );
    }

    if config.scheduler.interval_secs == 0 || config.scheduler.stale_sync_timeout_secs == 0 {
        anyhow::bail!("scheduler.interval_secs and scheduler.stale_sync_timeout_secs must be > 0");
    }
    for (id, source) in &config.sources {
        if source.sync_interval_secs == Some(0) {
            anyhow::bail!("sources.{}.sync_interval_secs must be > 0", id);
        }
    }

    if config.gc.batch_size < 1 {
        anyhow::bail!("gc.batch_size must be >= 1");
    }

    if config.batch.min_batch_size < 1 || config.batch.min_batch_size > config.batch.max_batch_size
    {
        anyhow::bail!("batch.min_batch_size must be in [1, batch.max_batch_size]");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.chunk_max_tokens == 0 {
            anyhow::bail!("embedding.chunk_max_tokens must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}
