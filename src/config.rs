use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub metadata_write: MetadataWriteConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on jobs queued in one cycle, shared across all providers.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Jobs executed concurrently. Work is dominated by subprocess and file
    /// I/O, so one is usually enough.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_max_queue_size() -> usize {
    2000
}

fn default_workers() -> usize {
    1
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            workers: default_workers(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataWriteConfig {
    /// Minimum age of a pending operation before it is eligible for write-back.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Maximum pending operations pulled into one conflation pass.
    #[serde(default = "default_write_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_exiftool_path")]
    pub exiftool_path: PathBuf,

    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Days a Written/Discarded/Failed operation is kept before it is swept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_debounce_secs() -> u64 {
    30
}

fn default_write_batch_size() -> usize {
    500
}

fn default_exiftool_path() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_retention_days() -> u32 {
    30
}

impl Default for MetadataWriteConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            batch_size: default_write_batch_size(),
            exiftool_path: default_exiftool_path(),
            tool_timeout_secs: default_tool_timeout_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl MetadataWriteConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Sliding expiry for cached image aggregates.
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,

    /// Most-recently-modified images loaded at startup.
    #[serde(default = "default_warmup_count")]
    pub warmup_count: usize,
}

fn default_ttl_days() -> u64 {
    7
}

fn default_warmup_count() -> usize {
    2000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            warmup_count: default_warmup_count(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days.saturating_mul(24 * 60 * 60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_indexing_enabled")]
    pub enabled: bool,

    #[serde(default = "default_indexing_batch_size")]
    pub batch_size: usize,
}

fn default_indexing_enabled() -> bool {
    true
}

fn default_indexing_batch_size() -> usize {
    200
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            enabled: default_indexing_enabled(),
            batch_size: default_indexing_batch_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photovault")
        .join("photovault.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scheduler: SchedulerConfig::default(),
            metadata_write: MetadataWriteConfig::default(),
            cache: CacheConfig::default(),
            indexing: IndexingConfig::default(),
        }
    }
}

impl Config {
    /// Load from `PHOTOVAULT_CONFIG` or the default location, writing a
    /// default file if none exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photovault")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PHOTOVAULT_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
