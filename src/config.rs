//! Runtime configuration for disk-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All store knobs (paths, capacities, sampling, compression) live here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "disk-tier", about = "Inspect and operate a persistent disk-tier cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "disk-tier.json")]
    pub config: PathBuf,

    /// Override the store directory from the configuration file.
    #[arg(short, long)]
    pub directory: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store a value.
    Put {
        key: String,
        value: String,
        /// Expire the entry after this many seconds.
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Print a value.
    Get { key: String },
    /// Remove a value.
    Remove { key: String },
    /// List every key.
    Keys,
    /// Run an expiry sweep.
    Expire,
    /// Print store metrics in Prometheus text format.
    Stats,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store layout and capacities.
    pub store: StoreConfig,

    /// Eviction sampling.
    pub eviction: EvictionConfig,

    /// Compression of on-disk records.
    pub compression: CompressionConfig,
}

/// Store layout, capacity and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the data and index files.
    pub directory: PathBuf,

    /// File stem: `<name>.data` and `<name>.index`.
    pub name: String,

    /// Keep data across restarts (index file + caching markers).
    pub persistent: bool,

    /// Number of data file handles, rounded up to a power of two.
    pub stripes: usize,

    /// Maximum entries held in memory (0 = unbounded).
    pub memory_capacity: usize,

    /// Maximum entries held on disk (0 = unbounded).
    pub disk_capacity: usize,

    /// Period of the background expiry sweep in ms (0 disables it).
    pub expiry_interval_ms: u64,

    /// Byte budget behind `is_write_queue_full`.
    pub write_queue_budget_bytes: usize,

    /// Drop cached copies when the index is written.
    pub clear_cached_on_flush: bool,

    /// How long shutdown waits for queued work.
    pub shutdown_grace_ms: u64,

    /// Allowed lag of the index file behind the data file before the index
    /// is considered stale.
    pub index_staleness_tolerance_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/disk-tier"),
            name: "cache".to_string(),
            persistent: true,
            stripes: 1,
            memory_capacity: 0,
            disk_capacity: 0,
            expiry_interval_ms: 120_000,
            write_queue_budget_bytes: 16 * 1024 * 1024, // 16 MB
            clear_cached_on_flush: true,
            shutdown_grace_ms: 5_000,
            index_staleness_tolerance_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn data_path(&self) -> PathBuf {
        self.directory.join(format!("{}.data", self.name))
    }

    pub fn index_path(&self) -> PathBuf {
        self.directory.join(format!("{}.index", self.name))
    }

    pub fn expiry_interval(&self) -> Option<Duration> {
        (self.expiry_interval_ms > 0).then(|| Duration::from_millis(self.expiry_interval_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn staleness_tolerance(&self) -> Duration {
        Duration::from_millis(self.index_staleness_tolerance_ms)
    }
}

/// Eviction sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Upper bound on the random sample drawn per eviction.
    pub sample_size: usize,

    /// Eviction attempts per capacity check.
    pub max_evictions_per_put: usize,

    /// Segments in the in-process index.
    pub index_segments: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            sample_size: 30,
            max_evictions_per_put: 5,
            index_segments: 16,
        }
    }
}

/// Compression of records written to the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Apply zstd compression when writing to disk.
    pub enabled: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            zstd_level: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Defaults rooted at `directory`, handy for tests and tools.
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.store.directory = directory.into();
        config
    }
}
