//! Runtime configuration for tiered-swap.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Tier enablement, region sizing, swap location and eviction weights live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default initial off-heap region size when no maximum is configured.
pub const DEFAULT_OFFHEAP_INIT_SIZE: u64 = 8 * 1024 * 1024;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tiered-swap", about = "Tiered swap node with an HTTP admin API")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("offHeapMaxMemory must be -1 (disabled), 0 (unbounded) or positive, got {0}")]
    InvalidOffHeapMaxMemory(i64),

    #[error("Memory mode {0:?} requires off-heap memory, but offHeapMaxMemory is -1")]
    OffHeapRequired(MemoryMode),

    #[error("Partition count must be positive")]
    InvalidPartitions,

    #[error("zstd level must be within 1..=22, got {0}")]
    InvalidZstdLevel(i32),

    #[error("Space name must not be empty")]
    EmptySpaceName,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Per-cache store configuration.
    pub store: StoreConfig,

    /// Node-wide swap subsystem configuration.
    pub swap: SwapConfig,

    /// Off-heap eviction tuning.
    pub eviction: EvictionConfig,
}

/// HTTP admin server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// How the owning cache lays entries out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryMode {
    /// Entries live on heap; evicted entries go off-heap, then to swap.
    OnheapTiered,
    /// Entries live off-heap; evicted entries go to swap.
    OffheapTiered,
    /// Only values live off-heap; the off-heap tier is not a swap tier.
    OffheapValues,
}

/// Per-cache store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the swap space / off-heap space for this cache.
    pub space_name: String,

    /// Master switch for the tiered store.
    pub enabled: bool,

    /// Memory mode of the owning cache.
    pub memory_mode: MemoryMode,

    /// Off-heap budget in bytes: -1 disables off-heap, 0 means unbounded.
    pub offheap_max_memory: i64,

    /// Whether this cache may use the swap subsystem.
    pub swap_enabled: bool,

    /// Number of affinity partitions.
    pub partitions: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            space_name: "default".to_string(),
            enabled: true,
            memory_mode: MemoryMode::OnheapTiered,
            offheap_max_memory: 64 * 1024 * 1024, // 64 MB
            swap_enabled: true,
            partitions: 64,
        }
    }
}

impl StoreConfig {
    /// Whether the configuration asks for an off-heap swap tier.
    pub fn offheap_tier_requested(&self) -> bool {
        self.enabled
            && self.offheap_max_memory >= 0
            && matches!(
                self.memory_mode,
                MemoryMode::OnheapTiered | MemoryMode::OffheapTiered
            )
    }

    /// Initial region size: 1/1024 of the budget, or a fixed default when unbounded.
    pub fn offheap_init_size(&self) -> u64 {
        if self.offheap_max_memory > 0 {
            self.offheap_max_memory as u64 / 1024
        } else {
            DEFAULT_OFFHEAP_INIT_SIZE
        }
    }

    /// Region budget in bytes (0 = unbounded).
    pub fn offheap_max_size(&self) -> u64 {
        self.offheap_max_memory.max(0) as u64
    }
}

/// Node-wide swap subsystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Whether the swap subsystem is running on this node.
    pub enabled: bool,

    /// Directory holding swap files.
    pub path: PathBuf,

    /// Apply zstd compression to swap payloads.
    pub compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/tmp/tiered-swap"),
            compression: true,
            zstd_level: 3,
        }
    }
}

/// Off-heap eviction weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Weight for age since last access (in region ticks).
    pub age_weight: f64,

    /// Weight for entry size in KiB (prefer evicting large entries).
    pub size_weight: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            age_weight: 1.0,
            size_weight: 0.0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        if self.swap.compression && !(1..=22).contains(&self.swap.zstd_level) {
            return Err(ConfigError::InvalidZstdLevel(self.swap.zstd_level));
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.space_name.is_empty() {
            return Err(ConfigError::EmptySpaceName);
        }
        if self.offheap_max_memory < -1 {
            return Err(ConfigError::InvalidOffHeapMaxMemory(self.offheap_max_memory));
        }
        if self.offheap_max_memory == -1
            && matches!(
                self.memory_mode,
                MemoryMode::OffheapTiered | MemoryMode::OffheapValues
            )
        {
            return Err(ConfigError::OffHeapRequired(self.memory_mode));
        }
        if self.partitions == 0 {
            return Err(ConfigError::InvalidPartitions);
        }
        Ok(())
    }
}
