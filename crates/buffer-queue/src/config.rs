//! Queue configuration
//!
//! Thresholds for the three level dimensions, buffering notification
//! watermarks and the disk spill settings. Field names serialize in
//! kebab-case so configuration files use the same option names as the
//! element properties (`max-size-bytes`, `ring-buffer-max-size`, ...).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};
use crate::item::SECOND;

/// Default buffer-count threshold
pub const DEFAULT_MAX_SIZE_BUFFERS: u32 = 100;
/// Default byte threshold (2 MiB)
pub const DEFAULT_MAX_SIZE_BYTES: u32 = 2 * 1024 * 1024;
/// Default time threshold (2 seconds, in nanoseconds)
pub const DEFAULT_MAX_SIZE_TIME: u64 = 2 * SECOND;
/// Below this percentage the queue enters the buffering state
pub const DEFAULT_LOW_PERCENT: u32 = 10;
/// At or above this percentage the queue leaves the buffering state
pub const DEFAULT_HIGH_PERCENT: u32 = 99;

/// Configuration for a buffering queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueConfig {
    /// Maximum number of data chunks in memory (0 = disabled)
    pub max_size_buffers: u32,

    /// Maximum payload bytes in memory (0 = disabled)
    pub max_size_bytes: u32,

    /// Maximum summed duration in memory, nanoseconds (0 = disabled)
    pub max_size_time: u64,

    /// Emit buffering percent/state notifications
    pub use_buffering: bool,

    /// Derive the time dimension of the percentage from the incoming byte rate
    pub use_rate_estimate: bool,

    /// Enter buffering below this percentage
    pub low_percent: u32,

    /// Leave buffering at or above this percentage
    pub high_percent: u32,

    /// Disk ring capacity in bytes (0 = no ring)
    pub ring_buffer_max_size: u64,

    /// Backing file template, e.g. `/tmp/queue-XXXXXX` (None = anonymous file)
    pub temp_template: Option<PathBuf>,

    /// Delete template-backed spill files when the store is closed
    pub temp_remove: bool,
}

/// Where data goes once the memory thresholds are exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillMode {
    /// No spill store; the producer blocks at the limit
    Memory,
    /// Grow-only backing file
    Unbounded,
    /// Fixed-capacity circular backing file
    Ring(u64),
}

impl SpillMode {
    /// True when evicted data can be moved to disk
    pub fn is_enabled(&self) -> bool {
        !matches!(self, SpillMode::Memory)
    }

    /// Disk capacity in bytes, 0 meaning unbounded
    pub fn capacity(&self) -> u64 {
        match self {
            SpillMode::Ring(capacity) => *capacity,
            _ => 0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size_buffers: DEFAULT_MAX_SIZE_BUFFERS,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_size_time: DEFAULT_MAX_SIZE_TIME,
            use_buffering: false,
            use_rate_estimate: true,
            low_percent: DEFAULT_LOW_PERCENT,
            high_percent: DEFAULT_HIGH_PERCENT,
            ring_buffer_max_size: 0,
            temp_template: None,
            temp_remove: true,
        }
    }
}

impl QueueConfig {
    /// Memory-only queue bounded by a byte count
    pub fn bytes_only(max_size_bytes: u32) -> Self {
        Self {
            max_size_buffers: 0,
            max_size_bytes,
            max_size_time: 0,
            ..Self::default()
        }
    }

    /// Queue that spills into a disk ring of `capacity` bytes
    pub fn with_ring_buffer(mut self, capacity: u64) -> Self {
        self.ring_buffer_max_size = capacity;
        self
    }

    /// Resolve the spill mode from the ring size and template
    pub fn spill_mode(&self) -> SpillMode {
        if self.ring_buffer_max_size > 0 {
            SpillMode::Ring(self.ring_buffer_max_size)
        } else if self.temp_template.is_some() {
            SpillMode::Unbounded
        } else {
            SpillMode::Memory
        }
    }

    /// Validate thresholds and watermarks
    pub fn validate(&self) -> Result<()> {
        if self.high_percent == 0 {
            return Err(QueueError::Config("high-percent must be > 0".to_string()));
        }

        if self.high_percent > 100 {
            return Err(QueueError::Config(format!(
                "high-percent ({}) must be <= 100",
                self.high_percent
            )));
        }

        if self.low_percent >= self.high_percent {
            return Err(QueueError::Config(format!(
                "low-percent ({}) must be < high-percent ({})",
                self.low_percent, self.high_percent
            )));
        }

        if let Some(template) = &self.temp_template {
            if template.file_name().is_none() {
                return Err(QueueError::Config(format!(
                    "temp-template {:?} has no file name component",
                    template
                )));
            }
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: QueueConfig =
            toml::from_str(s).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: QueueConfig =
            serde_json::from_str(s).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: QueueConfig =
            serde_yaml::from_str(s).map_err(|e| QueueError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; the extension picks the format (toml, json, yaml/yml)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(QueueError::Config(format!(
                "unsupported config extension: {:?}",
                other
            ))),
        }
    }
}
