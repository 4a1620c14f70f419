//! Configuration management for CaskStore
//!
//! Defaults mirror the original daemon (1 MiB data files). A builder is
//! provided for callers that only want to override a few knobs.

use std::time::Duration;

use crate::error::{CaskError, CaskResult};
use crate::format::Limits;

/// Default maximum segment size before rotation (1 MiB)
pub const DEFAULT_MAX_DATAFILE_SIZE: u64 = 1 << 20;

/// Default maximum key size (64 KiB)
pub const DEFAULT_MAX_KEY_SIZE: usize = 64 * 1024;

/// Default maximum value size (64 MiB)
pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// How recovery treats corruption in the middle of a closed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryMode {
    /// Fail `open` with `OpenFailed`. Closed segments are never written
    /// after rotation, so damage there means a filesystem fault.
    #[default]
    Strict,
    /// Log a warning and skip the remainder of the damaged segment.
    Lenient,
}

/// Compaction policy and background cadence
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Compact when dead bytes / total bytes reaches this ratio
    pub trigger_ratio: f64,
    /// Never compact while the store is smaller than this (bytes)
    pub min_bytes: u64,
    /// How often the background compactor checks the policy
    pub interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger_ratio: 0.5,
            min_bytes: 16 * 1024 * 1024,
            interval: Duration::from_secs(60),
        }
    }
}

/// CaskStore configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Segment rotation threshold (bytes)
    pub max_datafile_size: u64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// fsync after every append
    pub sync_writes: bool,
    /// Treatment of mid-segment corruption during recovery
    pub recovery_mode: RecoveryMode,
    /// Compaction policy
    pub compaction: CompactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_datafile_size: DEFAULT_MAX_DATAFILE_SIZE,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            sync_writes: true,
            recovery_mode: RecoveryMode::Strict,
            compaction: CompactionConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config builder starting from the defaults
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Key and value limits for the record codec
    pub fn limits(&self) -> Limits {
        Limits {
            max_key_size: self.max_key_size,
            max_value_size: self.max_value_size,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> CaskResult<()> {
        if self.max_datafile_size == 0 {
            return Err(CaskError::InvalidConfig("max_datafile_size must be > 0".into()));
        }
        if self.max_key_size == 0 || self.max_key_size > u32::MAX as usize {
            return Err(CaskError::InvalidConfig("max_key_size must be in [1, u32::MAX]".into()));
        }
        if self.max_value_size > u32::MAX as usize {
            return Err(CaskError::InvalidConfig("max_value_size must be <= u32::MAX".into()));
        }
        let ratio = self.compaction.trigger_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(CaskError::InvalidConfig(
                "compaction.trigger_ratio must be in (0.0, 1.0]".into(),
            ));
        }
        if self.compaction.interval.is_zero() {
            return Err(CaskError::InvalidConfig("compaction.interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the segment rotation threshold (bytes)
    pub fn max_datafile_size(mut self, size: u64) -> Self {
        self.config.max_datafile_size = size;
        self
    }

    /// Set the maximum key size (bytes)
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Set the maximum value size (bytes)
    pub fn max_value_size(mut self, size: usize) -> Self {
        self.config.max_value_size = size;
        self
    }

    /// Enable or disable fsync after every append
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.config.sync_writes = sync;
        self
    }

    pub fn recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.config.recovery_mode = mode;
        self
    }

    /// Replace the whole compaction policy
    pub fn compaction(mut self, compaction: CompactionConfig) -> Self {
        self.config.compaction = compaction;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
