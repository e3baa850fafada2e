//! Configuration types for GridFS
//!
//! Loading configuration from files or the environment is left to the
//! embedding application; these structures only define the shape and the
//! defaults.

use crate::error::{Error, Result};
use crate::path::FsPath;
use crate::types::FsMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration of a GridFS instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// File system name, used in log output
    pub name: String,
    /// Block size assigned to new files
    pub block_size: u32,
    /// Mode applied to paths no rule matches
    pub default_mode: FsMode,
    /// Per-path mode rules
    pub path_modes: Vec<PathModeConfig>,
    /// Delete worker configuration
    pub delete_worker: DeleteWorkerConfig,
    /// Dual mode synchronization configuration
    pub sync: SyncConfig,
    /// Entry store configuration
    pub store: StoreConfig,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            name: "gridfs".to_string(),
            block_size: 64 * 1024,
            default_mode: FsMode::Primary,
            path_modes: Vec::new(),
            delete_worker: DeleteWorkerConfig::default(),
            sync: SyncConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl FsConfig {
    /// Check the configuration for values the file system cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::invalid_argument("block_size must be positive"));
        }
        if self.delete_worker.batch_size == 0 {
            return Err(Error::invalid_argument(
                "delete_worker.batch_size must be positive",
            ));
        }
        if self.delete_worker.rescan_interval_ms == 0 {
            return Err(Error::invalid_argument(
                "delete_worker.rescan_interval_ms must be positive",
            ));
        }
        for rule in &self.path_modes {
            FsPath::new(&rule.path)?;
        }
        Ok(())
    }

    /// Parsed path mode rules
    pub fn mode_rules(&self) -> Result<Vec<(FsPath, FsMode)>> {
        self.path_modes
            .iter()
            .map(|rule| Ok((FsPath::new(&rule.path)?, rule.mode)))
            .collect()
    }
}

/// Mode rule for a path prefix
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathModeConfig {
    pub path: String,
    pub mode: FsMode,
}

/// Delete worker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteWorkerConfig {
    /// Interval between trash re-scans when no signal arrives
    pub rescan_interval_ms: u64,
    /// Maximum number of children removed per transaction
    pub batch_size: usize,
}

impl Default for DeleteWorkerConfig {
    fn default() -> Self {
        Self {
            rescan_interval_ms: 1000,
            batch_size: 1000,
        }
    }
}

impl DeleteWorkerConfig {
    #[must_use]
    pub const fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

/// Backoff applied when dual mode synchronization keeps racing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts made without any pause
    pub backoff_after_attempts: u32,
    /// First pause once backoff kicks in
    pub backoff_base_ms: u64,
    /// Upper bound of a single pause
    pub backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_after_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 100,
        }
    }
}

impl SyncConfig {
    /// Pause before the given (zero based) attempt, `None` when the attempt
    /// should run immediately.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        let excess = attempt.checked_sub(self.backoff_after_attempts)?;
        let factor = 1u64.checked_shl(excess.min(16)).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);

        (ms > 0).then(|| Duration::from_millis(ms))
    }
}

/// Entry store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum time a transaction waits for a key lock
    pub tx_timeout_ms: u64,
    /// Database file for persistent metadata, in-memory only when unset
    pub data_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tx_timeout_ms: 10_000,
            data_path: None,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }
}
