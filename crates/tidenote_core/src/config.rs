//! Configuration types for tidenote.
//!
//! [`Config`] holds the instance identity, the storage directories to open
//! and the sync tuning knobs. It is persisted as TOML (typically at
//! `~/.config/tidenote/config.toml` on Unix systems).
//!
//! # Example
//!
//! ```ignore
//! use tidenote_core::config::Config;
//!
//! let mut config = Config::load()?;
//! config.add_storage_dir("/home/user/Notes".into(), "Personal");
//! config.save()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TideError};
use crate::fs::FileSystem;

/// A storage directory the instance opens at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDirConfig {
    pub path: PathBuf,
    pub name: String,
}

/// Tuning of the sync orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval of the polling fallback.
    pub poll_interval_ms: u64,

    /// Quiet period that collapses a burst of triggers into one pass.
    pub debounce_ms: u64,

    /// First retry delay of an activity entry that is not visible yet.
    pub pending_retry_initial_ms: u64,

    /// Cap of the doubling retry delay.
    pub pending_retry_max_ms: u64,

    /// Attempts before a pending entry is dropped with a warning.
    pub pending_max_attempts: u32,

    /// Residual records that trigger automatic compaction (0 disables it).
    pub compaction_threshold: usize,

    /// Lines kept when the own activity log is trimmed.
    pub activity_keep_lines: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            debounce_ms: 250,
            pending_retry_initial_ms: 200,
            pending_retry_max_ms: 10_000,
            pending_max_attempts: 8,
            compaction_threshold: 200,
            activity_keep_lines: 1000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay before retry number `attempt` (1-based) of a pending entry.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(30);
        let delay = self
            .pending_retry_initial_ms
            .saturating_mul(1u64 << shift)
            .min(self.pending_retry_max_ms);
        Duration::from_millis(delay)
    }
}

/// `Config` is the part of tidenote a user or host application can configure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Stable id of this instance, written into every file it owns.
    pub instance_id: String,

    /// Storage directories opened at startup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_dirs: Vec<StorageDirConfig>,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            storage_dirs: Vec::new(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Add a storage directory unless one with the same path is listed.
    /// Returns whether the list changed.
    pub fn add_storage_dir(&mut self, path: PathBuf, name: &str) -> bool {
        if self.storage_dirs.iter().any(|sd| sd.path == path) {
            return false;
        }
        self.storage_dirs.push(StorageDirConfig {
            path,
            name: name.to_string(),
        });
        true
    }

    pub fn remove_storage_dir(&mut self, path: &Path) -> bool {
        let before = self.storage_dirs.len();
        self.storage_dirs.retain(|sd| sd.path != path);
        self.storage_dirs.len() != before
    }

    /// Load config from a specific path.
    pub fn load_from(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let contents = fs
            .read_to_string(path)
            .map_err(|e| TideError::FileRead {
                path: path.to_path_buf(),
                source: e,
            })?;

        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs.write_atomic(path, contents.as_bytes())
            .map_err(|e| TideError::FileWrite {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(())
    }

    /// Load config from `path`, creating and saving a fresh one (with a new
    /// instance id) if the file does not exist yet.
    pub fn load_or_init(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        if fs.exists(path) {
            return Self::load_from(fs, path);
        }
        let config = Config::default();
        config.save_to(fs, path)?;
        log::info!("Initialized config at {:?} for instance {}", path, config.instance_id);
        Ok(config)
    }

    /// Get the config file path (~/.config/tidenote/config.toml)
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tidenote").join("config.toml"))
    }

    /// Load config from the default location, initializing it on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path().ok_or(TideError::NoConfigDir)?;
        Self::load_or_init(&crate::fs::RealFileSystem, &path)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or(TideError::NoConfigDir)?;
        self.save_to(&crate::fs::RealFileSystem, &path)
    }
}
