//! Store configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `MINIDELTA_*` environment variables (for example `MINIDELTA_DATA_DIR`).

use crate::error::{Error, Result};
use crate::storage::compression::CompressionAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root for `delta/<entity>` tables and `seq/<entity>.seq` counters
    pub data_dir: PathBuf,
    /// Codec for newly written data files
    pub compression: CompressionAlgorithm,
    pub compression_level: i32,
    /// Retention used by vacuum when the caller gives none
    pub default_retention_hours: u64,
    /// Minimum age of unreferenced files before vacuum deletes them
    pub orphan_grace_secs: u64,
    /// Rows per data file written by compaction
    pub compact_target_rows: usize,
    /// Attempts before a commit that keeps losing version races gives up
    pub commit_retries: usize,
    /// Records buffered between the export worker and its consumer
    pub export_channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compression: CompressionAlgorithm::Zstd,
            compression_level: 3,
            default_retention_hours: 168,
            orphan_grace_secs: 3600,
            compact_target_rows: 4096,
            commit_retries: 16,
            export_channel_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Defaults with the given data directory
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load defaults, then `file` (if given), then the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| Error::InvalidArgument(format!("Invalid default config: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix("MINIDELTA").try_parsing(true));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidArgument(format!("Failed to load config: {}", e)))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidArgument(format!("Failed to render config: {}", e)))
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.data_dir.join("delta")
    }

    pub fn sequences_dir(&self) -> PathBuf {
        self.data_dir.join("seq")
    }

    pub fn default_retention(&self) -> Duration {
        Duration::from_secs(self.default_retention_hours * 3600)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}
