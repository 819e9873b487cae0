//! Snapshot writer configuration.

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Default prefix of snapshot file names.
pub const DEFAULT_PREFIX: &str = "har_dump_";

/// Default number of snapshots that may wait for the writer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Settings for [`FileSink`](crate::FileSink).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory snapshots are written to.
    pub dir: PathBuf,
    /// File name prefix.
    pub prefix: String,
    /// Bound of the writer queue.
    pub queue_capacity: usize,
    /// Write indented JSON.
    pub pretty: bool,
    /// Gzip snapshots and use the `.zhar` extension.
    pub compress: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir().unwrap_or_else(|_| std::env::temp_dir()),
            prefix: DEFAULT_PREFIX.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pretty: true,
            compress: false,
        }
    }
}

impl StorageConfig {
    /// Creates a config writing into `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Platform cache directory for snapshots.
    pub fn default_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "harvest", "harvest")
            .ok_or_else(|| StorageError::Config("Could not determine cache directory".into()))?;
        Ok(proj_dirs.cache_dir().join("archives"))
    }

    /// Sets the file name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the writer queue bound.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Enables or disables indented output.
    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Enables or disables gzip output.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// File extension for snapshots.
    pub fn extension(&self) -> &'static str {
        if self.compress {
            ".zhar"
        } else {
            ".har"
        }
    }

    /// Checks the settings.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(StorageError::Config("queue_capacity must be at least 1".into()));
        }
        if self.prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(StorageError::Config(format!("prefix '{}' contains a path separator", self.prefix)));
        }
        Ok(())
    }
}
