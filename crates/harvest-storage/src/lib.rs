//! Harvest Storage - snapshot files for captured archives.
//!
//! Provides [`FileSink`], the [`ArchiveSink`](harvest_core::ArchiveSink)
//! used outside tests. Each snapshot becomes its own file named
//! `<prefix><random><.har|.zhar>`; the name is reserved synchronously and the
//! content written by a background thread behind a bounded queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvest_core::{CaptureConfig, HarCapture};
//! use harvest_storage::{FileSink, StorageConfig};
//!
//! let sink = FileSink::new(StorageConfig::in_dir("/tmp/har").with_compress(true)).unwrap();
//! let capture = HarCapture::new(CaptureConfig::default(), Arc::new(sink));
//! let snapshot = capture.get_archive(false);
//! ```

pub mod config;
pub mod error;
mod writer;

pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use writer::{read_snapshot, FileSink};
