//! Snapshot persistence seam.
//!
//! The assembler hands every snapshot it produces to an [`ArchiveSink`].
//! Sinks must return quickly: anything slow (file I/O) belongs on a
//! background writer, with the handle reserved up front.

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::model::Har;

/// Name of a persisted snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistHandle {
    path: PathBuf,
}

impl PersistHandle {
    /// Wraps a path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for PersistHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Destination for archive snapshots.
///
/// Implementations must not block the caller on I/O. Failures are returned
/// to the assembler, which logs them and carries on.
pub trait ArchiveSink: Send + Sync + fmt::Debug {
    /// Stores a snapshot and returns its handle.
    fn persist(&self, har: &Har) -> Result<PersistHandle>;
}

/// A sink that keeps snapshots in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    snapshots: Mutex<Vec<Har>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots stored so far.
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Returns true if nothing was persisted.
    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }

    /// Most recent snapshot.
    pub fn last(&self) -> Option<Har> {
        self.snapshots.lock().last().cloned()
    }

    /// Every snapshot, oldest first.
    pub fn snapshots(&self) -> Vec<Har> {
        self.snapshots.lock().clone()
    }
}

impl ArchiveSink for MemorySink {
    fn persist(&self, har: &Har) -> Result<PersistHandle> {
        let mut snapshots = self.snapshots.lock();
        snapshots.push(har.clone());
        Ok(PersistHandle::new(format!("memory/har_dump_{}", snapshots.len())))
    }
}
