//! Background snapshot writer.
//!
//! [`FileSink`] reserves a uniquely named file synchronously, so the caller
//! gets its path right away, and queues the actual serialization and write
//! for a dedicated writer thread. The queue is bounded; when it is full the
//! newest snapshot is dropped and the failure reported to the caller.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use harvest_core::{ArchiveSink, Har, PersistHandle};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

enum Job {
    Write { file: File, path: PathBuf, har: Box<Har> },
    Flush(SyncSender<()>),
}

/// Writes archive snapshots to files from a background thread.
pub struct FileSink {
    config: StorageConfig,
    tx: Mutex<Option<SyncSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("dir", &self.config.dir)
            .field("compress", &self.config.compress)
            .field("running", &self.tx.lock().is_some())
            .finish()
    }
}

impl FileSink {
    /// Creates the output directory and starts the writer thread.
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let (tx, rx) = mpsc::sync_channel(config.queue_capacity);
        let pretty = config.pretty;
        let compress = config.compress;
        let worker = std::thread::Builder::new()
            .name("har-writer".into())
            .spawn(move || run_writer(rx, pretty, compress))?;

        info!("Writing archive snapshots to {:?}", config.dir);
        Ok(Self {
            config,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The sink's configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Reserves a file and queues the snapshot for writing.
    pub fn enqueue(&self, har: &Har) -> Result<PathBuf> {
        let tx = self.tx.lock().clone().ok_or(StorageError::WriterClosed)?;

        let reserved = tempfile::Builder::new()
            .prefix(&self.config.prefix)
            .suffix(self.config.extension())
            .tempfile_in(&self.config.dir)?;
        let (file, path) = reserved.keep().map_err(|e| StorageError::Io(e.error))?;

        let job = Job::Write {
            file,
            path: path.clone(),
            har: Box::new(har.clone()),
        };
        match tx.try_send(job) {
            Ok(()) => Ok(path),
            Err(TrySendError::Full(_)) => {
                discard(&path);
                Err(StorageError::QueueFull(path.display().to_string()))
            }
            Err(TrySendError::Disconnected(_)) => {
                discard(&path);
                Err(StorageError::WriterClosed)
            }
        }
    }

    /// Blocks until every snapshot queued so far is written.
    pub fn flush(&self) -> Result<()> {
        let tx = self.tx.lock().clone().ok_or(StorageError::WriterClosed)?;
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        tx.send(Job::Flush(ack_tx)).map_err(|_| StorageError::WriterClosed)?;
        ack_rx.recv().map_err(|_| StorageError::WriterClosed)
    }

    /// Writes out the queue and stops the writer thread.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("Snapshot writer thread panicked");
            }
        }
    }
}

impl ArchiveSink for FileSink {
    fn persist(&self, har: &Har) -> harvest_core::Result<PersistHandle> {
        Ok(PersistHandle::new(self.enqueue(har)?))
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("Failed to remove reserved file {:?}: {}", path, e);
    }
}

fn run_writer(rx: Receiver<Job>, pretty: bool, compress: bool) {
    for job in rx {
        match job {
            Job::Write { file, path, har } => match write_snapshot(file, &har, pretty, compress) {
                Ok(()) => debug!("Wrote snapshot {:?} ({} entries)", path, har.log.entries.len()),
                Err(e) => warn!("Failed to write snapshot {:?}: {}", path, e),
            },
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Snapshot writer stopped");
}

fn encode<W: Write>(writer: W, har: &Har, pretty: bool) -> Result<()> {
    if pretty {
        serde_json::to_writer_pretty(writer, har)?;
    } else {
        serde_json::to_writer(writer, har)?;
    }
    Ok(())
}

fn write_snapshot(file: File, har: &Har, pretty: bool, compress: bool) -> Result<()> {
    let mut writer = BufWriter::new(file);
    if compress {
        let mut gz = GzEncoder::new(&mut writer, Compression::default());
        encode(&mut gz, har, pretty)?;
        gz.finish()?;
    } else {
        encode(&mut writer, har, pretty)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a snapshot back; `.zhar` files are decompressed.
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<Har> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mut json = String::new();
    if path.extension().is_some_and(|ext| ext == "zhar") {
        GzDecoder::new(reader).read_to_string(&mut json)?;
    } else {
        reader.read_to_string(&mut json)?;
    }
    Ok(serde_json::from_str(&json)?)
}
