//! Durable, append-only result store.
//!
//! The store is a delimited text file with one header row followed by one
//! row per worker run. Many harness processes may append to the same store
//! at once:
//! - the header is written under an advisory lock, only when the file is empty
//! - shared stores take the same lock around every append
//! - private stores (one owning process) skip the lock
//!
//! Files are always opened in append mode so writers never overwrite each
//! other's bytes.

pub mod lock;
pub mod record;

pub use lock::LockPolicy;
pub use record::{HeaderVariant, ResultRecord, Status};

use lock::FileLock;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Result sink errors.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to open result store '{}': {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write result store '{}': {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to encode result rows: {0}")]
    Encode(#[from] csv::Error),

    /// The blocking task running a store operation died.
    #[error("result store task failed: {0}")]
    Task(String),

    /// The advisory lock could not be taken. Reported, then bypassed.
    #[error("could not lock result store '{}': {reason}", path.display())]
    Lock { path: PathBuf, reason: String },
}

/// Who writes to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkMode {
    /// Other processes may append concurrently.
    #[default]
    Shared,
    /// This process is the only writer.
    Private,
}

/// Where and how results are written.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    pub path: PathBuf,
    pub mode: SinkMode,
    pub header: HeaderVariant,
    pub lock_policy: LockPolicy,
}

/// Appends result records to one store.
#[derive(Debug, Clone)]
pub struct ResultSink {
    config: SinkConfig,
}

impl ResultSink {
    pub fn new(config: SinkConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn header(&self) -> HeaderVariant {
        self.config.header
    }

    /// Write the header row if the store is empty.
    ///
    /// Safe to call from any number of threads and processes at once. Returns
    /// `true` if this call wrote the header.
    pub fn ensure_header(&self) -> Result<bool, SinkError> {
        let path = self.path();
        let _lock = self.lock();

        let mut file = open_append(path)?;
        let len = file
            .metadata()
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?
            .len();

        if len > 0 {
            return Ok(false);
        }

        write_flush(&mut file, path, self.config.header.header_row().as_bytes())?;
        debug!(path = %path.display(), "Wrote result header");
        Ok(true)
    }

    /// Append `records`, each as one row.
    ///
    /// Shared stores hold the advisory lock for the whole write so no other
    /// writer can interleave with these rows.
    pub fn append(&self, records: &[ResultRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let rows = encode_rows(records, self.config.header)?;

        let _lock = match self.config.mode {
            SinkMode::Shared => self.lock(),
            SinkMode::Private => None,
        };

        let mut file = open_append(self.path())?;
        write_flush(&mut file, self.path(), &rows)
    }

    /// Take the store lock, or log and continue without it.
    fn lock(&self) -> Option<FileLock> {
        let path = self.path();
        let error = match FileLock::acquire(path, self.config.lock_policy) {
            Ok(Some(lock)) => return Some(lock),
            Ok(None) => SinkError::Lock {
                path: path.to_path_buf(),
                reason: format!(
                    "still held after {} attempts",
                    self.config.lock_policy.attempts
                ),
            },
            Err(e) => SinkError::Lock {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        };

        warn!(%error, "Writing without the result store lock");
        None
    }
}

/// Encode `records` as delimited rows without a header.
fn encode_rows(records: &[ResultRecord], variant: HeaderVariant) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for record in records {
        writer.write_record(record.fields(variant))?;
    }
    writer
        .into_inner()
        .map_err(|e| SinkError::Encode(e.into_error().into()))
}

/// Read every row of a delimited file, header included.
///
/// Rows may differ in width; blank lines are skipped.
pub fn read_rows(path: &Path) -> Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    reader
        .records()
        .map(|row| row.map(|row| row.iter().map(str::to_string).collect::<Vec<_>>()))
        .collect()
}

fn open_append(path: &Path) -> Result<File, SinkError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn write_flush(file: &mut File, path: &Path, data: &[u8]) -> Result<(), SinkError> {
    file.write_all(data)
        .and_then(|_| file.flush())
        .map_err(|source| SinkError::Write {
            path: path.to_path_buf(),
            source,
        })
}
