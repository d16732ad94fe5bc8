use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::ledger::entry::LedgerEntry;

const LEDGER_DIR_NAME: &str = "ledger";
const LEDGER_FILE_EXTENSION: &str = "jsonl";

/// Errors that can occur during ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Build id is empty or not usable as a file name.
    #[error("invalid build id: {0:?}")]
    InvalidBuildId(String),

    /// The store refused the entry.
    #[error("ledger store rejected write: {0}")]
    Rejected(String),

    /// A sequence lock was poisoned by a panicking writer.
    #[error("ledger sequence lock poisoned for build {0}")]
    Poisoned(String),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Durable backing for the ledger.
///
/// Implementations only append and read. Sequence assignment happens above
/// the store, so `append` receives entries already numbered.
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Durably append one entry. An `Err` means the entry was not stored.
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()>;

    /// All entries for `build_id`, in append order.
    fn load(&self, build_id: &str) -> LedgerResult<Vec<LedgerEntry>>;

    /// Build ids with at least one entry.
    fn builds(&self) -> LedgerResult<Vec<String>>;

    /// Highest stored sequence for `build_id`, or 0.
    fn latest_sequence(&self, build_id: &str) -> LedgerResult<u64> {
        Ok(self
            .load(build_id)?
            .iter()
            .map(|entry| entry.sequence)
            .max()
            .unwrap_or(0))
    }
}

pub(crate) fn validate_build_id(build_id: &str) -> LedgerResult<()> {
    let valid = !build_id.trim().is_empty()
        && build_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !build_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidBuildId(build_id.to_string()))
    }
}

/// Ledger store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    builds: RwLock<HashMap<String, Vec<LedgerEntry>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let mut builds = self.builds.write().unwrap_or_else(PoisonError::into_inner);
        builds
            .entry(entry.build_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn load(&self, build_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let builds = self.builds.read().unwrap_or_else(PoisonError::into_inner);
        Ok(builds.get(build_id).cloned().unwrap_or_default())
    }

    fn builds(&self) -> LedgerResult<Vec<String>> {
        let builds = self.builds.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = builds.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn latest_sequence(&self, build_id: &str) -> LedgerResult<u64> {
        let builds = self.builds.read().unwrap_or_else(PoisonError::into_inner);
        Ok(builds
            .get(build_id)
            .and_then(|entries| entries.last())
            .map(|entry| entry.sequence)
            .unwrap_or(0))
    }
}

/// Ledger store backed by one JSON-lines file per build.
#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    root_dir: PathBuf,
}

impl FileLedgerStore {
    /// Create a store rooted at `base_dir/ledger`.
    pub fn new(base_dir: impl Into<PathBuf>) -> LedgerResult<Self> {
        let root_dir = base_dir.into().join(LEDGER_DIR_NAME);
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    /// Get the ledger root directory path.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn build_path(&self, build_id: &str) -> LedgerResult<PathBuf> {
        validate_build_id(build_id)?;
        Ok(self
            .root_dir
            .join(format!("{build_id}.{LEDGER_FILE_EXTENSION}")))
    }
}

impl LedgerStore for FileLedgerStore {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let path = self.build_path(&entry.build_id)?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        append_line(&mut file, line.as_bytes())?;

        Ok(())
    }

    fn load(&self, build_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let path = self.build_path(build_id)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(LedgerError::Io(err)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }

    fn builds(&self) -> LedgerResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(LEDGER_FILE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Append `line` and sync. On failure the file is cut back to its previous
/// length, so a failed append leaves neither a whole nor a torn line behind.
fn append_line(file: &mut fs::File, line: &[u8]) -> io::Result<()> {
    let len = file.metadata()?.len();
    let written = file.write_all(line).and_then(|()| file.sync_all());
    if let Err(err) = written {
        if let Err(rollback) = file.set_len(len).and_then(|()| file.sync_all()) {
            warn!(error = %rollback, "could not roll back failed ledger append");
        }
        return Err(err);
    }
    Ok(())
}
