//! Run-state ledger.
//!
//! A single JSON document recording which transcripts completed the full
//! pipeline. Properties:
//! - Missing file means first run (empty state); a corrupt file is an error
//! - The only mutator is [`Ledger::mark_transcript_complete`]
//! - Every write goes to a temp file in the same directory, then renames over
//!   the ledger, so readers see the old or the new state and never a mix
//! - An exclusive lock on `<ledger>.lock` is held while the ledger is open

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::run::RUN_STATE_VERSION;
use crate::domain::{ItemKind, RunState};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger {} is in use by another run", path.display())]
    Locked { path: PathBuf },

    #[error("ledger {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ledger {} has unsupported version {found} (expected {})", path.display(), RUN_STATE_VERSION)]
    UnsupportedVersion { path: PathBuf, found: u32 },

    #[error("ledger I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Open ledger holding the state and its lock
pub struct Ledger {
    path: PathBuf,
    state: RunState,
    _lock: File,
}

impl Ledger {
    /// Lock and load the ledger at `path`
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let lock_path = lock_path(path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(io_error(&lock_path))?;
        lock.try_lock_exclusive()
            .map_err(|_| LedgerError::Locked {
                path: path.to_path_buf(),
            })?;

        let state = Self::read_state(path)?;
        info!(
            path = %path.display(),
            processed = state.processed_transcript_ids.len(),
            "Loaded ledger"
        );

        Ok(Self {
            path: path.to_path_buf(),
            state,
            _lock: lock,
        })
    }

    /// Read the persisted state without taking the lock
    pub fn read_state(path: &Path) -> Result<RunState, LedgerError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No ledger yet, starting empty");
                return Ok(RunState::default());
            }
            Err(e) => return Err(io_error(path)(e)),
        };

        let state: RunState = serde_json::from_str(&content).map_err(|source| LedgerError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        if state.version > RUN_STATE_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: state.version,
            });
        }
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn is_processed(&self, transcript_id: &str) -> bool {
        self.state.is_processed(transcript_id)
    }

    /// Record a completed transcript and persist atomically.
    ///
    /// The in-memory state only changes once the write has succeeded.
    pub fn mark_transcript_complete(
        &mut self,
        transcript_id: &str,
        external_ids: &[(ItemKind, String)],
        timestamp: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut next = self.state.clone();
        next.apply_completion(transcript_id, external_ids, timestamp);
        write_atomic(&self.path, &next)?;
        self.state = next;

        debug!(
            transcript = %transcript_id,
            records = external_ids.len(),
            "Ledger updated"
        );
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "ledger".into());
    name.push(".lock");
    path.with_file_name(name)
}

/// Write to a temp file next to `path`, fsync, then rename over it
fn write_atomic(path: &Path, state: &RunState) -> Result<(), LedgerError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let json = serde_json::to_vec_pretty(state).map_err(|source| LedgerError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    tmp.write_all(&json).map_err(io_error(path))?;
    tmp.as_file().sync_all().map_err(io_error(path))?;
    tmp.persist(path).map_err(|e| LedgerError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}
