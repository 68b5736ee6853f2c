//! On-disk archive of fetched transcripts.
//!
//! Layout under the archive directory:
//! - `transcripts/<id>.json`: one [`Transcript`] per file, in the shape
//!   [`FileSource`](super::FileSource) reads back, so the directory can be
//!   replayed with `--transcripts-path`
//! - `index.json`: id to file, recording time and archive time
//!
//! Archiving never fails a batch; write errors are logged and the fetched
//! transcripts are passed through unchanged.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::TranscriptSource;
use crate::domain::Transcript;

const INDEX_FILE: &str = "index.json";
const TRANSCRIPTS_DIR: &str = "transcripts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Path relative to the archive directory
    pub file: String,
    pub timestamp: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

/// Transcript id to archive entry
pub type ArchiveIndex = BTreeMap<String, ArchiveEntry>;

/// Directory of archived transcripts
#[derive(Debug, Clone)]
pub struct TranscriptArchive {
    dir: PathBuf,
    force: bool,
}

impl TranscriptArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            force: false,
        }
    }

    /// Rewrite transcripts that are already archived
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn read_index(&self) -> Result<ArchiveIndex> {
        let path = self.index_path();
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Archive index is corrupt: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ArchiveIndex::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read archive index: {}", path.display())),
        }
    }

    /// Write every transcript not yet archived; returns how many were written
    pub fn store(&self, transcripts: &[Transcript], now: DateTime<Utc>) -> Result<usize> {
        let folder = self.dir.join(TRANSCRIPTS_DIR);
        fs::create_dir_all(&folder)
            .with_context(|| format!("Failed to create archive directory: {}", folder.display()))?;

        let mut index = self.read_index()?;
        let mut written = 0;

        for transcript in transcripts {
            let file = format!("{}/{}", TRANSCRIPTS_DIR, file_name(&transcript.id));
            let path = self.dir.join(&file);
            if !self.force && index.contains_key(&transcript.id) && path.exists() {
                debug!(transcript = %transcript.id, "Already archived");
                continue;
            }

            let json = serde_json::to_vec_pretty(transcript).context("Failed to serialize transcript")?;
            write_atomic(&path, &json)?;
            index.insert(
                transcript.id.clone(),
                ArchiveEntry {
                    file,
                    timestamp: transcript.timestamp,
                    archived_at: now,
                },
            );
            written += 1;
        }

        if written > 0 {
            let json = serde_json::to_vec_pretty(&index).context("Failed to serialize archive index")?;
            write_atomic(&self.index_path(), &json)?;
        }
        Ok(written)
    }
}

/// File name for an id; ids that are not filesystem-safe get a hash suffix
fn file_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe == id && !safe.is_empty() {
        return format!("{}.json", safe);
    }
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}.json", safe, &digest[..12])
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Source that archives whatever the wrapped source returns
pub struct ArchivingSource {
    inner: Arc<dyn TranscriptSource>,
    archive: TranscriptArchive,
}

impl ArchivingSource {
    pub fn new(inner: Arc<dyn TranscriptSource>, archive: TranscriptArchive) -> Self {
        Self { inner, archive }
    }
}

#[async_trait]
impl TranscriptSource for ArchivingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Transcript>> {
        let transcripts = self.inner.fetch(start, end).await?;

        let archive = self.archive.clone();
        let batch = transcripts.clone();
        let stored = tokio::task::spawn_blocking(move || archive.store(&batch, Utc::now())).await;

        match stored {
            Ok(Ok(written)) => {
                info!(written, dir = %self.archive.dir().display(), "Archived transcripts")
            }
            Ok(Err(e)) => warn!(error = %e, "Transcript archive failed"),
            Err(e) => warn!(error = %e, "Transcript archive task ended abnormally"),
        }

        Ok(transcripts)
    }
}
