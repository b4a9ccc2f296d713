//! Durable ingestion cursor.
//!
//! The checkpoint is a single non-negative integer: the number of source
//! records already read, filtered and persisted. It is loaded once when a run
//! starts and rewritten after every committed batch.
//!
//! # File format
//!
//! The file holds one base-10 integer and nothing else. Absent, empty or
//! non-numeric content loads as `0`: a damaged checkpoint restarts ingestion
//! from the top, which the idempotent row store absorbs.
//!
//! # Durability
//!
//! [`FileCheckpointStore::save`] writes to a temporary file in the same
//! directory, syncs it, and renames it over the target, so a crash leaves
//! either the previous cursor or the new one on disk, never a torn write.
//!
//! ```no_run
//! use airbeam::checkpoint::{CheckpointStore, FileCheckpointStore};
//! # fn main() -> anyhow::Result<()> {
//! let mut store = FileCheckpointStore::new("Data/ingestion_checkpoint.txt");
//! let cursor = store.load();
//! store.save(cursor + 15)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use std::fs::{create_dir_all, read_to_string, remove_file};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Storage for the committed cursor.
///
/// `save` must only be called once the batch ending at `index` is durable in
/// every authoritative sink.
pub trait CheckpointStore {
    /// Last committed cursor, or `0` when none can be read.
    fn load(&self) -> usize;

    /// Durably replace the stored cursor.
    ///
    /// # Errors
    /// Returns an error if the cursor could not be persisted.
    fn save(&mut self, index: usize) -> Result<()>;
}

/// Plain-text checkpoint file.
#[derive(Clone, Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw file contents, if the file exists. Used by the report.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn read_raw(&self) -> Result<Option<String>> {
        match read_to_string(&self.path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    /// Remove the checkpoint so the next run starts from record 0.
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> usize {
        let raw = match self.read_raw() {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, starting from 0");
                return 0;
            }
        };
        raw.parse::<usize>().unwrap_or_else(|_| {
            warn!(path = %self.path.display(), content = %raw, "checkpoint corrupt, starting from 0");
            0
        })
    }

    fn save(&mut self, index: usize) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("create temp checkpoint in {}", dir.display()))?;
        write!(tmp, "{index}").context("write checkpoint")?;
        tmp.as_file()
            .sync_all()
            .context("sync checkpoint to disk")?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;

        debug!(path = %self.path.display(), index, "checkpoint saved");
        Ok(())
    }
}
