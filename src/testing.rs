//! Test support for ingestion code.
//!
//! Everything here works without touching the filesystem except
//! [`TestWorkspace`], which roots a full file-backed layout in a temporary
//! directory.
//!
//! - **Stores**: in-memory [`CheckpointStore`](crate::checkpoint::CheckpointStore)
//!   and sink implementations whose clones share state, so a test can hand
//!   one clone to the orchestrator and inspect the other afterwards
//! - **Failure injection**: [`FailingArchive`], [`FailingRowSink`] and
//!   [`FailingQuarantine`] fail on a chosen call
//! - **Fixtures**: deterministic readings and their NDJSON lines
//! - **Assertions**: checkpoint monotonicity and key uniqueness
//!
//! ```
//! use airbeam::config::IngestConfig;
//! use airbeam::io::source::VecLogSource;
//! use airbeam::runner::Orchestrator;
//! use airbeam::sink::DualSinkWriter;
//! use airbeam::testing::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let checkpoint = MemoryCheckpointStore::new();
//! let rows = MemoryRowStore::new();
//! let mut orchestrator = Orchestrator::new(
//!     &IngestConfig::default(),
//!     Box::new(VecLogSource::new(to_lines(&sample_readings(37)))),
//!     Box::new(checkpoint.clone()),
//!     Box::new(MemoryQuarantine::new()),
//!     DualSinkWriter::new(Box::new(rows.clone()), Box::new(MemoryArchive::new())),
//! );
//! orchestrator.run()?;
//!
//! assert_eq!(checkpoint.history(), vec![15, 30, 37]);
//! assert_eq!(rows.len(), 37);
//! # Ok(())
//! # }
//! ```

pub mod assertions;
pub mod fixtures;
pub mod stores;

pub use assertions::*;
pub use fixtures::*;
pub use stores::*;

use crate::config::IngestConfig;
use anyhow::{Context, Result};
use std::fs::{OpenOptions, create_dir_all};
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// Temporary directory holding a complete default layout.
///
/// The directory is removed when the workspace is dropped.
pub struct TestWorkspace {
    dir: TempDir,
    config: IngestConfig,
}

impl TestWorkspace {
    /// # Errors
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create test workspace")?;
        let config = IngestConfig::rooted_at(dir.path());
        Ok(Self { dir, config })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Replace the configuration, e.g. to change the batch size.
    pub fn configure(&mut self, f: impl FnOnce(IngestConfig) -> IngestConfig) {
        self.config = f(self.config.clone());
    }

    /// Append newline-terminated lines to the source log, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the log cannot be written.
    pub fn append_log<S: AsRef<str>>(&self, lines: &[S]) -> Result<()> {
        write_log_lines(&self.config.log_path, lines)
    }
}

/// Append newline-terminated lines to `path`, creating parent directories.
///
/// # Errors
/// Returns an error if the file cannot be opened or written.
pub fn write_log_lines<S: AsRef<str>>(path: impl AsRef<Path>, lines: &[S]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    for line in lines {
        writeln!(f, "{}", line.as_ref())?;
    }
    Ok(())
}
