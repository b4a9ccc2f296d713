//! Sink abstractions and the dual-sink writer.
//!
//! Valid readings land in two independent stores:
//! - a **row store** ([`RowSink`]) with insert-if-absent semantics on the
//!   natural key `(ts, aula)`; replaying a reading is a silent no-op;
//! - a **partitioned archive** ([`ArchiveSink`]) that appends every reading
//!   under its `year/month/day/hour` partition. The archive is an event
//!   journal: replays append again and are not deduplicated.
//!
//! Quarantined readings go to a [`QuarantineSink`], an append-only audit
//! trail that never deduplicates either.
//!
//! [`DualSinkWriter::write`] writes the row store first, then the archive. A
//! failure on either side fails the whole batch so the caller keeps its
//! checkpoint where it was and the batch is replayed in full next time.

use crate::batch::BatchWindow;
use crate::reading::{QuarantinedReading, Reading};
use anyhow::{Context, Result};
use tracing::debug;

/// Append-only audit log for rejected readings.
pub trait QuarantineSink {
    /// Append every record; returns the number of records written.
    ///
    /// # Errors
    /// Returns an error if the records could not be appended.
    fn append(&mut self, records: &[QuarantinedReading]) -> Result<usize>;
}

/// Row-oriented store keyed on `(ts, aula)`.
pub trait RowSink {
    /// Insert readings not already present. Returns the number of rows newly inserted.
    ///
    /// Implementations must apply the whole slice atomically or not at all.
    ///
    /// # Errors
    /// Returns an error if the write could not be committed.
    fn insert_new(&mut self, readings: &[Reading]) -> Result<usize>;
}

/// Partitioned, append-only archive.
pub trait ArchiveSink {
    /// Append one batch worth of readings. Returns the number of entries appended.
    ///
    /// # Errors
    /// Returns an error if any partition could not be written.
    fn append(&mut self, window: BatchWindow, readings: &[Reading]) -> Result<usize>;
}

impl<T: QuarantineSink + ?Sized> QuarantineSink for Box<T> {
    fn append(&mut self, records: &[QuarantinedReading]) -> Result<usize> {
        (**self).append(records)
    }
}

impl<T: RowSink + ?Sized> RowSink for Box<T> {
    fn insert_new(&mut self, readings: &[Reading]) -> Result<usize> {
        (**self).insert_new(readings)
    }
}

impl<T: ArchiveSink + ?Sized> ArchiveSink for Box<T> {
    fn append(&mut self, window: BatchWindow, readings: &[Reading]) -> Result<usize> {
        (**self).append(window, readings)
    }
}

/// Observability counts for one dual-sink write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Rows newly inserted in the row store; replays report fewer.
    pub rows_inserted: usize,
    /// Entries appended to the archive.
    pub archive_entries: usize,
}

/// Writes valid readings to both the row store and the archive.
pub struct DualSinkWriter {
    rows: Box<dyn RowSink>,
    archive: Box<dyn ArchiveSink>,
}

impl DualSinkWriter {
    pub fn new(rows: Box<dyn RowSink>, archive: Box<dyn ArchiveSink>) -> Self {
        Self { rows, archive }
    }

    /// Persist `valid` to both sinks.
    ///
    /// An empty slice touches neither sink.
    ///
    /// # Errors
    /// Returns the first sink failure, annotated with the batch window.
    pub fn write(&mut self, window: BatchWindow, valid: &[Reading]) -> Result<WriteOutcome> {
        if valid.is_empty() {
            debug!(%window, "no valid readings, skipping storage");
            return Ok(WriteOutcome::default());
        }

        let rows_inserted = self
            .rows
            .insert_new(valid)
            .with_context(|| format!("row store write failed for batch {window}"))?;
        let archive_entries = self
            .archive
            .append(window, valid)
            .with_context(|| format!("archive write failed for batch {window}"))?;

        debug!(
            %window,
            submitted = valid.len(),
            rows_inserted,
            archive_entries,
            "batch stored"
        );
        Ok(WriteOutcome {
            rows_inserted,
            archive_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingArchive, MemoryArchive, MemoryRowStore};

    fn readings() -> Vec<Reading> {
        vec![
            Reading::new("2024-01-01T00:00:00", "aula_101", 500),
            Reading::new("2024-01-01T00:00:15", "aula_101", 510),
        ]
    }

    #[test]
    fn replay_inserts_no_new_rows_but_appends_archive() {
        let rows = MemoryRowStore::new();
        let archive = MemoryArchive::new();
        let mut w = DualSinkWriter::new(Box::new(rows.clone()), Box::new(archive.clone()));
        let window = BatchWindow { start: 0, end: 2 };

        let first = w.write(window, &readings()).unwrap();
        let second = w.write(window, &readings()).unwrap();

        assert_eq!(first.rows_inserted, 2);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.archive_entries, 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(archive.len(), 4);
    }

    #[test]
    fn archive_failure_fails_the_write() {
        let rows = MemoryRowStore::new();
        let mut w = DualSinkWriter::new(Box::new(rows.clone()), Box::new(FailingArchive::always()));
        let err = w
            .write(BatchWindow { start: 15, end: 17 }, &readings())
            .unwrap_err();
        assert!(format!("{err:#}").contains("[15, 17)"));
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let mut w = DualSinkWriter::new(
            Box::new(MemoryRowStore::new()),
            Box::new(FailingArchive::always()),
        );
        let out = w.write(BatchWindow { start: 0, end: 3 }, &[]).unwrap();
        assert_eq!(out, WriteOutcome::default());
    }
}
