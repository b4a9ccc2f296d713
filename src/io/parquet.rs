//! Partitioned Parquet archive.
//!
//! Valid readings are appended to a hive-style directory tree derived from
//! each reading's timestamp:
//!
//! ```text
//! {root}/
//! └── year=2024/
//!     └── month=03/
//!         └── day=07/
//!             └── hour=09/
//!                 ├── part-0000000015-0000000030-17a0c3f2b1e4d000.parquet
//!                 └── ...
//! ```
//!
//! Every [`ArchiveSink::append`] call writes one new part file per touched
//! partition; existing files are never rewritten. The part name carries the
//! source window `[start, end)` it came from, so entries appended by a replay
//! can be traced back to the batch that produced them. Partition columns live
//! in the path only, as in other hive-partitioned layouts.
//!
//! Part files are written to a hidden temporary file in the partition
//! directory and renamed into place after the writer is closed and synced;
//! readers never observe a half-written part. Publishing never replaces an
//! existing part: a name clash bumps the stamp and tries again.
//!
//! Uses `serde_arrow` (`SchemaLike::from_type` and
//! `to_record_batch`/`from_record_batch`) to map [`Reading`] to Arrow.

use crate::batch::BatchWindow;
use crate::reading::{ArchiveEntry, PartitionCoords, Reading};
use crate::sink::ArchiveSink;
use anyhow::{Context, Result, anyhow};
use arrow::datatypes::FieldRef;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use glob::{Pattern, glob};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use regex::Regex;
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_arrow::{from_record_batch, to_record_batch};
use std::collections::BTreeMap;
use std::fs::{File, create_dir_all};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::NamedTempFile;
use tracing::debug;

/// Root of a hive-partitioned Parquet archive of readings.
#[derive(Clone, Debug)]
pub struct PartitionedArchive {
    root: PathBuf,
}

impl PartitionedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one partition.
    #[must_use]
    pub fn partition_dir(&self, coords: &PartitionCoords) -> PathBuf {
        self.root
            .join(format!("year={:04}", coords.year))
            .join(format!("month={:02}", coords.month))
            .join(format!("day={:02}", coords.day))
            .join(format!("hour={:02}", coords.hour))
    }

    /// Every committed part file, sorted by path.
    ///
    /// # Errors
    /// Returns an error if the directory tree cannot be walked.
    pub fn part_files(&self) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}/year=*/month=*/day=*/hour=*/*.parquet",
            Pattern::escape(&self.root.to_string_lossy())
        );
        let paths = glob(&pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;
        let mut out = Vec::new();
        for entry in paths {
            let path =
                entry.with_context(|| format!("error reading glob entry for pattern: {pattern}"))?;
            if path.is_file() {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Read every entry in the archive, partition coordinates restored from the path.
    ///
    /// # Errors
    /// Returns an error if any part file cannot be read or sits outside a partition directory.
    pub fn read_all(&self) -> Result<Vec<ArchiveEntry>> {
        let mut out = Vec::new();
        for path in self.part_files()? {
            let partition = parse_partition_path(&path)
                .ok_or_else(|| anyhow!("{} is not inside a partition", path.display()))?;
            for reading in read_parquet_vec::<Reading>(&path)? {
                out.push(ArchiveEntry { reading, partition });
            }
        }
        Ok(out)
    }

    fn write_part(
        &self,
        coords: &PartitionCoords,
        window: BatchWindow,
        rows: &[Reading],
    ) -> Result<PathBuf> {
        let dir = self.partition_dir(coords);
        create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".part-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .with_context(|| format!("create temp part in {}", dir.display()))?;
        write_parquet_rows(tmp.as_file_mut(), rows)
            .with_context(|| format!("write part for partition {coords}"))?;
        tmp.as_file()
            .sync_all()
            .context("sync part file to disk")?;
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        publish_part(tmp, &dir, window, stamp)
    }
}

/// Name clashes tolerated before publishing gives up.
const MAX_PUBLISH_ATTEMPTS: i64 = 64;

fn part_name(window: BatchWindow, stamp: i64) -> String {
    format!(
        "part-{:010}-{:010}-{:016x}.parquet",
        window.start, window.end, stamp
    )
}

/// Move a finished temp part into `dir` without clobbering an existing part.
fn publish_part(
    mut tmp: NamedTempFile,
    dir: &Path,
    window: BatchWindow,
    stamp: i64,
) -> Result<PathBuf> {
    for attempt in 0..MAX_PUBLISH_ATTEMPTS {
        let target = dir.join(part_name(window, stamp.wrapping_add(attempt)));
        match tmp.persist_noclobber(&target) {
            Ok(_) => return Ok(target),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %target.display(), "part name taken; retrying");
                tmp = e.file;
            }
            Err(e) => {
                return Err(e.error).with_context(|| format!("publish {}", target.display()));
            }
        }
    }
    Err(anyhow!(
        "no free part name for window {window} in {} after {MAX_PUBLISH_ATTEMPTS} attempts",
        dir.display()
    ))
}

impl ArchiveSink for PartitionedArchive {
    fn append(&mut self, window: BatchWindow, readings: &[Reading]) -> Result<usize> {
        let mut partitions: BTreeMap<PartitionCoords, Vec<Reading>> = BTreeMap::new();
        for r in readings {
            let coords = r
                .partition()
                .with_context(|| format!("derive partition for ({}, {})", r.ts, r.aula))?;
            partitions.entry(coords).or_default().push(r.clone());
        }

        let mut appended = 0usize;
        for (coords, rows) in &partitions {
            let path = self.write_part(coords, window, rows)?;
            debug!(partition = %coords, rows = rows.len(), path = %path.display(), "archive part written");
            appended += rows.len();
        }
        Ok(appended)
    }
}

/// Recover partition coordinates from a `.../year=YYYY/month=MM/day=DD/hour=HH/...` path.
#[must_use]
pub fn parse_partition_path(path: &Path) -> Option<PartitionCoords> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| {
            Regex::new(r"year=(\d{4})[/\\]month=(\d{1,2})[/\\]day=(\d{1,2})[/\\]hour=(\d{1,2})(?:[/\\]|$)").ok()
        })
        .as_ref()?;
    let s = path.to_string_lossy();
    let caps = re.captures_iter(&s).last()?;
    Some(PartitionCoords {
        year: caps[1].parse().ok()?,
        month: caps[2].parse().ok()?,
        day: caps[3].parse().ok()?,
        hour: caps[4].parse().ok()?,
    })
}

/// Serialize rows into one Parquet file written to `out`.
fn write_parquet_rows(out: &mut File, rows: &[Reading]) -> Result<()> {
    let fields: Vec<FieldRef> = Vec::<FieldRef>::from_type::<Reading>(TracingOptions::default())
        .context("infer Arrow schema from Reading")?;
    let batch: RecordBatch = to_record_batch(&fields, &rows).context("convert rows to RecordBatch")?;

    let props = WriterProperties::builder().build();
    let mut writer =
        ArrowWriter::try_new(out, batch.schema(), Some(props)).context("create ArrowWriter")?;
    writer.write(&batch).context("write batch to parquet")?;
    writer.close().context("close ArrowWriter")?;
    Ok(())
}

/// Read a Parquet file into typed rows.
///
/// # Errors
/// Returns an error if the file cannot be opened, decoded, or mapped to `T`.
pub fn read_parquet_vec<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("open ParquetRecordBatchReader")?;
    let mut reader = builder
        .with_batch_size(64 * 1024)
        .build()
        .context("build ParquetRecordBatchReader")?;

    let mut out: Vec<T> = Vec::new();
    while let Some(batch) = reader.next().transpose().context("read next batch")? {
        let mut rows: Vec<T> =
            from_record_batch(&batch).context("deserialize RecordBatch rows")?;
        out.append(&mut rows);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings() -> Vec<Reading> {
        vec![
            Reading::new("2024-03-07T09:59:45", "aula_101", 600),
            Reading::new("2024-03-07T10:00:00", "aula_101", 610),
            Reading::new("2024-03-07T10:00:15", "aula_101", 620),
        ]
    }

    #[test]
    fn publishing_never_replaces_an_existing_part() {
        let tmp = tempfile::tempdir().unwrap();
        let window = BatchWindow { start: 0, end: 15 };
        let taken = tmp.path().join(part_name(window, 7));
        std::fs::write(&taken, b"earlier part").unwrap();

        let mut part = NamedTempFile::new_in(tmp.path()).unwrap();
        std::io::Write::write_all(&mut part, b"replayed part").unwrap();
        let published = publish_part(part, tmp.path(), window, 7).unwrap();

        assert_ne!(published, taken);
        assert_eq!(published, tmp.path().join(part_name(window, 8)));
        assert_eq!(std::fs::read(&taken).unwrap(), b"earlier part");
        assert_eq!(std::fs::read(&published).unwrap(), b"replayed part");
    }

    #[test]
    fn appends_split_by_hour() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = PartitionedArchive::new(tmp.path().join("lake"));
        let n = archive
            .append(BatchWindow { start: 0, end: 3 }, &readings())
            .unwrap();
        assert_eq!(n, 3);

        let parts = archive.part_files().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].to_string_lossy().contains("hour=09"));
        assert!(
            parts[1]
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("part-0000000000-0000000003-")
        );

        let mut entries = archive.read_all().unwrap();
        entries.sort_by(|a, b| a.reading.ts.cmp(&b.reading.ts));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].partition.hour, 9);
        assert_eq!(entries[2].partition.hour, 10);
        assert_eq!(entries[2].reading, readings()[2]);
    }

    #[test]
    fn replays_append_again() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = PartitionedArchive::new(tmp.path());
        let w = BatchWindow { start: 0, end: 3 };
        archive.append(w, &readings()).unwrap();
        archive.append(w, &readings()).unwrap();
        assert_eq!(archive.read_all().unwrap().len(), 6);
    }

    #[test]
    fn unparsable_timestamp_fails_append() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = PartitionedArchive::new(tmp.path());
        let bad = vec![Reading::new("not a time", "a", 500)];
        assert!(archive.append(BatchWindow { start: 0, end: 1 }, &bad).is_err());
    }

    #[test]
    fn partition_path_parsing() {
        let p = Path::new("/x/lake/year=2024/month=03/day=07/hour=09/part-1.parquet");
        assert_eq!(
            parse_partition_path(p),
            Some(PartitionCoords {
                year: 2024,
                month: 3,
                day: 7,
                hour: 9
            })
        );
        assert_eq!(parse_partition_path(Path::new("/x/lake/part-1.parquet")), None);
    }

    #[test]
    fn empty_archive_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = PartitionedArchive::new(tmp.path().join("missing"));
        assert!(archive.read_all().unwrap().is_empty());
    }
}
