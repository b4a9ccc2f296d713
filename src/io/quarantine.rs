//! NDJSON quarantine log.
//!
//! Each quarantined reading is appended as one JSON object: the original
//! record fields (`ts`, `aula`, `co2_ppm`) plus `reason`. The file is opened in
//! append mode for every call and never truncated.

use crate::reading::QuarantinedReading;
use crate::sink::QuarantineSink;
use anyhow::{Context, Result};
use std::fs::{OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only NDJSON file of rejected readings.
#[derive(Clone, Debug)]
pub struct NdjsonQuarantineSink {
    path: PathBuf,
}

impl NdjsonQuarantineSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QuarantineSink for NdjsonQuarantineSink {
    fn append(&mut self, records: &[QuarantinedReading]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {} for append", self.path.display()))?;
        let mut w = BufWriter::new(f);
        for (i, record) in records.iter().enumerate() {
            serde_json::to_writer(&mut w, record)
                .with_context(|| format!("serialize quarantined record #{i}"))?;
            w.write_all(b"\n")?;
        }
        w.flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        w.get_ref()
            .sync_data()
            .with_context(|| format!("sync {}", self.path.display()))?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use std::fs;

    fn q(ppm: i64) -> QuarantinedReading {
        QuarantinedReading {
            reading: Reading::new("2024-01-01T00:00:00", "aula_101", ppm),
            reason: format!("Outlier: {ppm}"),
        }
    }

    #[test]
    fn appends_without_truncating_or_deduplicating() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("quarantine.log");
        let mut sink = NdjsonQuarantineSink::new(&path);
        assert_eq!(sink.append(&[q(6000), q(100)]).unwrap(), 2);
        assert_eq!(sink.append(&[q(6000)]).unwrap(), 1);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let back: QuarantinedReading = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(back, q(6000));
    }

    #[test]
    fn empty_append_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("quarantine.log");
        NdjsonQuarantineSink::new(&path).append(&[]).unwrap();
        assert!(!path.exists());
    }
}
