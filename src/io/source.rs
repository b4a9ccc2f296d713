//! Append-only, line-delimited log sources.
//!
//! A [`LogSource`] exposes the log as an ordered sequence of raw lines
//! addressed by 0-based record index. The ingestion core never writes to it.
//!
//! # Notes
//! - A final line without `\n` counts as a record when replaying a finished
//!   log. A [following](NdjsonLogSource::following) source treats it as a
//!   record the producer has not finished appending and waits for its newline.
//! - Bytes that are not valid UTF-8 are replaced, so such a line surfaces as a
//!   malformed record instead of failing the whole batch.
//! - Sequential range reads reuse one open reader; seeking backwards reopens
//!   the file and skips forward, which also works for compressed logs.

use crate::io::compression::open_decoded;
use anyhow::{Context, Result, ensure};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One raw line read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// 0-based record index in the source.
    pub index: usize,
    /// Line content without the trailing newline.
    pub text: String,
}

/// Ordered, append-only record source.
pub trait LogSource {
    /// Number of complete records currently available.
    ///
    /// # Errors
    /// Returns an error if the source cannot be read.
    fn total_records(&mut self) -> Result<usize>;

    /// Raw records `[start, end)`. Returns fewer lines only if the source shrank.
    ///
    /// # Errors
    /// Returns an error if the source cannot be read.
    fn read_range(&mut self, start: usize, end: usize) -> Result<Vec<SourceLine>>;
}

/// NDJSON file on disk, optionally gzip/zstd-compressed.
pub struct NdjsonLogSource {
    path: PathBuf,
    reader: Option<Box<dyn BufRead>>,
    /// Index of the next line `reader` will yield.
    position: usize,
    follow: bool,
}

/// Whether one `read_until` chunk is a record. Blank unterminated tails never are.
fn is_record(chunk: &[u8], follow: bool) -> bool {
    match chunk.last() {
        None => false,
        Some(b'\n') => true,
        Some(_) => !follow && !chunk.iter().all(u8::is_ascii_whitespace),
    }
}

impl NdjsonLogSource {
    /// # Errors
    /// Returns an error if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        ensure!(
            path.is_file(),
            "log source {} not found; generate it first",
            path.display()
        );
        Ok(Self {
            path,
            reader: None,
            position: 0,
            follow: false,
        })
    }

    /// Wait for the newline of an unterminated final line instead of
    /// counting it, for logs a producer is still appending to.
    #[must_use]
    pub fn following(mut self) -> Self {
        self.follow = true;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader = Some(open_decoded(&self.path)?);
        self.position = 0;
        Ok(())
    }

    /// Read one record. `Ok(None)` at end of data or on a fragment still
    /// being written.
    fn next_line(&mut self) -> Result<Option<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let mut buf = Vec::new();
        reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("read line {} in {}", self.position + 1, self.path.display()))?;
        if !is_record(&buf, self.follow) {
            if !buf.is_empty() {
                // The fragment's bytes are consumed; reopen before reading on.
                self.reader = None;
            }
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        self.position += 1;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

impl LogSource for NdjsonLogSource {
    fn total_records(&mut self) -> Result<usize> {
        let mut rdr = open_decoded(&self.path)?;
        let mut total = 0usize;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            rdr.read_until(b'\n', &mut buf)
                .with_context(|| format!("count lines in {}", self.path.display()))?;
            if is_record(&buf, self.follow) {
                total += 1;
            } else {
                if !buf.is_empty() && self.follow {
                    warn!(
                        path = %self.path.display(),
                        bytes = buf.len(),
                        records = total,
                        "unterminated final line held back until its newline lands"
                    );
                }
                break;
            }
        }
        Ok(total)
    }

    fn read_range(&mut self, start: usize, end: usize) -> Result<Vec<SourceLine>> {
        if self.reader.is_none() || start < self.position {
            self.rewind()?;
        }
        while self.position < start {
            if self.next_line()?.is_none() {
                return Ok(Vec::new());
            }
        }
        let mut out = Vec::with_capacity(end.saturating_sub(start));
        while self.position < end {
            let index = self.position;
            match self.next_line()? {
                Some(text) => out.push(SourceLine { index, text }),
                None => break,
            }
        }
        Ok(out)
    }
}

/// In-memory source, handy for tests and for feeding already-loaded logs.
#[derive(Debug, Clone, Default)]
pub struct VecLogSource {
    lines: Vec<String>,
}

impl VecLogSource {
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a record, as a producer would.
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

impl LogSource for VecLogSource {
    fn total_records(&mut self) -> Result<usize> {
        Ok(self.lines.len())
    }

    fn read_range(&mut self, start: usize, end: usize) -> Result<Vec<SourceLine>> {
        let end = end.min(self.lines.len());
        Ok((start..end)
            .map(|index| SourceLine {
                index,
                text: self.lines[index].clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn texts(lines: &[SourceLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn replay_counts_unterminated_final_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        fs::write(&path, "a\nb\nc").unwrap();
        let mut src = NdjsonLogSource::open(&path).unwrap();
        assert_eq!(src.total_records().unwrap(), 3);
        assert_eq!(texts(&src.read_range(0, 10).unwrap()), vec!["a", "b", "c"]);
        assert_eq!(texts(&src.read_range(2, 3).unwrap()), vec!["c"]);
    }

    #[test]
    fn blank_unterminated_tail_is_not_a_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        fs::write(&path, "a\n  ").unwrap();
        let mut src = NdjsonLogSource::open(&path).unwrap();
        assert_eq!(src.total_records().unwrap(), 1);
        assert_eq!(texts(&src.read_range(0, 10).unwrap()), vec!["a"]);
    }

    #[test]
    fn following_waits_for_the_newline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        fs::write(&path, "a\nb\nc").unwrap();
        let mut src = NdjsonLogSource::open(&path).unwrap().following();
        assert_eq!(src.total_records().unwrap(), 2);
        assert_eq!(texts(&src.read_range(0, 10).unwrap()), vec!["a", "b"]);

        fs::write(&path, "a\nb\ncd\n").unwrap();
        assert_eq!(src.total_records().unwrap(), 3);
        assert_eq!(texts(&src.read_range(2, 3).unwrap()), vec!["cd"]);
    }

    #[test]
    fn sequential_and_backward_ranges() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        fs::write(&path, "0\n1\n2\n3\n4\n").unwrap();
        let mut src = NdjsonLogSource::open(&path).unwrap();
        assert_eq!(texts(&src.read_range(0, 2).unwrap()), vec!["0", "1"]);
        assert_eq!(texts(&src.read_range(2, 4).unwrap()), vec!["2", "3"]);
        let back = src.read_range(1, 3).unwrap();
        assert_eq!(texts(&back), vec!["1", "2"]);
        assert_eq!(back[0].index, 1);
        assert!(src.read_range(5, 7).unwrap().is_empty());
    }

    #[test]
    fn picks_up_appended_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        fs::write(&path, "0\n1\n").unwrap();
        let mut src = NdjsonLogSource::open(&path).unwrap();
        assert_eq!(src.total_records().unwrap(), 2);
        fs::write(&path, "0\n1\n2\n").unwrap();
        assert_eq!(src.total_records().unwrap(), 3);
        assert_eq!(texts(&src.read_range(2, 3).unwrap()), vec!["2"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(NdjsonLogSource::open(tmp.path().join("nope.log")).is_err());
    }

    #[test]
    fn crlf_is_stripped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        fs::write(&path, "a\r\nb\r\n").unwrap();
        let mut src = NdjsonLogSource::open(&path).unwrap();
        assert_eq!(texts(&src.read_range(0, 2).unwrap()), vec!["a", "b"]);
    }
}
