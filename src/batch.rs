//! Micro-batch windowing and deserialization.
//!
//! A batch covers the source records `[cursor, min(cursor + batch_size, total))`.
//! Each line in the window is decoded independently: a line that fails to
//! parse is dropped with a warning and recorded as a [`MalformedLine`], but it
//! still counts toward [`Batch::consumed`]. The checkpoint advances past
//! poison records, otherwise a single bad line would stall ingestion forever.

use crate::io::source::{LogSource, SourceLine};
use crate::reading::{RawReading, Reading};
use anyhow::{Context, Result};
use std::fmt;
use tracing::{debug, warn};

/// Half-open range of source record indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub start: usize,
    pub end: usize,
}

impl BatchWindow {
    /// The next window after `cursor`, or `None` once the source is exhausted.
    #[must_use]
    pub fn next(cursor: usize, batch_size: usize, total: usize) -> Option<Self> {
        if cursor >= total || batch_size == 0 {
            return None;
        }
        Some(Self {
            start: cursor,
            end: cursor.saturating_add(batch_size).min(total),
        })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for BatchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A source line that could not be turned into a [`Reading`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// 0-based record index in the source.
    pub index: usize,
    pub error: String,
}

/// One decoded micro-batch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Window actually read; `end - start == consumed`.
    pub window: Option<BatchWindow>,
    /// Successfully decoded readings, in source order.
    pub readings: Vec<Reading>,
    /// Lines dropped at the parse boundary.
    pub malformed: Vec<MalformedLine>,
    /// Whitespace-only lines, skipped silently.
    pub blank: usize,
    /// Source records consumed, including dropped ones.
    pub consumed: usize,
}

impl Batch {
    /// Cursor value to commit once this batch is durable.
    #[must_use]
    pub fn next_cursor(&self) -> Option<usize> {
        self.window.map(|w| w.start + self.consumed)
    }
}

/// Slices a [`LogSource`] into bounded batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchReader {
    batch_size: usize,
}

impl BatchReader {
    #[must_use]
    pub const fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// See [`BatchWindow::next`].
    #[must_use]
    pub fn window(&self, cursor: usize, total: usize) -> Option<BatchWindow> {
        BatchWindow::next(cursor, self.batch_size, total)
    }

    /// Read and decode `window` from `source`.
    ///
    /// # Errors
    /// Returns an error only if the source itself cannot be read; bad lines are isolated.
    pub fn read<S: LogSource + ?Sized>(&self, source: &mut S, window: BatchWindow) -> Result<Batch> {
        let lines = source
            .read_range(window.start, window.end)
            .with_context(|| format!("read source records {window}"))?;
        if lines.len() < window.len() {
            warn!(
                %window,
                got = lines.len(),
                "source returned fewer records than expected"
            );
        }
        Ok(decode_lines(window.start, lines))
    }
}

/// Decode raw lines starting at record index `start`.
#[must_use]
pub fn decode_lines(start: usize, lines: Vec<SourceLine>) -> Batch {
    let consumed = lines.len();
    let mut batch = Batch {
        window: Some(BatchWindow {
            start,
            end: start + consumed,
        }),
        consumed,
        readings: Vec::with_capacity(consumed),
        ..Batch::default()
    };

    for line in lines {
        if line.text.trim().is_empty() {
            batch.blank += 1;
            continue;
        }
        match RawReading::parse_line(&line.text).and_then(RawReading::into_reading) {
            Ok(reading) => batch.readings.push(reading),
            Err(e) => {
                let error = format!("{e:#}");
                warn!(line = line.index + 1, %error, "dropping malformed record");
                batch.malformed.push(MalformedLine {
                    index: line.index,
                    error,
                });
            }
        }
    }

    if let (Some(first), Some(last)) = (batch.readings.first(), batch.readings.last()) {
        debug!(
            consumed,
            first_ppm = first.co2_ppm,
            last_ppm = last.co2_ppm,
            "batch decoded"
        );
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::VecLogSource;

    #[test]
    fn windows_for_37_records_of_15() {
        let reader = BatchReader::new(15);
        let mut cursor = 0;
        let mut sizes = Vec::new();
        while let Some(w) = reader.window(cursor, 37) {
            sizes.push(w.len());
            cursor = w.end;
        }
        assert_eq!(sizes, vec![15, 15, 7]);
        assert_eq!(cursor, 37);
    }

    #[test]
    fn no_window_past_the_end() {
        assert_eq!(BatchWindow::next(37, 15, 37), None);
        assert_eq!(BatchWindow::next(40, 15, 37), None);
        assert_eq!(BatchWindow::next(0, 15, 0), None);
    }

    #[test]
    fn malformed_lines_count_toward_consumption() {
        let mut src = VecLogSource::new([
            r#"{"ts":"2024-01-01T00:00:00","aula":"a","co2_ppm":500}"#,
            "{not json",
            "",
            r#"{"ts":"2024-01-01T00:00:15","aula":"a","co2_ppm":510}"#,
        ]);
        let reader = BatchReader::new(10);
        let w = reader.window(0, 4).unwrap();
        let batch = reader.read(&mut src, w).unwrap();
        assert_eq!(batch.readings.len(), 2);
        assert_eq!(batch.malformed.len(), 1);
        assert_eq!(batch.malformed[0].index, 1);
        assert_eq!(batch.blank, 1);
        assert_eq!(batch.consumed, 4);
        assert_eq!(batch.next_cursor(), Some(4));
    }

    #[test]
    fn short_read_limits_consumption() {
        let mut src = VecLogSource::new([r#"{"ts":"2024-01-01T00:00:00","aula":"a","co2_ppm":500}"#]);
        let reader = BatchReader::new(15);
        let batch = reader.read(&mut src, BatchWindow { start: 0, end: 15 }).unwrap();
        assert_eq!(batch.consumed, 1);
        assert_eq!(batch.next_cursor(), Some(1));
    }
}
