//! Checkpointed micro-batch orchestrator.
//!
//! [`Orchestrator::run`] drives the loop
//!
//! ```text
//! LoadingCheckpoint → (ReadingBatch → Filtering → Writing → AdvancingCheckpoint)* → Done
//! ```
//!
//! One iteration is [`Orchestrator::step`]: it takes the current cursor and
//! returns the report of the batch it committed, whose `cursor_after` is the
//! next cursor. The checkpoint is saved only after the quarantine log, the row
//! store and the archive all accepted the batch. A quarantine failure does not
//! keep valid readings out of storage, but it still fails the iteration. Any
//! failure leaves the cursor where it was; the next run replays that batch in
//! full.
//!
//! A finite log is replayed as fast as possible against a record count taken
//! when the run starts. With an interval configured the loop sleeps between
//! batches and re-counts the source every iteration, following a log that a
//! producer is still appending to.

use crate::batch::{BatchReader, BatchWindow};
use crate::checkpoint::CheckpointStore;
use crate::config::IngestConfig;
use crate::filter::OutlierFilter;
use crate::io::source::LogSource;
use crate::metrics::{GaugeMetric, MetricsCollector, names};
use crate::sink::{DualSinkWriter, QuarantineSink, WriteOutcome};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest the interval pause goes without checking the stop flag.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Where the orchestrator is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestState {
    LoadingCheckpoint,
    ReadingBatch,
    Filtering,
    Writing,
    AdvancingCheckpoint,
    Done,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LoadingCheckpoint => "LOADING_CHECKPOINT",
            Self::ReadingBatch => "READING_BATCH",
            Self::Filtering => "FILTERING",
            Self::Writing => "WRITING",
            Self::AdvancingCheckpoint => "ADVANCING_CHECKPOINT",
            Self::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// What one committed batch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub start: usize,
    pub end: usize,
    /// Source records consumed, including malformed and blank lines.
    pub consumed: usize,
    pub malformed: usize,
    pub blank: usize,
    pub valid: usize,
    pub quarantined: usize,
    pub rows_inserted: usize,
    pub archive_entries: usize,
    /// Cursor committed for this batch.
    pub cursor_after: usize,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every record counted at the start of the run was processed.
    Exhausted,
    /// The configured batch limit was reached.
    BatchLimit,
    /// The stop flag was raised between batches.
    Stopped,
}

/// Totals for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub start_cursor: usize,
    pub final_cursor: usize,
    /// Records the source held when the run last counted them.
    pub total_records: usize,
    pub batches: usize,
    pub consumed: usize,
    pub malformed: usize,
    pub valid: usize,
    pub quarantined: usize,
    pub rows_inserted: usize,
    pub archive_entries: usize,
    pub outcome: RunOutcome,
}

impl RunSummary {
    fn new(start_cursor: usize, total_records: usize) -> Self {
        Self {
            start_cursor,
            final_cursor: start_cursor,
            total_records,
            batches: 0,
            consumed: 0,
            malformed: 0,
            valid: 0,
            quarantined: 0,
            rows_inserted: 0,
            archive_entries: 0,
            outcome: RunOutcome::Exhausted,
        }
    }

    /// Share of parsed readings that went to quarantine; zero for an idle run.
    #[must_use]
    pub fn quarantine_ratio(&self) -> f64 {
        let parsed = self.valid + self.quarantined;
        if parsed == 0 {
            0.0
        } else {
            self.quarantined as f64 / parsed as f64
        }
    }

    fn absorb(&mut self, b: &BatchReport) {
        self.final_cursor = b.cursor_after;
        self.batches += 1;
        self.consumed += b.consumed;
        self.malformed += b.malformed;
        self.valid += b.valid;
        self.quarantined += b.quarantined;
        self.rows_inserted += b.rows_inserted;
        self.archive_entries += b.archive_entries;
    }
}

/// Drives source → filter → sinks → checkpoint, one micro-batch at a time.
pub struct Orchestrator {
    source: Box<dyn LogSource>,
    checkpoint: Box<dyn CheckpointStore>,
    quarantine: Box<dyn QuarantineSink>,
    sinks: DualSinkWriter,
    reader: BatchReader,
    filter: OutlierFilter,
    interval: Option<Duration>,
    max_batches: Option<usize>,
    stop: Arc<AtomicBool>,
    metrics: MetricsCollector,
    state: IngestState,
}

impl Orchestrator {
    /// Wire an orchestrator from explicit parts. Paths in `config` are ignored.
    pub fn new(
        config: &IngestConfig,
        source: Box<dyn LogSource>,
        checkpoint: Box<dyn CheckpointStore>,
        quarantine: Box<dyn QuarantineSink>,
        sinks: DualSinkWriter,
    ) -> Self {
        Self {
            source,
            checkpoint,
            quarantine,
            sinks,
            reader: BatchReader::new(config.batch_size),
            filter: OutlierFilter::new(config.bounds),
            interval: config.interval,
            max_batches: config.max_batches,
            stop: Arc::default(),
            metrics: MetricsCollector::new(),
            state: IngestState::LoadingCheckpoint,
        }
    }

    /// File-backed orchestrator: NDJSON log, checkpoint file, NDJSON
    /// quarantine, SQLite row store and Parquet archive at `config`'s paths.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the log is missing,
    /// or the row store cannot be opened.
    #[cfg(feature = "io-parquet")]
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        use crate::checkpoint::FileCheckpointStore;
        use crate::io::parquet::PartitionedArchive;
        use crate::io::quarantine::NdjsonQuarantineSink;
        use crate::io::source::NdjsonLogSource;
        use crate::io::sqlite::SqliteRowStore;

        config.validate()?;
        let mut source = NdjsonLogSource::open(&config.log_path)?;
        if config.interval.is_some() {
            source = source.following();
        }
        let rows = SqliteRowStore::open(&config.row_store_path)?;
        let sinks = DualSinkWriter::new(
            Box::new(rows),
            Box::new(PartitionedArchive::new(&config.archive_dir)),
        );
        Ok(Self::new(
            config,
            Box::new(source),
            Box::new(FileCheckpointStore::new(&config.checkpoint_path)),
            Box::new(NdjsonQuarantineSink::new(&config.quarantine_path)),
            sinks,
        ))
    }

    /// Share a flag that stops the loop before the next batch once set.
    #[must_use]
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Use an existing collector instead of a private one.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    #[must_use]
    pub const fn state(&self) -> IngestState {
        self.state
    }

    /// Process the batch starting at `cursor`, given `total` available records.
    ///
    /// Returns `Ok(None)` without touching any sink when there is nothing
    /// left to read.
    ///
    /// # Errors
    /// Returns an error if the source cannot be read, any sink fails, or the
    /// checkpoint cannot be saved. The checkpoint is not advanced in any of
    /// these cases.
    pub fn step(&mut self, cursor: usize, total: usize) -> Result<Option<BatchReport>> {
        self.state = IngestState::ReadingBatch;
        let Some(window) = self.reader.window(cursor, total) else {
            self.state = IngestState::Done;
            return Ok(None);
        };
        let batch = self.reader.read(self.source.as_mut(), window)?;
        let Some(next_cursor) = batch.next_cursor().filter(|_| batch.consumed > 0) else {
            warn!(%window, "source yielded no records for a non-empty window; stopping");
            self.state = IngestState::Done;
            return Ok(None);
        };
        let read_window = BatchWindow {
            start: window.start,
            end: next_cursor,
        };

        self.state = IngestState::Filtering;
        let split = self.filter.classify(batch.readings);

        self.state = IngestState::Writing;
        let quarantined = self.quarantine.append(&split.quarantined);
        if let Err(e) = &quarantined {
            let error = format!("{e:#}");
            error!(
                window = %read_window,
                records = split.quarantined.len(),
                %error,
                "quarantine write failed; storing valid readings before failing the batch"
            );
        }
        let WriteOutcome {
            rows_inserted,
            archive_entries,
        } = self.sinks.write(read_window, &split.valid)?;
        quarantined.with_context(|| format!("quarantine write failed for batch {read_window}"))?;

        self.state = IngestState::AdvancingCheckpoint;
        self.checkpoint
            .save(next_cursor)
            .with_context(|| format!("save checkpoint {next_cursor} after batch {read_window}"))?;

        let report = BatchReport {
            start: read_window.start,
            end: read_window.end,
            consumed: batch.consumed,
            malformed: batch.malformed.len(),
            blank: batch.blank,
            valid: split.valid.len(),
            quarantined: split.quarantined.len(),
            rows_inserted,
            archive_entries,
            cursor_after: next_cursor,
        };
        self.record(&report);
        info!(
            window = %read_window,
            valid = report.valid,
            quarantined = report.quarantined,
            malformed = report.malformed,
            rows_inserted,
            archive_entries,
            checkpoint = next_cursor,
            "batch committed"
        );
        Ok(Some(report))
    }

    fn record(&self, b: &BatchReport) {
        let m = &self.metrics;
        m.increment_counter(names::BATCHES, 1);
        m.increment_counter(names::RECORDS_CONSUMED, b.consumed as u64);
        m.increment_counter(names::RECORDS_MALFORMED, b.malformed as u64);
        m.increment_counter(names::READINGS_VALID, b.valid as u64);
        m.increment_counter(names::READINGS_QUARANTINED, b.quarantined as u64);
        m.increment_counter(names::ROWS_INSERTED, b.rows_inserted as u64);
        m.increment_counter(names::ARCHIVE_ENTRIES, b.archive_entries as u64);
        m.set_counter(names::CHECKPOINT, b.cursor_after as u64);
    }

    /// Sleep for `interval`, returning early once the stop flag is raised.
    fn pause(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.stop.load(Ordering::SeqCst) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(STOP_POLL));
        }
    }

    /// Run batches from the stored checkpoint until the source is exhausted,
    /// the batch limit is hit, or the stop flag is raised.
    ///
    /// # Errors
    /// Returns the first batch failure; batches committed before it stay committed.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.state = IngestState::LoadingCheckpoint;
        self.metrics.record_start();
        let mut cursor = self.checkpoint.load();
        let mut total = self.source.total_records().context("count source records")?;
        let mut summary = RunSummary::new(cursor, total);
        info!(checkpoint = cursor, total, "ingestion starting");

        if cursor > total {
            warn!(
                checkpoint = cursor,
                total, "checkpoint is past the end of the source; nothing to do"
            );
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!(checkpoint = cursor, "stop requested");
                summary.outcome = RunOutcome::Stopped;
                break;
            }
            if self.max_batches.is_some_and(|max| summary.batches >= max) {
                info!(batches = summary.batches, "batch limit reached");
                summary.outcome = RunOutcome::BatchLimit;
                break;
            }
            if self.interval.is_some() {
                total = self.source.total_records().context("count source records")?;
                summary.total_records = total;
            }

            let Some(report) = self.step(cursor, total)? else {
                summary.outcome = RunOutcome::Exhausted;
                break;
            };
            debug_assert!(report.cursor_after > cursor);
            cursor = report.cursor_after;
            summary.absorb(&report);

            if let Some(interval) = self.interval
                && cursor < total
            {
                debug!(?interval, "waiting for next batch");
                self.pause(interval);
            }
        }

        self.state = IngestState::Done;
        self.metrics.register(Box::new(
            GaugeMetric::new(names::QUARANTINE_RATIO, summary.quarantine_ratio())
                .with_description("quarantined / (valid + quarantined) readings this run"),
        ));
        self.metrics.record_end();
        info!(
            batches = summary.batches,
            checkpoint = summary.final_cursor,
            valid = summary.valid,
            quarantined = summary.quarantined,
            malformed = summary.malformed,
            outcome = ?summary.outcome,
            "ingestion finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::VecLogSource;
    use crate::testing::{
        FailingArchive, FailingQuarantine, MemoryArchive, MemoryCheckpointStore, MemoryQuarantine,
        MemoryRowStore, reading_at, to_line,
    };

    struct Harness {
        checkpoint: MemoryCheckpointStore,
        rows: MemoryRowStore,
        archive: MemoryArchive,
        quarantine: MemoryQuarantine,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                checkpoint: MemoryCheckpointStore::new(),
                rows: MemoryRowStore::new(),
                archive: MemoryArchive::new(),
                quarantine: MemoryQuarantine::new(),
            }
        }

        fn orchestrator(&self, config: &IngestConfig, lines: &[String]) -> Orchestrator {
            Orchestrator::new(
                config,
                Box::new(VecLogSource::new(lines.iter().cloned())),
                Box::new(self.checkpoint.clone()),
                Box::new(self.quarantine.clone()),
                DualSinkWriter::new(Box::new(self.rows.clone()), Box::new(self.archive.clone())),
            )
        }
    }

    fn lines(ppms: &[i64]) -> Vec<String> {
        ppms.iter()
            .enumerate()
            .map(|(i, &p)| to_line(&reading_at(i, p)))
            .collect()
    }

    #[test]
    fn step_on_exhausted_source_returns_none() {
        let h = Harness::new();
        let cfg = IngestConfig::default();
        let mut o = h.orchestrator(&cfg, &lines(&[500]));
        assert!(o.step(1, 1).unwrap().is_none());
        assert_eq!(o.state(), IngestState::Done);
        assert!(h.checkpoint.history().is_empty());
    }

    #[test]
    fn step_commits_one_batch() {
        let h = Harness::new();
        let cfg = IngestConfig::default().with_batch_size(2);
        let mut o = h.orchestrator(&cfg, &lines(&[500, 6000, 700]));
        let r = o.step(0, 3).unwrap().unwrap();
        assert_eq!((r.start, r.end, r.cursor_after), (0, 2, 2));
        assert_eq!((r.valid, r.quarantined), (1, 1));
        assert_eq!(h.checkpoint.history(), vec![2]);
        assert_eq!(o.state(), IngestState::AdvancingCheckpoint);
    }

    #[test]
    fn quarantine_failure_stores_valid_rows_but_keeps_checkpoint() {
        let h = Harness::new();
        let cfg = IngestConfig::default();
        let mut o = Orchestrator::new(
            &cfg,
            Box::new(VecLogSource::new(lines(&[500, 6000]))),
            Box::new(h.checkpoint.clone()),
            Box::new(FailingQuarantine),
            DualSinkWriter::new(Box::new(h.rows.clone()), Box::new(h.archive.clone())),
        );
        let err = o.run().unwrap_err();
        assert!(format!("{err:#}").contains("quarantine write failed for batch [0, 2)"));
        assert_eq!(h.rows.len(), 1);
        assert_eq!(h.archive.len(), 1);
        assert!(h.checkpoint.history().is_empty());
    }

    #[test]
    fn archive_failure_keeps_checkpoint() {
        let h = Harness::new();
        let cfg = IngestConfig::default().with_batch_size(2);
        let mut o = Orchestrator::new(
            &cfg,
            Box::new(VecLogSource::new(lines(&[500, 510, 520, 530]))),
            Box::new(h.checkpoint.clone()),
            Box::new(h.quarantine.clone()),
            DualSinkWriter::new(
                Box::new(h.rows.clone()),
                Box::new(FailingArchive::on_call(2, h.archive.clone())),
            ),
        );
        let err = o.run().unwrap_err();
        assert!(format!("{err:#}").contains("[2, 4)"));
        assert_eq!(h.checkpoint.history(), vec![2]);
        assert_eq!(o.state(), IngestState::Writing);
    }

    #[test]
    fn run_reports_quarantine_ratio_gauge() {
        let h = Harness::new();
        let mut o = h.orchestrator(&IngestConfig::default(), &lines(&[500, 6000, 510, 100]));
        let s = o.run().unwrap();
        assert!((s.quarantine_ratio() - 0.5).abs() < f64::EPSILON);
        let j = o.metrics().to_json();
        assert_eq!(j[names::QUARANTINE_RATIO]["value"], 0.5);
        assert_eq!(j[names::READINGS_QUARANTINED]["value"], 2);
    }

    #[test]
    fn max_batches_stops_early() {
        let h = Harness::new();
        let cfg = IngestConfig::default().with_batch_size(1).with_max_batches(2);
        let mut o = h.orchestrator(&cfg, &lines(&[500, 510, 520]));
        let s = o.run().unwrap();
        assert_eq!(s.outcome, RunOutcome::BatchLimit);
        assert_eq!(s.final_cursor, 2);
    }

    #[test]
    fn raised_stop_flag_stops_before_first_batch() {
        let h = Harness::new();
        let stop = Arc::new(AtomicBool::new(true));
        let mut o = h
            .orchestrator(&IngestConfig::default(), &lines(&[500]))
            .with_stop_flag(stop);
        let s = o.run().unwrap();
        assert_eq!(s.outcome, RunOutcome::Stopped);
        assert_eq!(s.batches, 0);
        assert!(h.rows.is_empty());
    }

    #[test]
    fn stop_flag_cuts_the_interval_pause_short() {
        let h = Harness::new();
        let stop = Arc::new(AtomicBool::new(false));
        let cfg = IngestConfig::default()
            .with_batch_size(1)
            .with_interval(Duration::from_secs(60));
        let mut o = h
            .orchestrator(&cfg, &lines(&[500, 510]))
            .with_stop_flag(stop.clone());

        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stop.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        let s = o.run().unwrap();
        raiser.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(s.outcome, RunOutcome::Stopped);
        assert_eq!(s.batches, 1);
        assert_eq!(h.checkpoint.history(), vec![1]);
    }

    #[test]
    fn extreme_reading_is_quarantined_not_fatal() {
        let h = Harness::new();
        let line = r#"{"ts":"2024-03-07T09:00:00","aula":"aula_101","co2_ppm":-9223372036854775808}"#;
        let mut o = h.orchestrator(&IngestConfig::default(), &[line.to_string()]);
        let s = o.run().unwrap();
        assert_eq!((s.valid, s.quarantined), (0, 1));
        assert_eq!(h.quarantine.records()[0].reading.co2_ppm, i64::MIN);
        assert_eq!(h.checkpoint.history(), vec![1]);
    }

    #[test]
    fn resumes_from_stored_checkpoint() {
        let mut h = Harness::new();
        h.checkpoint = MemoryCheckpointStore::starting_at(2);
        let mut o = h.orchestrator(&IngestConfig::default(), &lines(&[500, 510, 520]));
        let s = o.run().unwrap();
        assert_eq!(s.start_cursor, 2);
        assert_eq!(s.consumed, 1);
        assert_eq!(h.rows.len(), 1);
    }

    #[test]
    fn checkpoint_past_end_is_a_no_op() {
        let mut h = Harness::new();
        h.checkpoint = MemoryCheckpointStore::starting_at(10);
        let mut o = h.orchestrator(&IngestConfig::default(), &lines(&[500]));
        let s = o.run().unwrap();
        assert_eq!(s.batches, 0);
        assert_eq!(s.final_cursor, 10);
        assert_eq!(h.checkpoint.history(), vec![10]);
    }
}
