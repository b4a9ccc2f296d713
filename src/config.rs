//! Ingestion configuration.
//!
//! [`IngestConfig`] gathers every path and constant the pipeline needs. The
//! defaults reproduce the historical layout: the log and its checkpoint live
//! under `Data/`, everything the pipeline produces lives under `output/`.

use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of source records per micro-batch.
pub const DEFAULT_BATCH_SIZE: usize = 15;
/// Readings below this value are quarantined.
pub const DEFAULT_LOWER_BOUND: i64 = 300;
/// Readings above this value are quarantined.
pub const DEFAULT_UPPER_BOUND: i64 = 5000;
/// Pause between batches in live-streaming mode. Unused when replaying a finite log.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
/// Five-minute mean above which the report raises an alert.
pub const DEFAULT_ALERT_THRESHOLD_PPM: f64 = 1500.0;
/// Width of the report's alert windows.
pub const DEFAULT_ALERT_WINDOW_MIN: i64 = 5;

/// Inclusive range of physically plausible CO2 readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlierBounds {
    pub lower: i64,
    pub upper: i64,
}

impl Default for OutlierBounds {
    fn default() -> Self {
        Self {
            lower: DEFAULT_LOWER_BOUND,
            upper: DEFAULT_UPPER_BOUND,
        }
    }
}

impl OutlierBounds {
    #[must_use]
    pub const fn new(lower: i64, upper: i64) -> Self {
        Self { lower, upper }
    }

    /// `true` iff `value` lies within `[lower, upper]`.
    #[must_use]
    pub const fn contains(&self, value: i64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Configuration for one ingestion run.
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Append-only NDJSON log to consume.
    pub log_path: PathBuf,
    /// Plain-text file holding the committed cursor.
    pub checkpoint_path: PathBuf,
    /// Append-only NDJSON quarantine log.
    pub quarantine_path: PathBuf,
    /// SQLite database holding `co2_readings`.
    pub row_store_path: PathBuf,
    /// Root of the partitioned Parquet archive.
    pub archive_dir: PathBuf,
    /// Markdown report destination.
    pub report_path: PathBuf,
    /// Maximum source records per batch.
    pub batch_size: usize,
    /// Valid measurement range.
    pub bounds: OutlierBounds,
    /// Delay between batches; `None` replays as fast as possible.
    pub interval: Option<Duration>,
    /// Stop after this many batches even if the source is not exhausted.
    pub max_batches: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::rooted_at(".")
    }
}

impl IngestConfig {
    /// Default layout below `root`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let data = root.join("Data");
        let output = root.join("output");
        Self {
            log_path: data.join("lecturas.log"),
            checkpoint_path: data.join("ingestion_checkpoint.txt"),
            quarantine_path: output.join("quarantine.log"),
            row_store_path: output.join("events.sqlite"),
            archive_dir: output.join("data_lake").join("co2_events"),
            report_path: output.join("co2_reporte.md"),
            batch_size: DEFAULT_BATCH_SIZE,
            bounds: OutlierBounds::default(),
            interval: None,
            max_batches: None,
        }
    }

    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    #[must_use]
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: OutlierBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Sleep between batches, emulating the live consumer.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    /// Directories that must exist before the pipeline writes anything.
    #[must_use]
    pub fn output_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = [
            &self.checkpoint_path,
            &self.quarantine_path,
            &self.row_store_path,
            &self.report_path,
        ]
        .iter()
        .filter_map(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .collect();
        dirs.push(self.archive_dir.clone());
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Reject configurations the loop cannot make progress with.
    ///
    /// # Errors
    /// Returns an error if `batch_size` is zero or the bounds are inverted.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.bounds.lower > self.bounds.upper {
            bail!(
                "lower bound {} exceeds upper bound {}",
                self.bounds.lower,
                self.bounds.upper
            );
        }
        if self.max_batches == Some(0) {
            bail!("max_batches must be at least 1 when set");
        }
        Ok(())
    }
}
