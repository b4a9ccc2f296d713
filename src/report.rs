//! Markdown air-quality report.
//!
//! The report is a read-only consumer of the row store. It needs nothing but
//! the readings ordered by timestamp and the raw checkpoint value, so the
//! aggregation functions here are pure and take plain slices.
//!
//! Sections:
//! 1. mean CO2 per room and minute, truncated to an integer, with the reading count;
//! 2. per-room tumbling windows of [`DEFAULT_ALERT_WINDOW_MIN`] minutes whose
//!    mean is compared against the alert threshold;
//! 3. the last committed checkpoint.

use crate::checkpoint::FileCheckpointStore;
use crate::config::{DEFAULT_ALERT_THRESHOLD_PPM, DEFAULT_ALERT_WINDOW_MIN, IngestConfig};
use crate::io::sqlite::SqliteRowStore;
use crate::reading::Reading;
use anyhow::{Context, Result, ensure};
use chrono::{Duration, NaiveDateTime, Timelike};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Mean of one room over one minute.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteMean {
    pub minute: NaiveDateTime,
    pub aula: String,
    pub mean_ppm: f64,
    pub count: usize,
}

/// Status of one alert window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Normal,
    Alert,
}

/// Mean of one room over one tumbling window.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertWindow {
    pub window_start: NaiveDateTime,
    pub aula: String,
    pub mean_ppm: f64,
    pub status: AlertStatus,
}

/// Aggregated report, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub per_minute: Vec<MinuteMean>,
    pub alerts: Vec<AlertWindow>,
    /// Raw checkpoint file content, `None` if no checkpoint exists.
    pub checkpoint: Option<String>,
    pub threshold_ppm: f64,
    pub window_minutes: i64,
}

/// Builds and writes the report.
#[derive(Debug, Clone, Copy)]
pub struct ReportGenerator {
    threshold_ppm: f64,
    window_minutes: i64,
}

impl Default for ReportGenerator {
    fn default() -> Self {
        Self {
            threshold_ppm: DEFAULT_ALERT_THRESHOLD_PPM,
            window_minutes: DEFAULT_ALERT_WINDOW_MIN,
        }
    }
}

impl ReportGenerator {
    /// # Errors
    /// Returns an error unless `window_minutes` is positive.
    pub fn new(threshold_ppm: f64, window_minutes: i64) -> Result<Self> {
        ensure!(window_minutes > 0, "alert window must be at least one minute");
        Ok(Self {
            threshold_ppm,
            window_minutes,
        })
    }

    /// Aggregate `readings`. Rows whose timestamp cannot be parsed are skipped with a warning.
    #[must_use]
    pub fn build(&self, readings: &[Reading], checkpoint: Option<String>) -> Report {
        let parsed: Vec<(NaiveDateTime, &Reading)> = readings
            .iter()
            .filter_map(|r| match r.timestamp() {
                Ok(ts) => Some((ts, r)),
                Err(e) => {
                    warn!(ts = %r.ts, aula = %r.aula, error = %e, "skipping row with bad timestamp");
                    None
                }
            })
            .collect();

        Report {
            per_minute: per_minute_means(&parsed),
            alerts: alert_windows(&parsed, self.window_minutes, self.threshold_ppm),
            checkpoint,
            threshold_ppm: self.threshold_ppm,
            window_minutes: self.window_minutes,
        }
    }

    /// Read the row store and checkpoint named by `config` and write the report.
    ///
    /// Returns `Ok(None)` without writing anything when the row store is empty.
    ///
    /// # Errors
    /// Returns an error if the row store or checkpoint cannot be read or the report cannot be written.
    pub fn generate(&self, config: &IngestConfig) -> Result<Option<PathBuf>> {
        ensure!(
            config.row_store_path.is_file(),
            "row store {} not found; run ingestion first",
            config.row_store_path.display()
        );
        let store = SqliteRowStore::open(&config.row_store_path)?;
        let readings = store.readings_ordered()?;
        if readings.is_empty() {
            warn!(path = %config.row_store_path.display(), "row store is empty; no report written");
            return Ok(None);
        }
        let checkpoint = FileCheckpointStore::new(&config.checkpoint_path).read_raw()?;
        let report = self.build(&readings, checkpoint);
        write_report(&config.report_path, &report.to_markdown())?;
        info!(
            path = %config.report_path.display(),
            readings = readings.len(),
            minutes = report.per_minute.len(),
            alerts = report.alerts.iter().filter(|w| w.status == AlertStatus::Alert).count(),
            "report written"
        );
        Ok(Some(config.report_path.clone()))
    }
}

fn truncate_to_minute(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(ts)
}

fn window_floor(ts: NaiveDateTime, minutes: i64) -> NaiveDateTime {
    let minute = truncate_to_minute(ts);
    let since_midnight = i64::from(minute.hour()) * 60 + i64::from(minute.minute());
    minute - Duration::minutes(since_midnight % minutes)
}

#[allow(clippy::cast_precision_loss)]
fn mean(sum: i64, count: usize) -> f64 {
    sum as f64 / count as f64
}

/// Per-room, per-minute means ordered by room, then minute.
fn per_minute_means(rows: &[(NaiveDateTime, &Reading)]) -> Vec<MinuteMean> {
    let mut groups: BTreeMap<(&str, NaiveDateTime), (i64, usize)> = BTreeMap::new();
    for (ts, r) in rows {
        let acc = groups
            .entry((r.aula.as_str(), truncate_to_minute(*ts)))
            .or_default();
        acc.0 += r.co2_ppm;
        acc.1 += 1;
    }
    groups
        .into_iter()
        .map(|((aula, minute), (sum, count))| MinuteMean {
            minute,
            aula: aula.to_string(),
            mean_ppm: mean(sum, count),
            count,
        })
        .collect()
}

/// Per-room tumbling windows ordered by window start, then room.
fn alert_windows(
    rows: &[(NaiveDateTime, &Reading)],
    minutes: i64,
    threshold: f64,
) -> Vec<AlertWindow> {
    let mut groups: BTreeMap<(NaiveDateTime, &str), (i64, usize)> = BTreeMap::new();
    for (ts, r) in rows {
        let acc = groups
            .entry((window_floor(*ts, minutes), r.aula.as_str()))
            .or_default();
        acc.0 += r.co2_ppm;
        acc.1 += 1;
    }
    groups
        .into_iter()
        .map(|((window_start, aula), (sum, count))| {
            let mean_ppm = mean(sum, count);
            AlertWindow {
                window_start,
                aula: aula.to_string(),
                mean_ppm,
                status: if mean_ppm > threshold {
                    AlertStatus::Alert
                } else {
                    AlertStatus::Normal
                },
            }
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn truncated(v: f64) -> i64 {
    v.trunc() as i64
}

impl Report {
    /// Render as Markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(md, "# CO2 Air Quality Report\n");

        let _ = writeln!(md, "## 1. Mean PPM per minute\n");
        let _ = writeln!(md, "| Minute | Room | Mean CO2 (ppm) | Readings |");
        let _ = writeln!(md, "|:---|:---|:---:|:---|");
        for m in &self.per_minute {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} |",
                m.minute.format("%Y-%m-%d %H:%M"),
                m.aula,
                truncated(m.mean_ppm),
                m.count
            );
        }

        let _ = writeln!(
            md,
            "\n## 2. Alerts ({} min mean > {} ppm)\n",
            self.window_minutes, self.threshold_ppm
        );
        let _ = writeln!(md, "| {} min window | Room | Mean CO2 (ppm) | Status |", self.window_minutes);
        let _ = writeln!(md, "|:---|:---|:---:|:---|");
        if self.alerts.is_empty() {
            let _ = writeln!(md, "| N/A | N/A | N/A | No windows to evaluate |");
        }
        for w in &self.alerts {
            let status = match w.status {
                AlertStatus::Normal => "NORMAL",
                AlertStatus::Alert => "ALERT (ventilate now)",
            };
            let _ = writeln!(
                md,
                "| {} | {} | {} | {status} |",
                w.window_start.format("%Y-%m-%d %H:%M"),
                w.aula,
                truncated(w.mean_ppm)
            );
        }

        let _ = writeln!(md, "\n## 3. Checkpoint\n");
        match &self.checkpoint {
            Some(cp) => {
                let _ = writeln!(
                    md,
                    "The last committed checkpoint is **{cp}**: the next run resumes reading the log at record {cp}."
                );
            }
            None => {
                let _ = writeln!(
                    md,
                    "No checkpoint file exists. The next run starts from the first record of the log."
                );
            }
        }
        md
    }
}

fn write_report(path: &Path, markdown: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }
    fs::write(path, markdown).with_context(|| format!("write report {}", path.display()))
}
