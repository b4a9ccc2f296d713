//! Synthetic CO2 log producer.
//!
//! Appends NDJSON readings for one room, one every 15 s of simulated time:
//! a base level plus noise and occupancy, floored at 400 ppm, with rare
//! spikes far above the valid range so the outlier filter has work to do.
//!
//! In append mode the simulation continues 15 s after the last parseable
//! timestamp already in the log. Otherwise, or when the log holds no
//! parseable record, it starts `records * 15 s` before now so the history
//! ends close to the present.

use crate::reading::{RawReading, Reading};
use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime, Timelike};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use tracing::{debug, info};

/// Parameters of the synthetic stream.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub records: usize,
    pub aula: String,
    pub base_ppm: i64,
    pub step: Duration,
    /// Probability of a spike in `5500..=7000` ppm.
    pub spike_probability: f64,
    /// Fixed RNG seed for reproducible logs.
    pub seed: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            records: 4500,
            aula: "aula_101".to_string(),
            base_ppm: 600,
            step: Duration::seconds(15),
            spike_probability: 0.005,
            seed: None,
        }
    }
}

/// How the log was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSummary {
    pub written: usize,
    /// `true` if the simulation continued an existing log.
    pub continued: bool,
    pub first_ts: Option<String>,
    pub last_ts: Option<String>,
}

/// One synthetic reading at `ts`.
pub fn generate_reading<R: Rng>(rng: &mut R, ts: NaiveDateTime, cfg: &GeneratorConfig) -> Reading {
    let noise: i64 = rng.gen_range(-50..=50);
    let occupancy: i64 = rng.gen_range(0..=100);
    let mut level = (cfg.base_ppm + noise + occupancy).max(400);
    if rng.gen_bool(cfg.spike_probability.clamp(0.0, 1.0)) {
        level = rng.gen_range(5500..=7000);
    }
    Reading::new(format_ts(ts), cfg.aula.clone(), level)
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Timestamp of the last record in `path` that parses, if any.
///
/// # Errors
/// Returns an error if the file exists but cannot be read.
pub fn last_timestamp(path: impl AsRef<Path>) -> Result<Option<NaiveDateTime>> {
    let path = path.as_ref();
    let f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let mut last = None;
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of {}", i + 1, path.display()))?;
        if let Ok(reading) = RawReading::parse_line(&line).and_then(RawReading::into_reading)
            && let Ok(ts) = reading.timestamp()
        {
            last = Some(ts);
        }
    }
    Ok(last)
}

/// Write `cfg.records` readings to `path`, truncating it first if `overwrite`.
///
/// # Errors
/// Returns an error if the log cannot be read (append mode) or written.
pub fn generate_log_file(
    path: impl AsRef<Path>,
    cfg: &GeneratorConfig,
    overwrite: bool,
) -> Result<GenerateSummary> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
    }

    let resume_from = if overwrite { None } else { last_timestamp(path)? };
    let continued = resume_from.is_some();
    let mut current = match resume_from {
        Some(ts) => {
            info!(path = %path.display(), from = %format_ts(ts), "continuing simulated history");
            ts
        }
        None => {
            let now = Local::now().naive_local();
            let now = now.with_nanosecond(now.nanosecond() / 1000 * 1000).unwrap_or(now);
            let span = cfg.step * i32::try_from(cfg.records).unwrap_or(i32::MAX);
            info!(path = %path.display(), "starting new simulated history");
            now - span
        }
    };

    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!overwrite)
        .truncate(overwrite)
        .open(path)
        .with_context(|| format!("open {} for writing", path.display()))?;
    let mut w = BufWriter::new(file);

    let mut summary = GenerateSummary {
        written: 0,
        continued,
        first_ts: None,
        last_ts: None,
    };
    for i in 0..cfg.records {
        current += cfg.step;
        let reading = generate_reading(&mut rng, current, cfg);
        serde_json::to_writer(&mut w, &reading)
            .with_context(|| format!("serialize record #{i}"))?;
        w.write_all(b"\n")?;
        if summary.first_ts.is_none() {
            summary.first_ts = Some(reading.ts.clone());
        }
        summary.last_ts = Some(reading.ts);
        summary.written += 1;
        if i > 0 && i % 500 == 0 {
            debug!(written = i, total = cfg.records, "generating");
        }
    }
    w.flush().with_context(|| format!("flush {}", path.display()))?;

    info!(path = %path.display(), written = summary.written, "log generated");
    Ok(summary)
}
