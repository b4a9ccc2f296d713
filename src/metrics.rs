//! Run metrics for the ingestion loop.
//!
//! [`MetricsCollector`] is a cheap, cloneable handle over shared counters. The
//! orchestrator bumps the built-in counters in [`names`] after every committed
//! batch; callers may register their own [`Metric`]s alongside them and print
//! or save everything once the run ends.
//!
//! ```
//! use airbeam::metrics::{names, MetricsCollector};
//!
//! let metrics = MetricsCollector::new();
//! metrics.record_start();
//! metrics.increment_counter(names::BATCHES, 1);
//! metrics.increment_counter(names::RECORDS_CONSUMED, 15);
//! metrics.record_end();
//!
//! assert_eq!(metrics.counter(names::RECORDS_CONSUMED), 15);
//! assert_eq!(metrics.to_json()["batches"]["value"], 1);
//! ```

use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Names of the counters maintained by the orchestrator.
pub mod names {
    pub const BATCHES: &str = "batches";
    pub const RECORDS_CONSUMED: &str = "records_consumed";
    pub const RECORDS_MALFORMED: &str = "records_malformed";
    pub const READINGS_VALID: &str = "readings_valid";
    pub const READINGS_QUARANTINED: &str = "readings_quarantined";
    pub const ROWS_INSERTED: &str = "rows_inserted";
    pub const ARCHIVE_ENTRIES: &str = "archive_entries";
    pub const CHECKPOINT: &str = "checkpoint";
    /// Gauge registered when a run ends.
    pub const QUARANTINE_RATIO: &str = "quarantine_ratio";
}

/// A named value reported with the run's metrics.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;

    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }
}

/// Thread-safe container for run metrics.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsCollectorInner>>,
}

#[derive(Default)]
struct MetricsCollectorInner {
    counters: BTreeMap<String, u64>,
    custom: BTreeMap<String, Box<dyn Metric>>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollectorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a custom metric, replacing any metric with the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().custom.insert(metric.name().to_string(), metric);
    }

    pub fn record_start(&self) {
        self.lock().start_time = Some(Instant::now());
    }

    pub fn record_end(&self) {
        self.lock().end_time = Some(Instant::now());
    }

    /// Elapsed time between [`record_start`](Self::record_start) and
    /// [`record_end`](Self::record_end), if both were called.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.start_time, inner.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            _ => None,
        }
    }

    /// Add `value` to a counter, creating it at zero if needed.
    pub fn increment_counter(&self, name: &str, value: u64) {
        *self.lock().counters.entry(name.to_string()).or_default() += value;
    }

    pub fn set_counter(&self, name: &str, value: u64) {
        self.lock().counters.insert(name.to_string(), value);
    }

    /// Current counter value; unknown counters read as zero.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Every metric as `{ name: { "value": .., "description"?: .. } }`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut out = serde_json::Map::new();
        for (name, count) in &inner.counters {
            out.insert(name.clone(), json!({ "value": count }));
        }
        for (name, metric) in &inner.custom {
            let mut obj = serde_json::Map::new();
            obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                obj.insert("description".to_string(), json!(desc));
            }
            out.insert(name.clone(), Value::Object(obj));
        }
        if let (Some(start), Some(end)) = (inner.start_time, inner.end_time) {
            out.insert(
                "execution_time_ms".to_string(),
                json!({
                    "value": end.duration_since(start).as_millis(),
                    "description": "Wall-clock duration of the ingestion run in milliseconds",
                }),
            );
        }
        Value::Object(out)
    }

    /// Print every metric to stdout.
    pub fn print(&self) {
        println!("\n========== Ingestion Metrics ==========");
        if let Some(elapsed) = self.elapsed() {
            println!(
                "Execution Time: {:.3}s ({} ms)",
                elapsed.as_secs_f64(),
                elapsed.as_millis()
            );
            println!("---------------------------------------");
        }
        let inner = self.lock();
        for (name, count) in &inner.counters {
            println!("{name}: {count}");
        }
        for (name, metric) in &inner.custom {
            match metric.description() {
                Some(desc) => println!("{name}: {} ({desc})", metric.value()),
                None => println!("{name}: {}", metric.value()),
            }
        }
        drop(inner);
        println!("=======================================\n");
    }

    /// Write [`to_json`](Self::to_json) to `path`, pretty-printed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        file.write_all(formatted.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

/// A metric holding a single numeric value.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}
