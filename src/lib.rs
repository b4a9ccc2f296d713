//! # Airbeam
//!
//! A **resumable micro-batch ingestion engine** for CO2 sensor logs. Airbeam
//! consumes an append-only NDJSON log of readings, processes it in bounded
//! batches, quarantines physically implausible values, and persists valid
//! readings into two complementary stores: an idempotent SQLite row store
//! and a hive-partitioned Parquet archive.
//!
//! ## Key Features
//!
//! - **Checkpointed progress** - the cursor is saved only after a batch is durable, so a
//!   crash replays at most one batch
//! - **Idempotent row store** - `INSERT OR IGNORE` on `(ts, aula)` absorbs replays
//! - **Append-only archive** - Parquet parts partitioned by `year/month/day/hour`
//! - **Failure isolation** - malformed lines are dropped and counted, never fatal
//! - **Quarantine audit trail** - every outlier is appended with a human-readable reason
//! - **Compressed logs** - gzip and zstd sources are read transparently
//! - **Reports** - per-minute means and 5-minute alert windows rendered as Markdown
//!
//! ## Quick Start
//!
//! ```no_run
//! use airbeam::config::IngestConfig;
//! use airbeam::runner::Orchestrator;
//! # use anyhow::Result;
//!
//! # fn main() -> Result<()> {
//! let config = IngestConfig::default().with_batch_size(15);
//! let summary = Orchestrator::from_config(&config)?.run()?;
//! println!("checkpoint now at {}", summary.final_cursor);
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Cursor and checkpoint
//!
//! The cursor is the number of source records already processed. A batch
//! covers `[cursor, min(cursor + batch_size, total))`. The
//! [`CheckpointStore`](checkpoint::CheckpointStore) persists the cursor after
//! the batch's sinks have committed; everything before the cursor is done.
//!
//! ### Delivery
//!
//! Reading is at-least-once: a crash between a sink write and the checkpoint
//! save replays the batch. The row store turns that into exactly-once rows;
//! the archive and the quarantine log are journals and record the replay.
//!
//! ### Classification
//!
//! [`OutlierFilter`](filter::OutlierFilter) keeps readings within the
//! inclusive range `[300, 5000]` ppm by default. A reading without a numeric
//! `co2_ppm` is treated as `0` and always quarantined.
//!
//! ## Feature Flags
//!
//! - `io-parquet` - Parquet archive (requires Arrow); needed by the CLI
//! - `compression-gzip` - read `.gz` logs
//! - `compression-zstd` - read `.zst` logs
//!
//! ## Module Overview
//!
//! - [`reading`] - record types and the parse boundary
//! - [`config`] - paths, bounds and batch parameters
//! - [`checkpoint`] - durable cursor storage
//! - [`batch`] - batch windows and per-line decoding
//! - [`filter`] - outlier classification
//! - [`sink`] - sink traits and the dual-sink writer
//! - [`io`] - file-backed sources and sinks
//! - [`runner`] - the orchestrator loop
//! - [`metrics`] - run counters
//! - [`report`] - Markdown report
//! - [`generator`] - synthetic log producer
//! - [`testing`] - in-memory stores and fixtures

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod filter;
pub mod generator;
pub mod io;
pub mod metrics;
pub mod reading;
pub mod report;
pub mod runner;
pub mod sink;
pub mod testing;

pub use batch::{Batch, BatchReader, BatchWindow, MalformedLine};
pub use checkpoint::{CheckpointStore, FileCheckpointStore};
pub use config::{IngestConfig, OutlierBounds};
pub use filter::{Classified, OutlierFilter};
pub use reading::{ArchiveEntry, NaturalKey, PartitionCoords, QuarantinedReading, Reading};
pub use runner::{BatchReport, IngestState, Orchestrator, RunOutcome, RunSummary};
pub use sink::{ArchiveSink, DualSinkWriter, QuarantineSink, RowSink, WriteOutcome};

#[cfg(feature = "io-parquet")]
pub use io::parquet::PartitionedArchive;
pub use io::quarantine::NdjsonQuarantineSink;
pub use io::source::{LogSource, NdjsonLogSource};
pub use io::sqlite::SqliteRowStore;
