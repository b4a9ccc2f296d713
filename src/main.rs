//! `airbeam` command-line interface.
//!
//! Usage:
//!   airbeam generate --records 4500          # append synthetic readings to Data/lecturas.log
//!   airbeam ingest --batch-size 15           # consume the log from the stored checkpoint
//!   airbeam report                           # write output/co2_reporte.md
//!   airbeam run                              # setup, generate, ingest to completion, report
//!
//! Every path is relative to `--root` (default: the current directory).
//! Set `RUST_LOG=debug` for per-batch sink detail.
//!
//! Ctrl-C during ingestion finishes the current batch and exits cleanly; a
//! second Ctrl-C exits at once.

use airbeam::checkpoint::FileCheckpointStore;
use airbeam::config::{DEFAULT_BATCH_SIZE, DEFAULT_LOWER_BOUND, DEFAULT_UPPER_BOUND, IngestConfig, OutlierBounds};
use airbeam::generator::{GeneratorConfig, generate_log_file};
use airbeam::report::ReportGenerator;
use airbeam::runner::{Orchestrator, RunOutcome, RunSummary};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::{create_dir_all, remove_dir_all};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "airbeam")]
#[command(about = "Resumable micro-batch ingestion of CO2 sensor logs")]
struct Cli {
    /// Directory holding `Data/` and `output/`
    #[arg(long, env = "AIRBEAM_ROOT", default_value = ".", global = true)]
    root: PathBuf,

    /// Source log, overriding `<root>/Data/lecturas.log`
    #[arg(long, env = "AIRBEAM_LOG", global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume the log from the stored checkpoint
    Ingest(IngestArgs),

    /// Write the Markdown report from the row store
    Report,

    /// Append synthetic readings to the log
    Generate(GenerateArgs),

    /// Setup, generate, ingest to completion, then report
    Run {
        #[command(flatten)]
        ingest: IngestArgs,

        #[command(flatten)]
        generate: GenerateArgs,

        /// Ingest the existing log without generating new readings
        #[arg(long)]
        skip_generate: bool,

        /// Delete the Parquet archive before ingesting
        #[arg(long)]
        reset_archive: bool,
    },
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Source records per batch
    #[arg(long, env = "AIRBEAM_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Lowest valid reading (inclusive)
    #[arg(long, env = "AIRBEAM_LOWER_BOUND", default_value_t = DEFAULT_LOWER_BOUND)]
    lower_bound: i64,

    /// Highest valid reading (inclusive)
    #[arg(long, env = "AIRBEAM_UPPER_BOUND", default_value_t = DEFAULT_UPPER_BOUND)]
    upper_bound: i64,

    /// Stop after this many batches
    #[arg(long, env = "AIRBEAM_MAX_BATCHES")]
    max_batches: Option<usize>,

    /// Seconds to wait between batches; follows a growing log when set
    #[arg(long, env = "AIRBEAM_INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Write run metrics as JSON to this file
    #[arg(long)]
    metrics_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Readings to generate
    #[arg(long, default_value_t = 4500)]
    records: usize,

    /// Truncate the log instead of continuing it
    #[arg(long)]
    overwrite: bool,

    /// RNG seed for a reproducible log
    #[arg(long)]
    seed: Option<u64>,
}

impl IngestArgs {
    fn apply(&self, mut config: IngestConfig) -> IngestConfig {
        config = config
            .with_batch_size(self.batch_size)
            .with_bounds(OutlierBounds::new(self.lower_bound, self.upper_bound));
        if let Some(n) = self.max_batches {
            config = config.with_max_batches(n);
        }
        if let Some(secs) = self.interval_secs {
            config = config.with_interval(Duration::from_secs(secs));
        }
        config
    }
}

impl GenerateArgs {
    fn to_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            records: self.records,
            seed: self.seed,
            ..GeneratorConfig::default()
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::rooted_at(&cli.root);
    if let Some(log) = cli.log {
        config = config.with_log_path(log);
    }

    match cli.command {
        Command::Ingest(args) => {
            let config = args.apply(config);
            ingest(&config, args.metrics_out.as_ref())?;
        }
        Command::Report => report(&config)?,
        Command::Generate(args) => {
            generate_log_file(&config.log_path, &args.to_config(), args.overwrite)?;
        }
        Command::Run {
            ingest: ingest_args,
            generate,
            skip_generate,
            reset_archive,
        } => {
            let config = ingest_args.apply(config);
            setup(&config, reset_archive)?;
            if !skip_generate {
                generate_log_file(&config.log_path, &generate.to_config(), generate.overwrite)?;
            }
            let summary = ingest(&config, ingest_args.metrics_out.as_ref())?;
            if summary.outcome == RunOutcome::Stopped {
                info!(checkpoint = summary.final_cursor, "interrupted; skipping report");
                return Ok(());
            }
            report(&config)?;
            info!("pipeline complete");
        }
    }
    Ok(())
}

fn setup(config: &IngestConfig, reset_archive: bool) -> Result<()> {
    if reset_archive && config.archive_dir.exists() {
        warn!(path = %config.archive_dir.display(), "removing archive");
        remove_dir_all(&config.archive_dir)
            .with_context(|| format!("remove {}", config.archive_dir.display()))?;
    }
    for dir in config.output_dirs() {
        create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
    }
    Ok(())
}

/// Raise `stop` on the first Ctrl-C; exit with status 130 on the second.
fn install_interrupt_handler(stop: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    std::thread::Builder::new()
        .name("airbeam-signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("cannot listen for Ctrl-C; interrupts will kill the process");
                    return;
                }
                info!("Received Ctrl+C, stopping after the current batch");
                stop.store(true, Ordering::SeqCst);
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("second Ctrl+C, exiting now");
                    std::process::exit(130);
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

fn ingest(config: &IngestConfig, metrics_out: Option<&PathBuf>) -> Result<RunSummary> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut orchestrator = Orchestrator::from_config(config)?.with_stop_flag(stop.clone());
    install_interrupt_handler(stop)?;
    let summary = orchestrator.run()?;
    orchestrator.metrics().print();
    if let Some(path) = metrics_out {
        orchestrator.metrics().save_to_file(path)?;
        info!(path = %path.display(), "metrics saved");
    }
    Ok(summary)
}

fn report(config: &IngestConfig) -> Result<()> {
    if let Some(path) = ReportGenerator::default().generate(config)? {
        println!("Report written to {}", path.display());
    }
    if let Some(cp) = FileCheckpointStore::new(&config.checkpoint_path).read_raw()? {
        println!("Checkpoint: {cp}");
    }
    Ok(())
}
