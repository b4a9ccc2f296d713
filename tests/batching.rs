//! Batch boundaries and checkpoint progression over in-memory stores.

use airbeam::config::IngestConfig;
use airbeam::io::source::VecLogSource;
use airbeam::runner::{Orchestrator, RunOutcome};
use airbeam::sink::DualSinkWriter;
use airbeam::testing::*;
use anyhow::Result;

fn orchestrator(
    config: &IngestConfig,
    source: VecLogSource,
    checkpoint: &MemoryCheckpointStore,
    rows: &MemoryRowStore,
    archive: &MemoryArchive,
    quarantine: &MemoryQuarantine,
) -> Orchestrator {
    Orchestrator::new(
        config,
        Box::new(source),
        Box::new(checkpoint.clone()),
        Box::new(quarantine.clone()),
        DualSinkWriter::new(Box::new(rows.clone()), Box::new(archive.clone())),
    )
}

#[test]
fn thirty_seven_records_in_batches_of_fifteen() -> Result<()> {
    let checkpoint = MemoryCheckpointStore::new();
    let rows = MemoryRowStore::new();
    let archive = MemoryArchive::new();
    let quarantine = MemoryQuarantine::new();
    let source = VecLogSource::new(to_lines(&sample_readings(37)));

    let summary = orchestrator(
        &IngestConfig::default().with_batch_size(15),
        source,
        &checkpoint,
        &rows,
        &archive,
        &quarantine,
    )
    .run()?;

    assert_eq!(checkpoint.history(), vec![15, 30, 37]);
    assert_checkpoint_monotonic(&checkpoint.history());
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.final_cursor, 37);
    assert_eq!(summary.outcome, RunOutcome::Exhausted);

    let windows: Vec<(usize, usize)> = archive
        .entries()
        .iter()
        .map(|(w, _)| (w.start, w.end))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    assert_eq!(windows, vec![(0, 15), (15, 30), (30, 37)]);
    Ok(())
}

#[test]
fn checkpoint_equals_source_length_after_full_run() -> Result<()> {
    for batch_size in [1, 7, 15, 36, 37, 100] {
        let checkpoint = MemoryCheckpointStore::new();
        orchestrator(
            &IngestConfig::default().with_batch_size(batch_size),
            VecLogSource::new(to_lines(&sample_readings(37))),
            &checkpoint,
            &MemoryRowStore::new(),
            &MemoryArchive::new(),
            &MemoryQuarantine::new(),
        )
        .run()?;
        let history = checkpoint.history();
        assert_eq!(history.last(), Some(&37), "batch_size {batch_size}");
        assert_eq!(history.len(), 37usize.div_ceil(batch_size));
        assert_checkpoint_monotonic(&history);
    }
    Ok(())
}

#[test]
fn empty_source_commits_nothing() -> Result<()> {
    let checkpoint = MemoryCheckpointStore::new();
    let summary = orchestrator(
        &IngestConfig::default(),
        VecLogSource::default(),
        &checkpoint,
        &MemoryRowStore::new(),
        &MemoryArchive::new(),
        &MemoryQuarantine::new(),
    )
    .run()?;
    assert_eq!(summary.batches, 0);
    assert!(checkpoint.history().is_empty());
    Ok(())
}

#[test]
fn later_run_picks_up_appended_records() -> Result<()> {
    let checkpoint = MemoryCheckpointStore::new();
    let rows = MemoryRowStore::new();
    let archive = MemoryArchive::new();
    let quarantine = MemoryQuarantine::new();
    let all = to_lines(&sample_readings(20));

    let first = orchestrator(
        &IngestConfig::default(),
        VecLogSource::new(all[..12].iter().cloned()),
        &checkpoint,
        &rows,
        &archive,
        &quarantine,
    )
    .run()?;
    assert_eq!(first.final_cursor, 12);

    let second = orchestrator(
        &IngestConfig::default(),
        VecLogSource::new(all.iter().cloned()),
        &checkpoint,
        &rows,
        &archive,
        &quarantine,
    )
    .run()?;
    assert_eq!(second.start_cursor, 12);
    assert_eq!(second.consumed, 8);
    assert_eq!(rows.len(), 20);
    assert_eq!(archive.len(), 20);
    Ok(())
}
