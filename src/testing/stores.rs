//! In-memory stores and fault-injecting sinks.
//!
//! Every store here is a cheap handle over shared state: clone it, hand one
//! clone to the orchestrator, and inspect the other after the run.

use crate::batch::BatchWindow;
use crate::checkpoint::CheckpointStore;
use crate::reading::{ArchiveEntry, NaturalKey, QuarantinedReading, Reading};
use crate::sink::{ArchiveSink, QuarantineSink, RowSink};
use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Checkpoint held in memory, with the history of every save.
#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<Vec<usize>>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start as if `index` had already been committed.
    #[must_use]
    pub fn starting_at(index: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![index])),
        }
    }

    /// Every value ever saved, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<usize> {
        lock(&self.inner).clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> usize {
        lock(&self.inner).last().copied().unwrap_or(0)
    }

    fn save(&mut self, index: usize) -> Result<()> {
        lock(&self.inner).push(index);
        Ok(())
    }
}

/// Row store keyed on `(ts, aula)` with insert-if-absent semantics.
#[derive(Clone, Debug, Default)]
pub struct MemoryRowStore {
    rows: Arc<Mutex<BTreeMap<NaturalKey, Reading>>>,
}

impl MemoryRowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored readings ordered by natural key.
    #[must_use]
    pub fn readings(&self) -> Vec<Reading> {
        lock(&self.rows).values().cloned().collect()
    }
}

impl RowSink for MemoryRowStore {
    fn insert_new(&mut self, readings: &[Reading]) -> Result<usize> {
        let mut rows = lock(&self.rows);
        let mut inserted = 0;
        for r in readings {
            if !rows.contains_key(&r.natural_key()) {
                rows.insert(r.natural_key(), r.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// Append-only archive that remembers which window each entry came from.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    entries: Arc<Mutex<Vec<(BatchWindow, ArchiveEntry)>>>,
}

impl MemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(BatchWindow, ArchiveEntry)> {
        lock(&self.entries).clone()
    }
}

impl ArchiveSink for MemoryArchive {
    fn append(&mut self, window: BatchWindow, readings: &[Reading]) -> Result<usize> {
        let mut staged = Vec::with_capacity(readings.len());
        for r in readings {
            staged.push((window, ArchiveEntry::from_reading(r.clone())?));
        }
        let n = staged.len();
        lock(&self.entries).extend(staged);
        Ok(n)
    }
}

/// Quarantine log held in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryQuarantine {
    records: Arc<Mutex<Vec<QuarantinedReading>>>,
}

impl MemoryQuarantine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn records(&self) -> Vec<QuarantinedReading> {
        lock(&self.records).clone()
    }
}

impl QuarantineSink for MemoryQuarantine {
    fn append(&mut self, records: &[QuarantinedReading]) -> Result<usize> {
        lock(&self.records).extend_from_slice(records);
        Ok(records.len())
    }
}

/// Decides which calls of a failing sink fail.
#[derive(Clone, Debug)]
struct FailurePlan {
    /// 1-based call number to fail on; `None` fails every call.
    fail_on: Option<usize>,
    calls: Arc<Mutex<usize>>,
}

impl FailurePlan {
    fn should_fail(&self) -> bool {
        let mut calls = lock(&self.calls);
        *calls += 1;
        self.fail_on.is_none_or(|n| n == *calls)
    }
}

/// Archive that fails on a chosen call and otherwise delegates to a [`MemoryArchive`].
#[derive(Clone, Debug)]
pub struct FailingArchive {
    inner: MemoryArchive,
    plan: FailurePlan,
}

impl FailingArchive {
    /// Fail every call.
    #[must_use]
    pub fn always() -> Self {
        Self::new(MemoryArchive::new(), None)
    }

    /// Fail only the `n`-th call (1-based), storing into `inner` otherwise.
    #[must_use]
    pub fn on_call(n: usize, inner: MemoryArchive) -> Self {
        Self::new(inner, Some(n))
    }

    fn new(inner: MemoryArchive, fail_on: Option<usize>) -> Self {
        Self {
            inner,
            plan: FailurePlan {
                fail_on,
                calls: Arc::default(),
            },
        }
    }
}

impl ArchiveSink for FailingArchive {
    fn append(&mut self, window: BatchWindow, readings: &[Reading]) -> Result<usize> {
        if self.plan.should_fail() {
            bail!("injected archive failure");
        }
        self.inner.append(window, readings)
    }
}

/// Row sink that fails on a chosen call and otherwise delegates to a [`MemoryRowStore`].
#[derive(Clone, Debug)]
pub struct FailingRowSink {
    inner: MemoryRowStore,
    plan: FailurePlan,
}

impl FailingRowSink {
    /// Fail only the `n`-th call (1-based), storing into `inner` otherwise.
    #[must_use]
    pub fn on_call(n: usize, inner: MemoryRowStore) -> Self {
        Self {
            inner,
            plan: FailurePlan {
                fail_on: Some(n),
                calls: Arc::default(),
            },
        }
    }
}

impl RowSink for FailingRowSink {
    fn insert_new(&mut self, readings: &[Reading]) -> Result<usize> {
        if self.plan.should_fail() {
            bail!("injected row store failure");
        }
        self.inner.insert_new(readings)
    }
}

/// Quarantine sink whose every append fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingQuarantine;

impl QuarantineSink for FailingQuarantine {
    fn append(&mut self, _records: &[QuarantinedReading]) -> Result<usize> {
        bail!("injected quarantine failure")
    }
}
