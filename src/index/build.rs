//! Bulk build.
//!
//! Rows fed to a [`BuildHandle`] go into an in-memory [`Arena`] first. When
//! the arena's memory budget runs out it is flushed to pages once and every
//! later row, from any worker, takes the on-disk insert path. With more than
//! one worker, rows are queued on a bounded channel and inserted by a pool
//! of threads sharing the arena.

use super::{HnswIndex, InsertOutcome};
use crate::arena::{Arena, ArenaInsert};
use crate::error::{HnswError, HnswResult};
use crate::storage::PageRef;
use crate::types::RowId;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Summary returned by [`BuildHandle::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    /// Rows accepted by `feed`, skipped ones excluded.
    pub rows_fed: u64,
    pub elements: u64,
    /// Rows that joined an element with an identical vector.
    pub duplicates: u64,
    /// Rows whose vector could not be normalized.
    pub skipped: u64,
    /// Whether the memory budget ran out before `finish`.
    pub flushed_early: bool,
    pub pages: u32,
    pub elapsed: Duration,
}

type Row = (Arc<[f32]>, RowId);

/// State shared by the feeding thread and the workers.
struct BuildShared {
    index: HnswIndex,
    arena: Arena,
    /// Set once the arena has been written out.
    flushed: RwLock<bool>,
    rows_fed: AtomicU64,
    elements: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    flushed_early: AtomicBool,
    /// First worker error; later rows are drained without inserting.
    failure: Mutex<Option<HnswError>>,
}

impl BuildShared {
    fn insert(&self, vector: Arc<[f32]>, row: RowId) -> HnswResult<()> {
        let inner = &self.index.inner;
        {
            let flushed = self.flushed.read();
            if !*flushed {
                match self.arena.insert(Arc::clone(&vector), row, Some(&inner.interrupt))? {
                    ArenaInsert::Inserted(_) => {
                        self.elements.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    ArenaInsert::Duplicate(_) => {
                        self.duplicates.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    ArenaInsert::Full => {}
                }
            }
        }

        {
            let mut flushed = self.flushed.write();
            if !*flushed {
                tracing::warn!(
                    "[build] performance warning: graph no longer fits into maintenance_work_mem after {} elements ({} bytes used of {}); continuing on disk",
                    self.arena.len(),
                    self.arena.memory_used(),
                    self.arena.memory_limit()
                );
                inner.flush_arena(&self.arena)?;
                *flushed = true;
                self.flushed_early.store(true, Ordering::Relaxed);
            }
        }

        let level = inner.levels.generate();
        match inner.insert_vector(vector, row, level)? {
            InsertOutcome::Inserted(_) => self.elements.fetch_add(1, Ordering::Relaxed),
            InsertOutcome::Duplicate(_) => self.duplicates.fetch_add(1, Ordering::Relaxed),
            InsertOutcome::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
        };
        Ok(())
    }

    fn record_failure(&self, err: HnswError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    fn work(&self, rows: Receiver<Row>) {
        while let Ok((vector, row)) = rows.recv() {
            if self.has_failed() {
                continue;
            }
            if let Err(err) = self.insert(vector, row) {
                tracing::error!("[build] worker failed on row {row}: {err}");
                self.record_failure(err);
            }
        }
    }
}

/// An in-progress bulk build. Obtained from [`HnswIndex::begin_build`].
pub struct BuildHandle {
    shared: Arc<BuildShared>,
    sender: Option<Sender<Row>>,
    workers: Vec<JoinHandle<()>>,
    started: Instant,
    finished: bool,
}

impl HnswIndex {
    /// Start a bulk build into this index, which must hold no elements.
    ///
    /// `parallelism` is the number of insert workers; 0 takes
    /// `build.parallel_workers`, 1 inserts on the feeding thread.
    pub fn begin_build(&self, parallelism: usize) -> HnswResult<BuildHandle> {
        let inner = &self.inner;
        let settings = &inner.settings.build;
        let workers = if parallelism == 0 {
            settings.parallel_workers
        } else {
            parallelism
        };

        let metadata = inner.metadata()?;
        let head_is_empty = inner.store.read_page(PageRef::HEAD)?.item_count() == 0;
        if metadata.entry.is_some() || inner.store.page_count() != 2 || !head_is_empty {
            return Err(HnswError::NotEmpty);
        }

        let arena = Arena::new(
            inner.options.dimensions,
            inner.options.m,
            inner.options.ef_construction,
            Arc::clone(&inner.metric),
            settings.maintenance_work_mem,
        );
        let shared = Arc::new(BuildShared {
            index: self.clone(),
            arena,
            flushed: RwLock::new(false),
            rows_fed: AtomicU64::new(0),
            elements: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            flushed_early: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let mut handle = BuildHandle {
            shared,
            sender: None,
            workers: Vec::new(),
            started: Instant::now(),
            finished: false,
        };

        if workers > 1 {
            let (sender, receiver) = crossbeam_channel::bounded(settings.queue_depth);
            for i in 0..workers {
                let shared = Arc::clone(&handle.shared);
                let rows = receiver.clone();
                let worker = std::thread::Builder::new()
                    .name(format!("navigraph-build-{i}"))
                    .spawn(move || shared.work(rows))
                    .map_err(|err| HnswError::WorkerFailed {
                        reason: format!("cannot spawn build worker: {err}"),
                    })?;
                handle.workers.push(worker);
            }
            handle.sender = Some(sender);
        }

        tracing::info!(
            "[build] started: {workers} workers, memory budget {} bytes",
            settings.maintenance_work_mem
        );
        Ok(handle)
    }
}

impl BuildHandle {
    /// Add one row. Dimension errors are returned here; insert errors from
    /// workers surface on a later call or from [`finish`](Self::finish).
    pub fn feed(&self, vector: &[f32], row: RowId) -> HnswResult<()> {
        if self.finished {
            return Err(HnswError::BuildFinished);
        }
        if let Some(err) = &*self.shared.failure.lock() {
            return Err(HnswError::WorkerFailed {
                reason: err.to_string(),
            });
        }

        let inner = &self.shared.index.inner;
        inner.interrupt.check()?;
        let Some(vector) = inner.prepare(vector)? else {
            tracing::debug!("[build] row {row} skipped: vector cannot be normalized");
            self.shared.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        self.shared.rows_fed.fetch_add(1, Ordering::Relaxed);

        match &self.sender {
            Some(sender) => sender.send((vector, row)).map_err(|_| HnswError::WorkerFailed {
                reason: "all build workers exited".to_string(),
            }),
            None => self.shared.insert(vector, row),
        }
    }

    /// Rows accepted so far.
    pub fn rows_fed(&self) -> u64 {
        self.shared.rows_fed.load(Ordering::Relaxed)
    }

    /// Wait for the workers, write out whatever is still in memory and
    /// sync the store.
    pub fn finish(&mut self) -> HnswResult<BuildStats> {
        if self.finished {
            return Err(HnswError::BuildFinished);
        }
        self.finished = true;
        self.join_workers()?;

        if let Some(err) = self.shared.failure.lock().take() {
            return Err(err);
        }

        let shared = &self.shared;
        let inner = &shared.index.inner;
        {
            let mut flushed = shared.flushed.write();
            if !*flushed {
                inner.flush_arena(&shared.arena)?;
                *flushed = true;
            }
        }
        inner.store.sync()?;

        let stats = BuildStats {
            rows_fed: shared.rows_fed.load(Ordering::Relaxed),
            elements: shared.elements.load(Ordering::Relaxed),
            duplicates: shared.duplicates.load(Ordering::Relaxed),
            skipped: shared.skipped.load(Ordering::Relaxed),
            flushed_early: shared.flushed_early.load(Ordering::Relaxed),
            pages: inner.store.page_count(),
            elapsed: self.started.elapsed(),
        };
        tracing::info!(
            "[build] finished: {} rows, {} elements, {} duplicates, {} skipped, {} pages in {:.2?}",
            stats.rows_fed,
            stats.elements,
            stats.duplicates,
            stats.skipped,
            stats.pages,
            stats.elapsed
        );
        Ok(stats)
    }

    /// Close the queue and wait for every worker to drain it.
    fn join_workers(&mut self) -> HnswResult<()> {
        drop(self.sender.take());
        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            tracing::error!("[build] {panicked} workers panicked");
            return Err(HnswError::WorkerFailed {
                reason: format!("{panicked} build workers panicked"),
            });
        }
        Ok(())
    }
}

impl Drop for BuildHandle {
    fn drop(&mut self) {
        if self.join_workers().is_err() {
            tracing::warn!("[build] build dropped after a worker panic");
        }
    }
}

impl std::fmt::Debug for BuildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHandle")
            .field("workers", &self.workers.len())
            .field("rows_fed", &self.rows_fed())
            .field("arena", &self.shared.arena)
            .field("finished", &self.finished)
            .finish()
    }
}
