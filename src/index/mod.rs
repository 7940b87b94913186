//! The paged HNSW index.
//!
//! [`HnswIndex`] ties the shared graph algorithms to a [`PageStore`]. It is
//! a cheap, cloneable handle: every clone sees the same pages, locks and
//! counters, so one handle can feed a build while others scan.
//!
//! # Architecture
//!
//! - [`locks`]: update, wait and scan locks
//! - [`paged`]: graph access over pages, metapage helpers
//! - [`insert`]: single-element insertion, page packing, back-edges
//! - [`build`]: bulk build through the in-memory arena
//! - [`flush`]: arena to pages
//! - [`scan`]: the scan protocol and iterative re-querying
//! - [`vacuum`]: row removal, graph repair, slot reclamation
//! - [`verify`]: structural checks

mod build;
mod flush;
mod insert;
mod locks;
mod paged;
mod scan;
mod vacuum;
mod verify;

pub use build::{BuildHandle, BuildStats};
pub use paged::PagedElement;
pub use scan::{IndexScan, SearchHit};
pub use vacuum::VacuumStats;
pub use verify::GraphReport;

use crate::config::Settings;
use crate::error::{HnswError, HnswResult};
use crate::hnsw::LevelGenerator;
use crate::metric::{MetricKind, VectorMetric};
use crate::recall::{RecallStats, RecallTracker};
use crate::storage::tuple::max_dimensions;
use crate::storage::{EntryPoint, FileBackend, ItemPointer, Metadata, PageRef, PageStore};
use crate::types::{Interrupt, RowId};
use locks::IndexLocks;
use paged::{PagedGraph, read_metadata, write_metadata};
use std::path::Path;
use std::sync::Arc;

/// Shape of a new index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    pub dimensions: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub metric: MetricKind,
}

impl IndexOptions {
    /// Options with the default graph shape.
    pub fn new(dimensions: usize) -> Self {
        Self::from_settings(dimensions, &Settings::default())
    }

    /// Options taking the graph shape from `[index]`.
    pub fn from_settings(dimensions: usize, settings: &Settings) -> Self {
        Self {
            dimensions,
            m: settings.index.m,
            ef_construction: settings.index.ef_construction,
            metric: settings.index.metric,
        }
    }

    #[must_use]
    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    #[must_use]
    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    #[must_use]
    pub fn with_metric(mut self, metric: MetricKind) -> Self {
        self.metric = metric;
        self
    }

    /// Reject shapes the index cannot represent.
    pub fn validate(&self, max_dims: usize) -> HnswResult<()> {
        if self.dimensions == 0 {
            return Err(HnswError::EmptyVector);
        }
        let max = max_dims.min(max_dimensions());
        if self.dimensions > max {
            return Err(HnswError::DimensionsTooLarge {
                dimensions: self.dimensions,
                max,
            });
        }
        if !(2..=100).contains(&self.m) {
            return Err(HnswError::InvalidOption {
                option: "m",
                reason: format!("{} is outside 2..=100", self.m),
            });
        }
        if !(4..=1000).contains(&self.ef_construction) {
            return Err(HnswError::InvalidOption {
                option: "ef_construction",
                reason: format!("{} is outside 4..=1000", self.ef_construction),
            });
        }
        if self.ef_construction < 2 * self.m {
            return Err(HnswError::InvalidOption {
                option: "ef_construction",
                reason: format!(
                    "{} must be at least 2 * m ({})",
                    self.ef_construction,
                    2 * self.m
                ),
            });
        }
        Ok(())
    }
}

/// Result of [`HnswIndex::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new element was written.
    Inserted(ItemPointer),
    /// The row joined an element holding a bit-identical vector.
    Duplicate(ItemPointer),
    /// The vector could not be normalized and was not indexed.
    Skipped,
}

/// Snapshot of the metapage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub dimensions: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub metric: MetricKind,
    pub entry: Option<EntryPoint>,
    pub insert_page: PageRef,
    pub pages: u32,
}

pub(crate) struct IndexInner {
    pub(crate) store: PageStore,
    pub(crate) options: IndexOptions,
    pub(crate) metric: Arc<dyn VectorMetric>,
    pub(crate) locks: IndexLocks,
    pub(crate) levels: LevelGenerator,
    pub(crate) interrupt: Interrupt,
    pub(crate) recall: RecallTracker,
    pub(crate) settings: Settings,
}

impl IndexInner {
    pub(crate) fn graph(&self) -> PagedGraph<'_> {
        PagedGraph::new(&self.store, self.options.m, &*self.metric)
    }

    pub(crate) fn metadata(&self) -> HnswResult<Metadata> {
        read_metadata(&self.store)
    }

    /// Check the dimension and normalize. `None` means the vector cannot be
    /// indexed under this metric.
    pub(crate) fn prepare(&self, vector: &[f32]) -> HnswResult<Option<Arc<[f32]>>> {
        if vector.is_empty() {
            return Err(HnswError::EmptyVector);
        }
        if vector.len() != self.options.dimensions {
            return Err(HnswError::DimensionMismatch {
                expected: self.options.dimensions,
                actual: vector.len(),
            });
        }
        Ok(self.metric.normalize(vector.to_vec()).map(Arc::from))
    }
}

/// Handle to one paged HNSW index.
#[derive(Clone)]
pub struct HnswIndex {
    pub(crate) inner: Arc<IndexInner>,
}

impl HnswIndex {
    /// Initialize an index in an empty store.
    pub fn create(
        store: PageStore,
        options: IndexOptions,
        settings: &Settings,
    ) -> HnswResult<Self> {
        settings.validate()?;
        options.validate(settings.index.max_dimensions)?;
        if !store.is_empty() {
            return Err(HnswError::NotEmpty);
        }

        let meta_page = store.allocate_page();
        let head = store.allocate_page();
        debug_assert_eq!((meta_page, head), (PageRef::METADATA, PageRef::HEAD));

        let metadata = Metadata::new(
            options.dimensions as u32,
            options.m as u16,
            options.ef_construction as u16,
            options.metric,
        );
        {
            let mut meta = store.write_page(PageRef::METADATA)?;
            let head_page = store.write_page(PageRef::HEAD)?;
            meta.add_item(PageRef::METADATA, metadata.encode())?;
            store.commit(&[&meta, &head_page])?;
        }

        tracing::info!(
            "[index] created index: {} dimensions, m={}, ef_construction={}, metric={}",
            options.dimensions,
            options.m,
            options.ef_construction,
            options.metric
        );

        Ok(Self::from_parts(store, options, settings))
    }

    /// Open an existing index, validating its metapage against `settings`.
    pub fn open(store: PageStore, settings: &Settings) -> HnswResult<Self> {
        settings.validate()?;
        if store.page_count() < 2 {
            tracing::error!("[index] store holds {} pages, no index", store.page_count());
            return Err(HnswError::Corrupted {
                reason: format!(
                    "store holds {} pages, expected a metapage and a head page",
                    store.page_count()
                ),
            });
        }
        let metadata = read_metadata(&store)?;
        if metadata.metric != settings.index.metric {
            return Err(HnswError::MetricMismatch {
                stored: metadata.metric.to_string(),
                requested: settings.index.metric.to_string(),
            });
        }

        let options = IndexOptions {
            dimensions: metadata.dimensions as usize,
            m: metadata.m as usize,
            ef_construction: metadata.ef_construction as usize,
            metric: metadata.metric,
        };
        options.validate(max_dimensions())?;

        tracing::debug!(
            "[index] opened index: {} pages, entry point {:?}",
            store.page_count(),
            metadata.entry
        );

        Ok(Self::from_parts(store, options, settings))
    }

    /// Index kept entirely in memory.
    pub fn in_memory(options: IndexOptions, settings: &Settings) -> HnswResult<Self> {
        Self::create(PageStore::in_memory(), options, settings)
    }

    /// Create an index in a new page file.
    pub fn create_file(
        path: impl AsRef<Path>,
        options: IndexOptions,
        settings: &Settings,
    ) -> HnswResult<Self> {
        let backend = FileBackend::open(path.as_ref(), settings.storage.synchronous)?;
        Self::create(PageStore::open(backend)?, options, settings)
    }

    /// Open an index stored in a page file.
    pub fn open_file(path: impl AsRef<Path>, settings: &Settings) -> HnswResult<Self> {
        let backend = FileBackend::open(path.as_ref(), settings.storage.synchronous)?;
        Self::open(PageStore::open(backend)?, settings)
    }

    fn from_parts(store: PageStore, options: IndexOptions, settings: &Settings) -> Self {
        Self {
            inner: Arc::new(IndexInner {
                store,
                options,
                metric: options.metric.metric(),
                locks: IndexLocks::default(),
                levels: LevelGenerator::new(options.m),
                interrupt: Interrupt::new(),
                recall: RecallTracker::new(settings.recall.clone()),
                settings: settings.clone(),
            }),
        }
    }

    /// Insert one row.
    pub fn insert(&self, vector: &[f32], row: RowId) -> HnswResult<InsertOutcome> {
        let Some(vector) = self.inner.prepare(vector)? else {
            tracing::debug!("[index] row {row} skipped: vector cannot be normalized");
            return Ok(InsertOutcome::Skipped);
        };
        let level = self.inner.levels.generate();
        self.inner.insert_vector(vector, row, level)
    }

    /// Nearest rows to `query`, at most `k`.
    pub fn search(&self, query: &[f32], k: usize) -> HnswResult<Vec<SearchHit>> {
        let ef = self.inner.settings.search.ef_search.max(k);
        let mut scan = self.begin_scan(ef);
        scan.rescan(query)?;

        let mut hits = Vec::with_capacity(k);
        while hits.len() < k {
            match scan.next_hit()? {
                Some(hit) => hits.push(hit),
                None => break,
            }
        }
        scan.end()?;
        Ok(hits)
    }

    pub fn options(&self) -> IndexOptions {
        self.inner.options
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn metric(&self) -> &dyn VectorMetric {
        &*self.inner.metric
    }

    /// Cancellation flag observed by traversals, builds and vacuum.
    pub fn interrupt(&self) -> Interrupt {
        self.inner.interrupt.clone()
    }

    pub fn recall_stats(&self) -> RecallStats {
        self.inner.recall.stats()
    }

    pub fn stats(&self) -> HnswResult<IndexStats> {
        let metadata = self.inner.metadata()?;
        Ok(IndexStats {
            dimensions: metadata.dimensions as usize,
            m: metadata.m as usize,
            ef_construction: metadata.ef_construction as usize,
            metric: metadata.metric,
            entry: metadata.entry,
            insert_page: metadata.insert_page,
            pages: self.inner.store.page_count(),
        })
    }

    /// Flush the backend to durable storage.
    pub fn sync(&self) -> HnswResult<()> {
        Ok(self.inner.store.sync()?)
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("options", &self.inner.options)
            .field("store", &self.inner.store)
            .finish()
    }
}
