//! Paged HNSW approximate nearest-neighbor index.
//!
//! Vectors are stored on fixed-size pages behind a [`storage::PageStore`]
//! and linked into a multi-layer navigable small-world graph. The index
//! supports concurrent single-row inserts, a parallel bulk build through an
//! in-memory arena, iterative scans, and vacuum with graph repair.
//!
//! ```no_run
//! use navigraph::{HnswIndex, IndexOptions, RowId, Settings};
//!
//! # fn main() -> navigraph::HnswResult<()> {
//! let settings = Settings::default();
//! let index = HnswIndex::create_file("vectors.pages", IndexOptions::new(3), &settings)?;
//! index.insert(&[0.1, 0.2, 0.3], RowId::new_unchecked(1))?;
//! let hits = index.search(&[0.1, 0.2, 0.25], 10)?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod hnsw;
pub mod index;
pub mod logging;
pub mod metric;
pub mod recall;
pub mod storage;
pub mod types;

// Explicit exports for better API clarity
pub use config::{IterativeScan, Settings};
pub use error::{HnswError, HnswResult, StorageError, StorageResult};
pub use index::{
    BuildHandle, BuildStats, GraphReport, HnswIndex, IndexOptions, IndexScan, IndexStats,
    InsertOutcome, SearchHit, VacuumStats,
};
pub use metric::{MetricKind, VectorMetric};
pub use recall::{RecallStats, RecallTracker};
pub use storage::{FileBackend, ItemPointer, MemoryBackend, PageBackend, PageStore};
pub use types::{ElementState, HeapRefs, Interrupt, RowId};
