//! Paged persistence for the graph.
//!
//! The graph is stored as a chain of fixed-size slotted pages. Page 0 holds
//! the [`Metadata`]; element pages follow, each carrying element tuples and
//! (when they fit) their paired neighbor tuples.
//!
//! # Architecture
//!
//! - [`page`]: slotted page image and codec
//! - [`tuple`]: element and neighbor tuple codec
//! - [`meta`]: metapage codec
//! - [`store`]: [`PageStore`] frames, page locks and atomic commit
//! - [`file`]: durable [`FileBackend`] with a redo journal

pub mod file;
pub mod meta;
pub mod page;
pub mod store;
pub mod tuple;

pub use file::FileBackend;
pub use meta::{EntryPoint, Metadata};
pub use page::{MAX_ITEM_SIZE, PAGE_SIZE, Page, PageRef};
pub use store::{MemoryBackend, PageBackend, PageRead, PageStore, PageWrite};
pub use tuple::{
    ElementHeader, ElementTuple, ItemPointer, NeighborTuple, TupleKind, element_tuple_size,
    neighbor_tuple_size,
};
