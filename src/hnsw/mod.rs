//! Graph model and the algorithms shared by every graph representation.
//!
//! The construction, search and repair algorithms are written once against
//! [`GraphAccess`], which both the in-memory build arena and the paged
//! on-disk graph implement. An algorithm only ever sees element references
//! (`ArenaRef` or `ItemPointer`) and snapshot copies of neighbor lists; it
//! never holds a lock across a distance computation.
//!
//! # Architecture
//!
//! - [`candidate`]: distance-keyed candidates and heap orderings
//! - [`search`]: best-first layer search
//! - [`select`]: diversity-pruning neighbor selection
//! - [`neighbors`]: neighbor arrays, back-edge updates, element attachment
//! - [`level`]: random level assignment

pub mod candidate;
pub mod level;
pub mod neighbors;
pub mod search;
pub mod select;

pub use candidate::Candidate;
pub use level::{LevelGenerator, max_level};
pub use neighbors::{
    ConnectionUpdate, Neighbor, NeighborArray, find_element_neighbors, update_connection,
};
pub use search::{SearchContext, search_layer};
pub use select::{Selection, select_neighbors};

use crate::error::HnswResult;
use crate::metric::VectorMetric;
use std::fmt::Debug;
use std::hash::Hash;

/// Neighbor capacity of layer `layer` for degree bound `m`.
#[inline]
pub const fn layer_capacity(layer: u8, m: usize) -> usize {
    if layer == 0 { 2 * m } else { m }
}

/// Level normalization factor `1 / ln(m)`.
pub fn ml(m: usize) -> f64 {
    1.0 / (m as f64).ln()
}

/// A loaded graph element.
pub trait GraphNode: Clone + Send {
    type Ref: Copy + Eq + Hash + Ord + Debug + Send + Sync;

    /// Stable address of this element.
    fn pointer(&self) -> Self::Ref;

    fn level(&self) -> u8;

    fn vector(&self) -> &[f32];

    /// Whether the element still maps to at least one row.
    fn is_live(&self) -> bool;
}

/// Read access to a graph, as seen by the shared algorithms.
pub trait GraphAccess: Sync {
    type Node: GraphNode;

    /// Base degree bound.
    fn m(&self) -> usize;

    fn metric(&self) -> &dyn VectorMetric;

    /// Load an element. `None` means the slot was reclaimed or reused and
    /// must not be traversed.
    fn load(&self, element: NodeRef<Self>) -> HnswResult<Option<Self::Node>>;

    /// Snapshot of the neighbor references of `node` at `layer`.
    fn neighbors(&self, node: &Self::Node, layer: u8) -> HnswResult<Vec<NodeRef<Self>>>;
}

/// Reference type of a graph's elements.
pub type NodeRef<G> = <<G as GraphAccess>::Node as GraphNode>::Ref;
