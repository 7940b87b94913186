//! In-memory graph used during bulk builds.
//!
//! Elements live in an append-only table addressed by [`ArenaRef`], an
//! opaque `u32` index, so references stay valid no matter which worker
//! thread resolves them. Neighbor lists are published as `ArcSwap`
//! snapshots: readers load a snapshot without locking and writers replace
//! it copy-on-write while holding the element's [`LockTable`] stripe.
//!
//! Memory is bounded by a fixed budget. An allocation that would exceed it
//! reports [`ArenaInsert::Full`] and the builder switches to on-disk
//! inserts.

mod insert;
mod lock_table;

pub use insert::ArenaInsert;
pub use lock_table::LockTable;

use crate::error::HnswResult;
use crate::hnsw::{GraphAccess, GraphNode, LevelGenerator, Neighbor, NeighborArray, layer_capacity};
use crate::metric::VectorMetric;
use crate::types::HeapRefs;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Fixed bookkeeping bytes charged per element on top of its data.
const NODE_OVERHEAD: usize = 128;

/// Index of an element in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaRef(u32);

impl ArenaRef {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArenaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One element in the arena.
#[derive(Debug)]
pub struct ArenaNode {
    vector: Arc<[f32]>,
    level: u8,
    neighbors: Box<[ArcSwap<NeighborArray<ArenaRef>>]>,
    heap_refs: ArcSwap<HeapRefs>,
}

impl ArenaNode {
    fn new(
        vector: Arc<[f32]>,
        level: u8,
        layers: Vec<NeighborArray<ArenaRef>>,
        heap_refs: HeapRefs,
    ) -> Self {
        Self {
            vector,
            level,
            neighbors: layers.into_iter().map(ArcSwap::from_pointee).collect(),
            heap_refs: ArcSwap::from_pointee(heap_refs),
        }
    }

    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn heap_refs(&self) -> HeapRefs {
        **self.heap_refs.load()
    }

    /// Current snapshot of the neighbor list at `layer`.
    pub fn neighbors(&self, layer: u8) -> Arc<NeighborArray<ArenaRef>> {
        match self.neighbors.get(layer as usize) {
            Some(slot) => slot.load_full(),
            None => Arc::new(NeighborArray::new(0)),
        }
    }
}

/// Bytes charged against the budget for one element.
pub fn node_size(dimensions: usize, level: u8, m: usize) -> usize {
    let slots: usize = (0..=level).map(|lc| layer_capacity(lc, m)).sum();
    NODE_OVERHEAD + dimensions * size_of::<f32>() + slots * size_of::<Neighbor<ArenaRef>>()
}

/// Element handle handed to the graph algorithms.
#[derive(Debug, Clone)]
pub struct ArenaElement {
    id: ArenaRef,
    node: Arc<ArenaNode>,
}

impl ArenaElement {
    pub fn id(&self) -> ArenaRef {
        self.id
    }

    pub fn node(&self) -> &ArenaNode {
        &self.node
    }
}

impl GraphNode for ArenaElement {
    type Ref = ArenaRef;

    fn pointer(&self) -> ArenaRef {
        self.id
    }

    fn level(&self) -> u8 {
        self.node.level
    }

    fn vector(&self) -> &[f32] {
        &self.node.vector
    }

    fn is_live(&self) -> bool {
        !self.node.heap_refs.load().is_empty()
    }
}

/// Entry point of the arena graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaEntry {
    pub element: ArenaRef,
    pub level: u8,
}

#[derive(Debug)]
struct Budget {
    used: usize,
    limit: usize,
}

/// Shared in-memory build graph.
pub struct Arena {
    m: usize,
    ef_construction: usize,
    dimensions: usize,
    metric: Arc<dyn VectorMetric>,
    levels: LevelGenerator,
    nodes: RwLock<Vec<Arc<ArenaNode>>>,
    allocator: Mutex<Budget>,
    locks: LockTable,
    entry: RwLock<Option<ArenaEntry>>,
    wait: Mutex<()>,
}

impl Arena {
    pub fn new(
        dimensions: usize,
        m: usize,
        ef_construction: usize,
        metric: Arc<dyn VectorMetric>,
        memory_limit: usize,
    ) -> Self {
        Self {
            m,
            ef_construction,
            dimensions,
            metric,
            levels: LevelGenerator::new(m),
            nodes: RwLock::new(Vec::new()),
            allocator: Mutex::new(Budget {
                used: 0,
                limit: memory_limit,
            }),
            locks: LockTable::default(),
            entry: RwLock::new(None),
            wait: Mutex::new(()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn memory_used(&self) -> usize {
        self.allocator.lock().used
    }

    pub fn memory_limit(&self) -> usize {
        self.allocator.lock().limit
    }

    /// Entry point, read through the wait lock.
    pub fn entry(&self) -> Option<ArenaEntry> {
        drop(self.wait.lock());
        *self.entry.read()
    }

    /// Snapshot of every element, in allocation order.
    pub fn elements(&self) -> Vec<Arc<ArenaNode>> {
        self.nodes.read().clone()
    }

    /// Reserve budget for an element and publish it.
    ///
    /// Only the reservation runs under the allocator lock.
    fn allocate(&self, node: ArenaNode) -> Option<ArenaRef> {
        let size = node_size(self.dimensions, node.level, self.m);
        {
            let mut budget = self.allocator.lock();
            if budget.used + size > budget.limit {
                return None;
            }
            budget.used += size;
        }
        let mut nodes = self.nodes.write();
        nodes.push(Arc::new(node));
        Some(ArenaRef::new(nodes.len() as u32 - 1))
    }

    /// Whether an element of `level` could still be allocated.
    fn has_room(&self, level: u8) -> bool {
        let budget = self.allocator.lock();
        budget.used + node_size(self.dimensions, level, self.m) <= budget.limit
    }
}

impl GraphAccess for Arena {
    type Node = ArenaElement;

    fn m(&self) -> usize {
        self.m
    }

    fn metric(&self) -> &dyn VectorMetric {
        &*self.metric
    }

    fn load(&self, element: ArenaRef) -> HnswResult<Option<ArenaElement>> {
        Ok(self
            .nodes
            .read()
            .get(element.index())
            .map(|node| ArenaElement {
                id: element,
                node: Arc::clone(node),
            }))
    }

    fn neighbors(&self, node: &ArenaElement, layer: u8) -> HnswResult<Vec<ArenaRef>> {
        Ok(node.node.neighbors(layer).elements())
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("elements", &self.len())
            .field("memory_used", &self.memory_used())
            .field("entry", &*self.entry.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;

    #[test]
    fn test_node_size_grows_with_level() {
        let base = node_size(8, 0, 4);
        assert_eq!(base, NODE_OVERHEAD + 32 + 8 * size_of::<Neighbor<ArenaRef>>());
        assert!(node_size(8, 2, 4) > base);
    }

    #[test]
    fn test_allocate_respects_budget() {
        let limit = node_size(2, 0, 2) * 2;
        let arena = Arena::new(2, 2, 8, MetricKind::L2.metric(), limit);
        let make = || {
            ArenaNode::new(
                Arc::from(vec![0.0, 0.0]),
                0,
                vec![NeighborArray::new(4)],
                HeapRefs::default(),
            )
        };
        assert_eq!(arena.allocate(make()), Some(ArenaRef::new(0)));
        assert_eq!(arena.allocate(make()), Some(ArenaRef::new(1)));
        assert!(!arena.has_room(0));
        assert_eq!(arena.allocate(make()), None);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.memory_used(), limit);
    }
}
