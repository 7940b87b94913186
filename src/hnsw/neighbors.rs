//! Neighbor arrays and the graph-update routines built on them.

use super::candidate::Candidate;
use super::search::{SearchContext, search_layer};
use super::select::select_neighbors;
use super::{GraphAccess, GraphNode, NodeRef, layer_capacity};
use crate::error::HnswResult;
use crate::metric::VectorMetric;

/// One adjacency entry with its cached distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor<R> {
    pub element: R,
    pub distance: f64,
}

/// Bounded adjacency list of one element on one layer.
///
/// Lists produced by selection are ordered nearest first; later back-edge
/// updates keep that order.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborArray<R> {
    items: Vec<Neighbor<R>>,
    capacity: usize,
}

impl<R: Copy + PartialEq> NeighborArray<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn from_candidates<N: GraphNode<Ref = R>>(kept: &[Candidate<N>], capacity: usize) -> Self {
        let mut array = Self::new(capacity);
        for candidate in kept.iter().take(capacity) {
            array.items.push(Neighbor {
                element: candidate.pointer(),
                distance: candidate.distance,
            });
        }
        array
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn contains(&self, element: R) -> bool {
        self.items.iter().any(|n| n.element == element)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor<R>> {
        self.items.iter()
    }

    pub fn elements(&self) -> Vec<R> {
        self.items.iter().map(|n| n.element).collect()
    }

    /// Append if there is room. Returns false when full.
    pub fn push(&mut self, neighbor: Neighbor<R>) -> bool {
        if self.is_full() {
            return false;
        }
        let at = self
            .items
            .iter()
            .position(|n| n.distance > neighbor.distance)
            .unwrap_or(self.items.len());
        self.items.insert(at, neighbor);
        true
    }

    /// Replace the entry at `idx`, keeping the list ordered.
    pub fn replace(&mut self, idx: usize, neighbor: Neighbor<R>) {
        if idx < self.items.len() {
            self.items.remove(idx);
            self.push(neighbor);
        }
    }

    /// Apply the outcome of [`update_connection`].
    pub fn apply(&mut self, update: ConnectionUpdate, neighbor: Neighbor<R>) -> bool {
        match update {
            ConnectionUpdate::Appended => self.push(neighbor),
            ConnectionUpdate::Replaced(idx) => {
                self.replace(idx, neighbor);
                true
            }
            ConnectionUpdate::Rejected => false,
        }
    }
}

/// How a back-edge lands in a neighbor's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// There was a free slot.
    Appended,
    /// The list was full; slot `idx` held the pruned neighbor.
    Replaced(usize),
    /// The new edge itself was the one pruned.
    Rejected,
}

/// Decide how to add `new` to a neighbor list currently holding `existing`
/// (distances relative to the list's owner).
///
/// A full list is re-selected over `existing + new`; exactly the pruned
/// slot is replaced, so the new edge is never silently dropped in favor of
/// an arbitrary victim.
pub fn update_connection<N: GraphNode>(
    existing: &[Candidate<N>],
    new: Candidate<N>,
    lm: usize,
    metric: &dyn VectorMetric,
) -> ConnectionUpdate {
    if existing.len() < lm {
        return ConnectionUpdate::Appended;
    }

    let new_ref = new.pointer();
    let mut candidates = existing.to_vec();
    candidates.push(new);

    let Some(pruned) = select_neighbors(candidates, lm, metric).pruned else {
        return ConnectionUpdate::Rejected;
    };
    if pruned.pointer() == new_ref {
        return ConnectionUpdate::Rejected;
    }
    existing
        .iter()
        .position(|c| c.pointer() == pruned.pointer())
        .map_or(ConnectionUpdate::Rejected, ConnectionUpdate::Replaced)
}

/// Find the neighbors of an element about to be attached at `level`.
///
/// Descends greedily (`ef = 1`) from the entry point to `level + 1`, then
/// runs `ef_construction` searches on each layer the element shares with
/// the entry point. With `existing` set the element is being re-attached:
/// it is excluded from its own neighbors and `ef` grows by one to make up
/// for it.
///
/// Returns the selected neighbors per layer, index 0 being layer 0. Layers
/// above the entry point's level are empty.
pub fn find_element_neighbors<G: GraphAccess>(
    graph: &G,
    query: &[f32],
    level: u8,
    entry: &G::Node,
    ef_construction: usize,
    existing: Option<NodeRef<G>>,
    ctx: &mut SearchContext<'_>,
) -> HnswResult<Vec<Vec<Candidate<G::Node>>>> {
    let metric = graph.metric();
    let m = graph.m();
    let entry_level = entry.level();
    let mut layers = vec![Vec::new(); level as usize + 1];

    let mut ep = vec![Candidate::new(entry.clone(), metric.distance(query, entry.vector()))];

    let mut lc = entry_level;
    while lc > level {
        ep = search_layer(graph, query, ep, 1, lc, existing, ctx)?;
        lc -= 1;
    }

    let ef = if existing.is_some() {
        ef_construction + 1
    } else {
        ef_construction
    };

    for lc in (0..=level.min(entry_level)).rev() {
        let w = search_layer(graph, query, ep, ef, lc, existing, ctx)?;

        // Tombstones help navigation but are never chosen as neighbors.
        let lw: Vec<_> = w
            .iter()
            .filter(|c| Some(c.pointer()) != existing && c.node.is_live())
            .cloned()
            .collect();

        layers[lc as usize] = select_neighbors(lw, layer_capacity(lc, m), metric).kept;
        ep = w;
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::testing::TestGraph;
    use crate::metric::L2;

    #[test]
    fn test_neighbor_array_stays_ordered() {
        let mut array = NeighborArray::new(3);
        for (element, distance) in [(1u32, 0.5), (2, 0.1), (3, 0.3)] {
            assert!(array.push(Neighbor { element, distance }));
        }
        assert!(array.is_full());
        assert!(!array.push(Neighbor {
            element: 4,
            distance: 0.0
        }));
        assert_eq!(array.elements(), vec![2, 3, 1]);

        array.replace(0, Neighbor {
            element: 5,
            distance: 0.4,
        });
        assert_eq!(array.elements(), vec![3, 5, 1]);
        assert!(array.contains(5));
    }

    #[test]
    fn test_update_connection_appends_with_room() {
        let mut graph = TestGraph::new(2);
        graph.add(1, 0, vec![1.0]);
        graph.add(2, 0, vec![2.0]);
        let owner = [0.0];
        let existing = vec![graph.candidate(1, &owner)];
        let update = update_connection(&existing, graph.candidate(2, &owner), 2, &L2);
        assert_eq!(update, ConnectionUpdate::Appended);
    }

    #[test]
    fn test_update_connection_replaces_pruned_slot() {
        // Owner at origin; 1 and 2 crowd the same side, new element 3 is alone.
        let mut graph = TestGraph::new(1);
        graph.add(1, 0, vec![1.0, 0.0]);
        graph.add(2, 0, vec![1.2, 0.0]);
        graph.add(3, 0, vec![-1.5, 0.0]);
        let owner = [0.0, 0.0];
        let existing = vec![graph.candidate(1, &owner), graph.candidate(2, &owner)];

        let update = update_connection(&existing, graph.candidate(3, &owner), 2, &L2);
        assert_eq!(update, ConnectionUpdate::Replaced(1));
    }

    #[test]
    fn test_update_connection_rejects_redundant_edge() {
        let mut graph = TestGraph::new(1);
        graph.add(1, 0, vec![1.0, 0.0]);
        graph.add(2, 0, vec![-1.0, 0.0]);
        graph.add(3, 0, vec![1.1, 0.0]);
        let owner = [0.0, 0.0];
        let existing = vec![graph.candidate(1, &owner), graph.candidate(2, &owner)];

        let update = update_connection(&existing, graph.candidate(3, &owner), 2, &L2);
        assert_eq!(update, ConnectionUpdate::Rejected);
    }

    #[test]
    fn test_find_element_neighbors_per_layer() {
        let mut graph = TestGraph::new(2);
        graph.add(0, 1, vec![0.0]);
        for i in 1..6 {
            graph.add(i, 0, vec![i as f32]);
            graph.link(i - 1, i, 0);
        }
        graph.add(6, 1, vec![6.0]);
        graph.link(5, 6, 0);
        graph.link(0, 6, 1);

        let entry = graph.nodes[&0].clone();
        let mut ctx = SearchContext::default();
        let layers =
            find_element_neighbors(&graph, &[3.4], 0, &entry, 8, None, &mut ctx).unwrap();
        assert_eq!(layers.len(), 1);
        let ids: Vec<u32> = layers[0].iter().map(|c| c.node.id).collect();
        assert_eq!(ids[0], 3);
        assert!(ids.len() <= 4);
    }

    #[test]
    fn test_find_element_neighbors_skips_self_and_tombstones() {
        let mut graph = TestGraph::new(2);
        for i in 0..5 {
            graph.add(i, 0, vec![i as f32]);
        }
        for i in 1..5 {
            graph.link(i - 1, i, 0);
        }
        graph.nodes.get_mut(&3).unwrap().live = false;

        let entry = graph.nodes[&0].clone();
        let query = graph.nodes[&2].vector.clone();
        let layers = find_element_neighbors(
            &graph,
            &query,
            0,
            &entry,
            8,
            Some(2),
            &mut SearchContext::default(),
        )
        .unwrap();
        let ids: Vec<u32> = layers[0].iter().map(|c| c.node.id).collect();
        assert!(!ids.contains(&2));
        assert!(!ids.contains(&3));
        assert!(ids.contains(&4));
    }
}
