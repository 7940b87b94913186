//! Distance-keyed candidates.

use super::GraphNode;
use std::cmp::Ordering;

/// An element together with its distance to the current query.
#[derive(Debug, Clone)]
pub struct Candidate<N> {
    pub node: N,
    pub distance: f64,
}

impl<N: GraphNode> Candidate<N> {
    pub fn new(node: N, distance: f64) -> Self {
        Self { node, distance }
    }

    pub fn pointer(&self) -> N::Ref {
        self.node.pointer()
    }

    /// Total order: distance first, element reference on ties.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.pointer().cmp(&other.pointer()))
    }
}

/// Sort candidates nearest first.
pub fn sort_nearest<N: GraphNode>(candidates: &mut [Candidate<N>]) {
    candidates.sort_by(Candidate::compare);
}

/// Heap entry that pops the nearest candidate first.
pub(crate) struct Nearest<N>(pub Candidate<N>);

impl<N: GraphNode> PartialEq for Nearest<N> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<N: GraphNode> Eq for Nearest<N> {}

impl<N: GraphNode> PartialOrd for Nearest<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<N: GraphNode> Ord for Nearest<N> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap
        self.0.compare(&other.0).reverse()
    }
}

/// Heap entry that pops the furthest candidate first.
pub(crate) struct Furthest<N>(pub Candidate<N>);

impl<N: GraphNode> PartialEq for Furthest<N> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<N: GraphNode> Eq for Furthest<N> {}

impl<N: GraphNode> PartialOrd for Furthest<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<N: GraphNode> Ord for Furthest<N> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.compare(&other.0)
    }
}
