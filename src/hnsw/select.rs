//! Neighbor selection with diversity pruning.

use super::candidate::{Candidate, sort_nearest};
use super::GraphNode;
use crate::metric::VectorMetric;

/// Outcome of [`select_neighbors`].
#[derive(Debug)]
pub struct Selection<N> {
    /// Chosen neighbors, at most `lm`.
    pub kept: Vec<Candidate<N>>,
    /// One candidate that did not make the cut, if any was cut.
    pub pruned: Option<Candidate<N>>,
}

/// Choose up to `lm` neighbors from `candidates`.
///
/// Candidates are visited nearest first and kept only while they are
/// strictly closer to the query than to every neighbor already kept. If
/// fewer than `lm` survive, the closest rejected candidates fill the gap.
///
/// `pruned` is the closest rejected candidate left out, or, when every
/// rejected candidate was backfilled, the furthest candidate that was never
/// examined.
pub fn select_neighbors<N: GraphNode>(
    mut candidates: Vec<Candidate<N>>,
    lm: usize,
    metric: &dyn VectorMetric,
) -> Selection<N> {
    sort_nearest(&mut candidates);
    if candidates.len() <= lm {
        return Selection {
            kept: candidates,
            pruned: None,
        };
    }

    let mut kept: Vec<Candidate<N>> = Vec::with_capacity(lm);
    let mut rejected = Vec::new();
    let mut remaining = candidates.into_iter();

    while kept.len() < lm {
        let Some(e) = remaining.next() else { break };
        let closer = kept
            .iter()
            .all(|r| metric.distance(e.node.vector(), r.node.vector()) > e.distance);
        if closer {
            kept.push(e);
        } else {
            rejected.push(e);
        }
    }

    let mut rejected = rejected.into_iter();
    while kept.len() < lm {
        match rejected.next() {
            Some(e) => kept.push(e),
            None => break,
        }
    }

    let pruned = rejected.next().or_else(|| remaining.next_back());
    Selection { kept, pruned }
}
