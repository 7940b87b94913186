//! Best-first search within one layer.

use super::candidate::{Candidate, Furthest, Nearest};
use super::{GraphAccess, GraphNode, NodeRef};
use crate::error::HnswResult;
use crate::types::Interrupt;
use std::collections::{BinaryHeap, HashSet};

/// Expansions between two cancellation checks.
const INTERRUPT_CHECK_INTERVAL: usize = 64;

/// Per-call bookkeeping threaded through a traversal.
#[derive(Debug, Default)]
pub struct SearchContext<'a> {
    pub interrupt: Option<&'a Interrupt>,
    /// Elements loaded so far, used to bound iterative scans.
    pub tuples: usize,
}

impl<'a> SearchContext<'a> {
    pub fn new(interrupt: Option<&'a Interrupt>) -> Self {
        Self {
            interrupt,
            tuples: 0,
        }
    }

    fn check(&self) -> HnswResult<()> {
        match self.interrupt {
            Some(interrupt) => interrupt.check(),
            None => Ok(()),
        }
    }
}

/// Greedy best-first search of `layer` starting from `entries`.
///
/// Keeps the best `ef` candidates seen. When `skip` is set (repairing an
/// existing element) tombstoned elements are still traversed but do not
/// count toward `ef`. Elements whose level is below `layer` are ignored and
/// reclaimed elements are never traversed.
///
/// Returns the kept candidates nearest first.
pub fn search_layer<G: GraphAccess>(
    graph: &G,
    query: &[f32],
    entries: Vec<Candidate<G::Node>>,
    ef: usize,
    layer: u8,
    skip: Option<NodeRef<G>>,
    ctx: &mut SearchContext<'_>,
) -> HnswResult<Vec<Candidate<G::Node>>> {
    let metric = graph.metric();
    let counts = |node: &G::Node| skip.is_none() || node.is_live();

    let mut visited: HashSet<NodeRef<G>> = HashSet::with_capacity(ef * 4);
    let mut candidates = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<Furthest<G::Node>> = BinaryHeap::with_capacity(ef + 1);
    let mut wlen = 0usize;

    for entry in entries {
        if !visited.insert(entry.pointer()) {
            continue;
        }
        ctx.tuples += 1;
        if counts(&entry.node) {
            wlen += 1;
        }
        candidates.push(Nearest(entry.clone()));
        results.push(Furthest(entry));
    }

    let mut expansions = 0usize;
    while let Some(Nearest(current)) = candidates.pop() {
        let Some(worst) = results.peek() else { break };
        if current.distance > worst.0.distance {
            break;
        }

        expansions += 1;
        if expansions % INTERRUPT_CHECK_INTERVAL == 0 {
            ctx.check()?;
        }

        for neighbor in graph.neighbors(&current.node, layer)? {
            if !visited.insert(neighbor) {
                continue;
            }
            let Some(node) = graph.load(neighbor)? else {
                continue;
            };
            ctx.tuples += 1;

            let distance = metric.distance(query, node.vector());
            let always_add = wlen < ef;
            let worst = results.peek().map_or(f64::INFINITY, |w| w.0.distance);
            if !(distance < worst || always_add) {
                continue;
            }
            // stale level read
            if node.level() < layer {
                continue;
            }

            let counted = counts(&node);
            let candidate = Candidate::new(node, distance);
            candidates.push(Nearest(candidate.clone()));
            results.push(Furthest(candidate));

            if counted {
                wlen += 1;
                if wlen > ef {
                    results.pop();
                }
            }
        }
    }

    let mut found: Vec<_> = results.into_iter().map(|f| f.0).collect();
    found.sort_by(Candidate::compare);
    Ok(found)
}
