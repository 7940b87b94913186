//! The scan protocol.
//!
//! A scan is opened with [`HnswIndex::begin_scan`], given a query with
//! [`IndexScan::rescan`] and drained with [`IndexScan::next`]. The first
//! call to `next` runs the graph search; rows are then handed out nearest
//! first. Once those run out, an iterative scan doubles its candidate list
//! and searches again, returning only rows it has not returned before.

use super::paged::invalid_tuple;
use super::{HnswIndex, IndexInner};
use crate::config::IterativeScan;
use crate::error::HnswResult;
use crate::hnsw::{Candidate, GraphAccess, GraphNode, SearchContext, search_layer};
use crate::recall::RECALL_EPSILON;
use crate::storage::{ElementHeader, ElementTuple, PageRef, TupleKind};
use crate::types::RowId;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// One returned row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub row_id: RowId,
    pub distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No query yet, or the query could not be normalized.
    Idle,
    /// A query is set but not searched.
    Ready,
    /// At least one pass ran.
    Running,
    Exhausted,
}

/// An open scan over one index.
pub struct IndexScan {
    index: HnswIndex,
    ef_search: usize,
    mode: IterativeScan,
    max_scan_tuples: usize,
    max_ef_search: usize,
    query: Option<Arc<[f32]>>,
    phase: Phase,
    ef: usize,
    last_pass: usize,
    tuples: usize,
    pending: VecDeque<(RowId, f64)>,
    returned: HashSet<RowId>,
    previous_distance: f64,
    emitted: usize,
    max_distance: f64,
}

impl HnswIndex {
    /// Open a scan that searches with `ef_search` candidates.
    pub fn begin_scan(&self, ef_search: usize) -> IndexScan {
        let search = &self.inner.settings.search;
        IndexScan {
            index: self.clone(),
            ef_search: ef_search.max(1),
            mode: search.iterative_scan,
            max_scan_tuples: search.max_scan_tuples,
            max_ef_search: search.max_ef_search.max(ef_search),
            query: None,
            phase: Phase::Idle,
            ef: ef_search.max(1),
            last_pass: 0,
            tuples: 0,
            pending: VecDeque::new(),
            returned: HashSet::new(),
            previous_distance: f64::NEG_INFINITY,
            emitted: 0,
            max_distance: f64::NEG_INFINITY,
        }
    }
}

impl IndexScan {
    /// Override the iterative mode taken from settings.
    #[must_use]
    pub fn with_iterative_scan(mut self, mode: IterativeScan) -> Self {
        self.mode = mode;
        self
    }

    /// Start over with a new query. A vector that cannot be normalized
    /// yields an empty stream.
    pub fn rescan(&mut self, query: &[f32]) -> HnswResult<()> {
        let query = self.index.inner.prepare(query)?;
        self.phase = if query.is_some() {
            Phase::Ready
        } else {
            Phase::Idle
        };
        self.query = query;
        self.ef = self.ef_search;
        self.last_pass = 0;
        self.tuples = 0;
        self.pending.clear();
        self.returned.clear();
        self.previous_distance = f64::NEG_INFINITY;
        self.emitted = 0;
        self.max_distance = f64::NEG_INFINITY;
        Ok(())
    }

    /// Next row id, or `None` at the end of the stream.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> HnswResult<Option<RowId>> {
        Ok(self.next_hit()?.map(|hit| hit.row_id))
    }

    /// Next row together with its distance to the query.
    pub fn next_hit(&mut self) -> HnswResult<Option<SearchHit>> {
        loop {
            if let Some((row_id, distance)) = self.pending.pop_front() {
                if self.mode == IterativeScan::Strict && distance < self.previous_distance {
                    continue;
                }
                self.previous_distance = distance;
                self.emitted += 1;
                self.max_distance = self.max_distance.max(distance);
                return Ok(Some(SearchHit { row_id, distance }));
            }

            match self.phase {
                Phase::Idle | Phase::Exhausted => return Ok(None),
                Phase::Ready => {
                    self.run_pass()?;
                    self.phase = Phase::Running;
                }
                Phase::Running => {
                    if !self.expand()? {
                        self.phase = Phase::Exhausted;
                    }
                }
            }
        }
    }

    /// Elements visited so far across all passes.
    pub fn tuples_visited(&self) -> usize {
        self.tuples
    }

    /// Current candidate list size.
    pub fn ef(&self) -> usize {
        self.ef
    }

    /// Close the scan, feeding the recall tracker.
    pub fn end(self) -> HnswResult<()> {
        let inner = &self.index.inner;
        let Some(query) = &self.query else {
            return Ok(());
        };
        if !inner.recall.is_enabled() {
            return Ok(());
        }
        let cutoff = self.max_distance + RECALL_EPSILON;
        inner.recall.record(self.emitted, |limit| {
            inner.count_within(query, cutoff, limit, inner.recall.max_scan_tuples())
        })
    }

    /// Double `ef` and search again, if the last pass may have been cut short.
    fn expand(&mut self) -> HnswResult<bool> {
        if self.mode == IterativeScan::Off
            || self.last_pass < self.ef
            || self.tuples >= self.max_scan_tuples
            || self.ef >= self.max_ef_search
        {
            return Ok(false);
        }
        self.ef = (self.ef * 2).min(self.max_ef_search);
        tracing::trace!("[scan] expanding to ef={} after {} tuples", self.ef, self.tuples);
        Ok(self.run_pass()? > 0)
    }

    /// Search with the current `ef` and queue rows not returned before.
    /// Returns how many rows were queued.
    fn run_pass(&mut self) -> HnswResult<usize> {
        let Some(query) = self.query.clone() else {
            return Ok(0);
        };
        let inner = &self.index.inner;
        let _scan = inner.locks.scan_shared();

        let Some(entry) = inner.metadata()?.entry else {
            return Ok(0);
        };
        let graph = inner.graph();
        let Some(node) = graph.load(entry.pointer)? else {
            return Err(invalid_tuple(entry.pointer, "entry point is reclaimed"));
        };

        let mut ctx = SearchContext::new(Some(&inner.interrupt));
        let distance = graph.metric().distance(&query, node.vector());
        let mut w = vec![Candidate::new(node, distance)];
        for lc in (1..=entry.level).rev() {
            w = search_layer(&graph, &query, w, 1, lc, None, &mut ctx)?;
        }
        let found = search_layer(&graph, &query, w, self.ef, 0, None, &mut ctx)?;

        self.tuples += ctx.tuples;
        self.last_pass = found.len();

        let mut queued = 0;
        for candidate in found {
            // most recently added row first
            for row in candidate.node.heap_refs().iter().rev() {
                if self.returned.insert(row) {
                    self.pending.push_back((row, candidate.distance));
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }
}

impl IndexInner {
    /// Count rows of live elements within `cutoff` of `query` by walking the
    /// pages. Stops once the count exceeds `limit` or `max_tuples` elements
    /// were examined.
    pub(crate) fn count_within(
        &self,
        query: &[f32],
        cutoff: f64,
        limit: usize,
        max_tuples: usize,
    ) -> HnswResult<usize> {
        let mut count = 0;
        let mut examined = 0;
        let mut current = Some(PageRef::HEAD);

        while let Some(page_ref) = current {
            let page = self.store.read_page(page_ref)?;
            for (_, item) in page.items() {
                if TupleKind::of(item) != Some(TupleKind::Element) {
                    continue;
                }
                if !ElementHeader::peek(item)?.is_live() {
                    continue;
                }
                examined += 1;
                let tuple = ElementTuple::decode(item)?;
                if self.metric.distance(query, &tuple.vector) <= cutoff {
                    count += tuple.heap_refs.len();
                    if count > limit {
                        return Ok(limit + 1);
                    }
                }
                if examined >= max_tuples {
                    return Ok(count);
                }
            }
            current = page.next();
        }
        Ok(count)
    }
}
