//! Structural checks over the whole page chain.

use super::HnswIndex;
use super::paged::{PagedElement, PagedGraph};
use crate::error::{HnswError, HnswResult};
use crate::hnsw::layer_capacity;
use crate::storage::{ElementHeader, EntryPoint, ItemPointer, PageRef, TupleKind};
use crate::types::ElementState;
use std::collections::HashMap;

/// Result of [`HnswIndex::verify`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphReport {
    pub pages: usize,
    pub live_elements: usize,
    pub tombstoned: usize,
    pub reclaimable: usize,
    /// Heap refs across live elements.
    pub rows: usize,
    pub max_live_level: Option<u8>,
    pub entry: Option<EntryPoint>,
    pub violations: Vec<String>,
}

impl GraphReport {
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }

    /// `Err` carrying the first violation, if any.
    pub fn into_result(self) -> HnswResult<Self> {
        match self.violations.first() {
            None => Ok(self),
            Some(first) => {
                tracing::error!(
                    "[verify] {} invariant violations, first: {first}",
                    self.violations.len()
                );
                Err(HnswError::InvariantViolated {
                    reason: first.clone(),
                })
            }
        }
    }
}

impl HnswIndex {
    /// Walk every page and check the graph invariants.
    ///
    /// Storage-level damage (undecodable tuples) is returned as `Err`;
    /// broken graph invariants are collected in the report. Intended for
    /// quiescent indexes: concurrent writers may produce transient
    /// violations.
    pub fn verify(&self) -> HnswResult<GraphReport> {
        let inner = &self.inner;
        let m = inner.options.m;
        let graph = inner.graph();
        let mut report = GraphReport {
            entry: inner.metadata()?.entry,
            ..Default::default()
        };

        let mut states: HashMap<ItemPointer, ElementState> = HashMap::new();
        let mut elements: Vec<PagedElement> = Vec::new();
        let mut current = Some(PageRef::HEAD);
        while let Some(page_ref) = current {
            let pointers: Vec<ItemPointer> = {
                let page = inner.store.read_page(page_ref)?;
                current = page.next();
                let mut pointers = Vec::new();
                for (offset, item) in page.items() {
                    if TupleKind::of(item) == Some(TupleKind::Element) {
                        let header = ElementHeader::peek(item)?;
                        states.insert(ItemPointer::new(page_ref, offset), header.state);
                        if header.state != ElementState::Reclaimable {
                            pointers.push(ItemPointer::new(page_ref, offset));
                        }
                    }
                }
                pointers
            };
            for pointer in pointers {
                elements.push(graph.load_any(pointer)?);
            }
            report.pages += 1;
        }

        for state in states.values() {
            match state {
                ElementState::Live => report.live_elements += 1,
                ElementState::Tombstoned => report.tombstoned += 1,
                ElementState::Reclaimable => report.reclaimable += 1,
            }
        }

        for element in &elements {
            if element.state == ElementState::Live {
                report.rows += element.heap_refs.len();
                report.max_live_level = report.max_live_level.max(Some(element.level));
            }
            check_element(&graph, element, &states, m, &mut report.violations)?;
        }

        match report.entry {
            Some(entry) => match states.get(&entry.pointer) {
                None => report
                    .violations
                    .push(format!("entry point {} is not an element", entry.pointer)),
                Some(ElementState::Reclaimable) => report
                    .violations
                    .push(format!("entry point {} is reclaimed", entry.pointer)),
                Some(_) => {
                    if report.max_live_level.is_some_and(|max| max > entry.level) {
                        report.violations.push(format!(
                            "entry point level {} is below the highest live level {:?}",
                            entry.level, report.max_live_level
                        ));
                    }
                }
            },
            None if report.live_elements > 0 => report.violations.push(format!(
                "no entry point but {} live elements",
                report.live_elements
            )),
            None => {}
        }

        tracing::debug!(
            "[verify] {} pages, {} live, {} tombstoned, {} reclaimable, {} violations",
            report.pages,
            report.live_elements,
            report.tombstoned,
            report.reclaimable,
            report.violations.len()
        );
        Ok(report)
    }
}

fn check_element(
    graph: &PagedGraph<'_>,
    element: &PagedElement,
    states: &HashMap<ItemPointer, ElementState>,
    m: usize,
    violations: &mut Vec<String>,
) -> HnswResult<()> {
    let pointer = element.pointer;
    let tuple = match graph.neighbor_tuple(element) {
        Ok(Some(tuple)) => tuple,
        Ok(None) => {
            violations.push(format!("{pointer}: neighbor tuple version differs from element"));
            return Ok(());
        }
        Err(err) if err.is_structural() => {
            violations.push(format!("{pointer}: {err}"));
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    if element.state == ElementState::Live && element.heap_refs.is_empty() {
        violations.push(format!("{pointer}: live element without rows"));
    }

    for lc in 0..=element.level {
        let neighbors = tuple.layer(element.level, lc, m);
        if neighbors.len() > layer_capacity(lc, m) {
            violations.push(format!("{pointer}: layer {lc} holds {} neighbors", neighbors.len()));
        }
        if element.state != ElementState::Live {
            continue;
        }
        for neighbor in neighbors {
            match states.get(&neighbor) {
                None => violations.push(format!(
                    "{pointer}: layer {lc} links to non-element {neighbor}"
                )),
                Some(ElementState::Reclaimable) => {
                    violations.push(format!("{pointer}: layer {lc} links to reclaimed {neighbor}"))
                }
                Some(_) if neighbor == pointer => {
                    violations.push(format!("{pointer}: layer {lc} links to itself"))
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
