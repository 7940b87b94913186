//! Single-element insertion into the paged graph.

use super::paged::{
    EntryUpdate, PagedElement, PagedGraph, check_slot_count, invalid_tuple, set_insert_page,
    update_entry_point,
};
use super::{IndexInner, InsertOutcome};
use crate::error::{HnswError, HnswResult};
use crate::hnsw::{
    Candidate, ConnectionUpdate, GraphAccess, GraphNode, SearchContext, find_element_neighbors,
    layer_capacity, update_connection,
};
use crate::metric::bit_identical;
use crate::storage::tuple::layer_slots;
use crate::storage::{
    ElementHeader, ElementTuple, EntryPoint, ItemPointer, NeighborTuple, Page, PageRef, PageWrite,
    TupleKind, element_tuple_size, neighbor_tuple_size,
};
use crate::types::{ElementState, HeapRefs, RowId};
use std::sync::Arc;

/// Where a new element landed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub element: ItemPointer,
    pub neighbors: ItemPointer,
    pub version: u8,
}

/// Candidates chosen for one new or repaired element, layer 0 first.
pub(crate) type Layers = Vec<Vec<Candidate<PagedElement>>>;

impl IndexInner {
    /// Insert a prepared vector at `level`.
    pub(crate) fn insert_vector(
        &self,
        vector: Arc<[f32]>,
        row: RowId,
        level: u8,
    ) -> HnswResult<InsertOutcome> {
        let mut update = self.locks.update_shared();
        let mut metadata = self.metadata()?;
        if metadata.entry.is_none_or(|entry| level > entry.level) {
            drop(update);
            update = self.locks.update_exclusive();
            metadata = self.metadata()?;
        }

        let graph = self.graph();
        let entry = match metadata.entry {
            Some(entry) => Some(graph.load(entry.pointer)?.ok_or_else(|| {
                tracing::error!("[index] entry point {} is reclaimed", entry.pointer);
                HnswError::Corrupted {
                    reason: format!("entry point {} is reclaimed", entry.pointer),
                }
            })?),
            None => None,
        };

        let mut ctx = SearchContext::new(Some(&self.interrupt));
        let layers = match &entry {
            Some(entry) => find_element_neighbors(
                &graph,
                &vector,
                level,
                entry,
                self.options.ef_construction,
                None,
                &mut ctx,
            )?,
            None => vec![Vec::new(); level as usize + 1],
        };

        if let Some(duplicate) = self.add_duplicate_on_disk(&layers[0], &vector, row)? {
            return Ok(InsertOutcome::Duplicate(duplicate));
        }

        let pointers: Vec<Vec<ItemPointer>> = layers
            .iter()
            .map(|kept| kept.iter().map(Candidate::pointer).collect())
            .collect();
        let placement = self.add_element_on_disk(
            metadata.insert_page,
            &vector,
            level,
            HeapRefs::single(row),
            &pointers,
        )?;

        let element = PagedElement {
            pointer: placement.element,
            level,
            state: ElementState::Live,
            version: placement.version,
            heap_refs: HeapRefs::single(row),
            neighbor_tid: placement.neighbors,
            vector,
        };
        self.update_neighbors_on_disk(&graph, &element, &layers, false)?;

        if update.is_exclusive() {
            update_entry_point(
                &self.store,
                Some(EntryPoint {
                    pointer: element.pointer,
                    level,
                }),
                EntryUpdate::Greater,
            )?;
        }
        drop(update);

        Ok(InsertOutcome::Inserted(element.pointer))
    }

    /// Attach `row` to the first layer-0 neighbor holding a bit-identical
    /// vector with spare capacity. Stops at the first neighbor that differs.
    pub(crate) fn add_duplicate_on_disk(
        &self,
        neighbors: &[Candidate<PagedElement>],
        vector: &[f32],
        row: RowId,
    ) -> HnswResult<Option<ItemPointer>> {
        for candidate in neighbors {
            if !bit_identical(candidate.node.vector(), vector) {
                return Ok(None);
            }

            let pointer = candidate.pointer();
            let mut page = self.store.write_page(pointer.page)?;
            let item = page
                .item(pointer.offset)
                .ok_or_else(|| invalid_tuple(pointer, "no item at this offset"))?;
            let mut tuple = ElementTuple::decode(item)?;

            // Re-check under the page lock: vacuum or another duplicate may
            // have changed the element since the search read it.
            if tuple.state != ElementState::Live
                || tuple.version != candidate.node.version
                || tuple.heap_refs.is_empty()
                || !tuple.heap_refs.push(row)
            {
                continue;
            }

            page.overwrite_item(pointer.page, pointer.offset, tuple.encode())?;
            self.store.commit(&[&page])?;
            return Ok(Some(pointer));
        }
        Ok(None)
    }

    /// Write a new element and its neighbor tuple, walking the page chain
    /// from `start`.
    ///
    /// In order of preference: both tuples on a page with room, a reclaimed
    /// slot large enough for both, the element on the last page with its
    /// neighbor tuple on a fresh continuation page (when the pair can never
    /// share a page), or a new page appended to the chain.
    pub(crate) fn add_element_on_disk(
        &self,
        start: PageRef,
        vector: &[f32],
        level: u8,
        heap_refs: HeapRefs,
        layers: &[Vec<ItemPointer>],
    ) -> HnswResult<Placement> {
        let m = self.options.m;
        let element_size = element_tuple_size(vector.len());
        let neighbor_size = neighbor_tuple_size(level, m);
        let min_combined = [element_size, neighbor_tuple_size(0, m)];
        let pair_fits_page = Page::new().can_fit(&[element_size, neighbor_size]);

        let encode = |version: u8, neighbor_tid: ItemPointer| {
            let element = ElementTuple {
                level,
                state: ElementState::Live,
                version,
                heap_refs,
                neighbor_tid,
                vector: vector.to_vec(),
            };
            let neighbors = NeighborTuple::from_layers(level, m, version, layers);
            (element.encode(), neighbors.encode())
        };

        let mut current = start;
        let mut new_insert_page = None;

        let placement = loop {
            self.interrupt.check()?;
            let mut page = self.store.write_page(current)?;

            if new_insert_page.is_none() && page.can_fit(&min_combined) {
                new_insert_page = Some(current);
            }

            if page.can_fit(&[element_size, neighbor_size]) {
                let offset = page.item_count();
                let element = ItemPointer::new(current, offset);
                let neighbors = ItemPointer::new(current, offset + 1);
                let (etup, ntup) = encode(0, neighbors);
                page.add_item(current, etup)?;
                page.add_item(current, ntup)?;
                self.store.commit(&[&page])?;
                break Placement {
                    element,
                    neighbors,
                    version: 0,
                };
            }

            let reused = self.reuse_reclaimed(&mut page, element_size, neighbor_size, &encode)?;
            if let Some(placement) = reused {
                break placement;
            }

            if !pair_fits_page && page.can_fit(&[element_size]) && page.next().is_none() {
                let _extension = self.store.lock_extension();
                let continuation = self.store.allocate_page();
                let mut next_page = self.store.write_page(continuation)?;
                page.set_next(Some(continuation));

                let element = ItemPointer::new(current, page.item_count());
                let neighbors = ItemPointer::new(continuation, 0);
                let (etup, ntup) = encode(0, neighbors);
                page.add_item(current, etup)?;
                next_page.add_item(continuation, ntup)?;
                self.store.commit(&[&page, &next_page])?;
                break Placement {
                    element,
                    neighbors,
                    version: 0,
                };
            }

            current = match page.next() {
                Some(next) => next,
                None => {
                    let _extension = self.store.lock_extension();
                    let appended = self.store.allocate_page();
                    let next_page = self.store.write_page(appended)?;
                    page.set_next(Some(appended));
                    self.store.commit(&[&page, &next_page])?;
                    appended
                }
            };
        };

        // The element's own page is the fallback cursor when no page on the
        // way had room for a minimal element.
        let cursor = new_insert_page.unwrap_or(placement.neighbors.page);
        if cursor != start {
            set_insert_page(&self.store, cursor)?;
        }

        Ok(placement)
    }

    /// Overwrite a reclaimed element slot on `page` if its freed space (and
    /// its neighbor tuple's) fits the new tuples. Bumps the slot version.
    fn reuse_reclaimed(
        &self,
        page: &mut PageWrite,
        element_size: usize,
        neighbor_size: usize,
        encode: &impl Fn(u8, ItemPointer) -> (Vec<u8>, Vec<u8>),
    ) -> HnswResult<Option<Placement>> {
        let current = page.page_ref();
        let mut reclaimed = Vec::new();
        for (offset, item) in page.items() {
            if TupleKind::of(item) != Some(TupleKind::Element) {
                continue;
            }
            let header = ElementHeader::peek(item)?;
            if header.state == ElementState::Reclaimable {
                reclaimed.push((offset, header, item.len()));
            }
        }

        for (offset, header, element_len) in reclaimed {
            let tid = header.neighbor_tid;
            let version = header.version.wrapping_add(1);
            let element = ItemPointer::new(current, offset);

            if tid.page == current {
                let neighbor_len = page.item(tid.offset).map_or(0, <[u8]>::len);
                if element_size + neighbor_size > element_len + neighbor_len + page.free_space() {
                    continue;
                }
                let (etup, ntup) = encode(version, tid);
                page.overwrite_item(current, offset, etup)?;
                page.overwrite_item(current, tid.offset, ntup)?;
                self.store.commit(&[&*page])?;
            } else {
                // Continuation pages always come after their element page;
                // anything else would break the ascending lock order.
                if tid.page < current || element_size > element_len + page.free_space() {
                    continue;
                }
                let mut neighbor_page = self.store.write_page(tid.page)?;
                let neighbor_len = neighbor_page.item(tid.offset).map_or(0, <[u8]>::len);
                if neighbor_size > neighbor_len + neighbor_page.free_space() {
                    continue;
                }
                let (etup, ntup) = encode(version, tid);
                page.overwrite_item(current, offset, etup)?;
                neighbor_page.overwrite_item(tid.page, tid.offset, ntup)?;
                self.store.commit(&[&*page, &neighbor_page])?;
            }

            tracing::trace!("[index] reused reclaimed slot {element} (version {version})");
            return Ok(Some(Placement {
                element,
                neighbors: tid,
                version,
            }));
        }
        Ok(None)
    }

    /// Add back-edges from every selected neighbor to `element`.
    ///
    /// With `check_existing` (repair) a neighbor that already links to the
    /// element is left alone.
    pub(crate) fn update_neighbors_on_disk(
        &self,
        graph: &PagedGraph<'_>,
        element: &PagedElement,
        layers: &Layers,
        check_existing: bool,
    ) -> HnswResult<()> {
        for (lc, kept) in layers.iter().enumerate().rev() {
            let lc = lc as u8;
            for neighbor in kept {
                if neighbor.node.level() < lc {
                    continue;
                }
                self.add_back_edge(graph, element, neighbor, lc, check_existing)?;
            }
        }
        Ok(())
    }

    fn add_back_edge(
        &self,
        graph: &PagedGraph<'_>,
        element: &PagedElement,
        neighbor: &Candidate<PagedElement>,
        lc: u8,
        check_existing: bool,
    ) -> HnswResult<()> {
        let m = self.options.m;
        let lm = layer_capacity(lc, m);

        // The neighbor may have been reclaimed or its slot reused since the search.
        let Some(owner) = graph.load(neighbor.pointer())? else {
            return Ok(());
        };
        if owner.version != neighbor.node.version || owner.level < lc {
            return Ok(());
        }
        let current = graph.neighbors(&owner, lc)?;
        if check_existing && current.contains(&element.pointer) {
            return Ok(());
        }

        let update = if current.len() < lm {
            ConnectionUpdate::Appended
        } else {
            self.choose_slot(graph, &owner, &current, element, neighbor.distance, lm)?
        };
        if update == ConnectionUpdate::Rejected {
            return Ok(());
        }

        let tid = owner.neighbor_tid;
        let mut page = self.store.write_page(tid.page)?;
        let item = page
            .item(tid.offset)
            .ok_or_else(|| invalid_tuple(tid, "no neighbor tuple at this offset"))?;
        let mut tuple = NeighborTuple::decode(item)?;
        if tuple.version != owner.version {
            return Ok(());
        }
        check_slot_count(&tuple, &owner, m)?;

        let range = layer_slots(owner.level, lc, m);
        if check_existing && tuple.slots[range.clone()].contains(&Some(element.pointer)) {
            return Ok(());
        }
        // The list may have changed since it was read; only write a slot
        // that still holds what the decision was based on.
        let slot = match update {
            ConnectionUpdate::Appended => range.clone().find(|&i| tuple.slots[i].is_none()),
            ConnectionUpdate::Replaced(idx) => {
                let i = range.start + idx;
                (i < range.end && tuple.slots[i] == Some(current[idx])).then_some(i)
            }
            ConnectionUpdate::Rejected => None,
        };
        let Some(slot) = slot else {
            return Ok(());
        };

        tuple.slots[slot] = Some(element.pointer);
        page.overwrite_item(tid.page, tid.offset, tuple.encode())?;
        self.store.commit(&[&page])?;
        Ok(())
    }

    /// Pick the slot of a full list to give to `element`. A slot pointing at
    /// a reclaimed or tombstoned element is taken first; otherwise the list
    /// is re-selected and the pruned slot is replaced.
    fn choose_slot(
        &self,
        graph: &PagedGraph<'_>,
        owner: &PagedElement,
        current: &[ItemPointer],
        element: &PagedElement,
        distance: f64,
        lm: usize,
    ) -> HnswResult<ConnectionUpdate> {
        let metric = graph.metric();
        let mut existing = Vec::with_capacity(current.len());
        for (idx, pointer) in current.iter().enumerate() {
            match graph.load(*pointer)? {
                Some(node) if node.is_live() => {
                    let d = metric.distance(owner.vector(), node.vector());
                    existing.push(Candidate::new(node, d));
                }
                _ => return Ok(ConnectionUpdate::Replaced(idx)),
            }
        }
        Ok(update_connection(
            &existing,
            Candidate::new(element.clone(), distance),
            lm,
            metric,
        ))
    }
}
