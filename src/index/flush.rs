//! Writing the build arena out to pages.

use super::IndexInner;
use super::paged::{EntryUpdate, set_insert_page, update_entry_point};
use crate::arena::Arena;
use crate::error::HnswResult;
use crate::storage::{
    ElementTuple, EntryPoint, ItemPointer, NeighborTuple, Page, PageRef, PageWrite,
    element_tuple_size, neighbor_tuple_size,
};
use crate::types::ElementState;
use rayon::prelude::*;
use std::collections::HashMap;

/// Pages written per commit.
const FLUSH_BATCH_PAGES: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Placed {
    element: ItemPointer,
    neighbors: ItemPointer,
}

/// Pages being laid out before they are written.
struct Layout {
    pages: Vec<(PageRef, Page)>,
    position: HashMap<PageRef, usize>,
}

impl Layout {
    fn new() -> Self {
        Self {
            pages: vec![(PageRef::HEAD, Page::new())],
            position: HashMap::from([(PageRef::HEAD, 0)]),
        }
    }

    /// The page being filled. Never empty: the head page comes first.
    fn last(&mut self) -> (PageRef, &mut Page) {
        let idx = self.pages.len() - 1;
        let (page_ref, page) = &mut self.pages[idx];
        (*page_ref, page)
    }

    fn append(&mut self, page_ref: PageRef) {
        if let Some((_, last)) = self.pages.last_mut() {
            last.set_next(Some(page_ref));
        }
        self.position.insert(page_ref, self.pages.len());
        self.pages.push((page_ref, Page::new()));
    }

    fn page_mut(&mut self, page_ref: PageRef) -> Option<&mut Page> {
        let idx = *self.position.get(&page_ref)?;
        self.pages.get_mut(idx).map(|(_, page)| page)
    }
}

impl IndexInner {
    /// Write every arena element to the page chain, starting at the head
    /// page, and install the arena's entry point. The index must hold no
    /// elements. Returns the number of pages written.
    pub(crate) fn flush_arena(&self, arena: &Arena) -> HnswResult<usize> {
        let m = self.options.m;
        let nodes = arena.elements();
        let element_size = element_tuple_size(self.options.dimensions);
        let mut layout = Layout::new();
        let mut placed = Vec::with_capacity(nodes.len());

        for node in &nodes {
            let neighbor_size = neighbor_tuple_size(node.level(), m);
            let pair_fits_page = Page::new().can_fit(&[element_size, neighbor_size]);

            let (_, page) = layout.last();
            let room = if pair_fits_page {
                page.can_fit(&[element_size, neighbor_size])
            } else {
                page.can_fit(&[element_size])
            };
            if !room {
                layout.append(self.allocate_page());
            }

            let (page_ref, page) = layout.last();
            let element = ItemPointer::new(page_ref, page.item_count());
            let neighbors = if pair_fits_page {
                ItemPointer::new(page_ref, element.offset + 1)
            } else {
                let continuation = self.allocate_page();
                ItemPointer::new(continuation, 0)
            };

            let tuple = ElementTuple {
                level: node.level(),
                state: ElementState::Live,
                version: 0,
                heap_refs: node.heap_refs(),
                neighbor_tid: neighbors,
                vector: node.vector().to_vec(),
            };
            page.add_item(page_ref, tuple.encode())?;

            // Placeholder of the final size; the real tuple needs every
            // element's pointer first.
            let placeholder = NeighborTuple::empty(node.level(), m, 0).encode();
            if neighbors.page != page_ref {
                layout.append(neighbors.page);
            }
            let (neighbor_page_ref, neighbor_page) = layout.last();
            neighbor_page.add_item(neighbor_page_ref, placeholder)?;

            placed.push(Placed { element, neighbors });
        }

        let encoded: Vec<Vec<u8>> = nodes
            .par_iter()
            .map(|node| {
                let layers: Vec<Vec<ItemPointer>> = (0..=node.level())
                    .map(|lc| {
                        node.neighbors(lc)
                            .elements()
                            .into_iter()
                            .filter_map(|neighbor| placed.get(neighbor.index()).map(|p| p.element))
                            .collect()
                    })
                    .collect();
                NeighborTuple::from_layers(node.level(), m, 0, &layers).encode()
            })
            .collect();

        for (slot, tuple) in placed.iter().zip(encoded) {
            let tid = slot.neighbors;
            if let Some(page) = layout.page_mut(tid.page) {
                page.overwrite_item(tid.page, tid.offset, tuple)?;
            }
        }

        let last_page = layout.last().0;
        let page_count = layout.pages.len();
        let mut pending = layout.pages.into_iter().peekable();
        while pending.peek().is_some() {
            self.interrupt.check()?;
            let mut batch: Vec<PageWrite> = Vec::with_capacity(FLUSH_BATCH_PAGES);
            for (page_ref, page) in pending.by_ref().take(FLUSH_BATCH_PAGES) {
                let mut guard = self.store.write_page(page_ref)?;
                *guard = page;
                batch.push(guard);
            }
            let refs: Vec<&PageWrite> = batch.iter().collect();
            self.store.commit(&refs)?;
        }

        let entry = arena.entry().and_then(|entry| {
            placed.get(entry.element.index()).map(|p| EntryPoint {
                pointer: p.element,
                level: entry.level,
            })
        });
        update_entry_point(&self.store, entry, EntryUpdate::Always)?;
        set_insert_page(&self.store, last_page)?;

        tracing::info!(
            "[flush] wrote {} elements to {page_count} pages, entry point {:?}",
            nodes.len(),
            entry
        );
        Ok(page_count)
    }

    fn allocate_page(&self) -> PageRef {
        let _extension = self.store.lock_extension();
        self.store.allocate_page()
    }
}
