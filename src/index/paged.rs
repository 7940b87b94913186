//! Graph access over the page store.
//!
//! [`PagedGraph`] implements [`GraphAccess`] by decoding tuples straight
//! from pages. Every load takes the page lock shared only for the decode and
//! hands out an owned copy, so the graph algorithms never hold a page lock
//! across a distance computation.

use crate::error::{HnswError, HnswResult};
use crate::hnsw::{GraphAccess, GraphNode};
use crate::metric::VectorMetric;
use crate::storage::{
    ElementTuple, EntryPoint, ItemPointer, Metadata, NeighborTuple, PageRef, PageStore, TupleKind,
};
use crate::types::{ElementState, HeapRefs};
use std::sync::Arc;

/// An element decoded from its page.
#[derive(Debug, Clone)]
pub struct PagedElement {
    pub(crate) pointer: ItemPointer,
    pub(crate) level: u8,
    pub(crate) state: ElementState,
    pub(crate) version: u8,
    pub(crate) heap_refs: HeapRefs,
    pub(crate) neighbor_tid: ItemPointer,
    pub(crate) vector: Arc<[f32]>,
}

impl PagedElement {
    fn from_tuple(pointer: ItemPointer, tuple: ElementTuple) -> Self {
        Self {
            pointer,
            level: tuple.level,
            state: tuple.state,
            version: tuple.version,
            heap_refs: tuple.heap_refs,
            neighbor_tid: tuple.neighbor_tid,
            vector: Arc::from(tuple.vector),
        }
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn heap_refs(&self) -> &HeapRefs {
        &self.heap_refs
    }
}

impl GraphNode for PagedElement {
    type Ref = ItemPointer;

    fn pointer(&self) -> ItemPointer {
        self.pointer
    }

    fn level(&self) -> u8 {
        self.level
    }

    fn vector(&self) -> &[f32] {
        &self.vector
    }

    fn is_live(&self) -> bool {
        self.state == ElementState::Live
    }
}

/// Borrowed view of an index's pages as a graph.
pub(crate) struct PagedGraph<'a> {
    store: &'a PageStore,
    m: usize,
    metric: &'a dyn VectorMetric,
}

impl<'a> PagedGraph<'a> {
    pub(crate) fn new(store: &'a PageStore, m: usize, metric: &'a dyn VectorMetric) -> Self {
        Self { store, m, metric }
    }

    /// Load an element in any state, reclaimed slots included.
    pub(crate) fn load_any(&self, pointer: ItemPointer) -> HnswResult<PagedElement> {
        let page = self.store.read_page(pointer.page)?;
        let item = page
            .item(pointer.offset)
            .ok_or_else(|| invalid_tuple(pointer, "no item at this offset"))?;
        if TupleKind::of(item) != Some(TupleKind::Element) {
            return Err(invalid_tuple(pointer, "expected an element tuple"));
        }
        let tuple = ElementTuple::decode(item)?;
        Ok(PagedElement::from_tuple(pointer, tuple))
    }

    /// Neighbor tuple of `element`, or `None` when the slot was reused since
    /// `element` was read.
    pub(crate) fn neighbor_tuple(
        &self,
        element: &PagedElement,
    ) -> HnswResult<Option<NeighborTuple>> {
        let tid = element.neighbor_tid;
        let page = self.store.read_page(tid.page)?;
        let item = page
            .item(tid.offset)
            .ok_or_else(|| invalid_tuple(tid, "no neighbor tuple at this offset"))?;
        let tuple = NeighborTuple::decode(item)?;
        if tuple.version != element.version {
            return Ok(None);
        }
        check_slot_count(&tuple, element, self.m)?;
        Ok(Some(tuple))
    }
}

impl GraphAccess for PagedGraph<'_> {
    type Node = PagedElement;

    fn m(&self) -> usize {
        self.m
    }

    fn metric(&self) -> &dyn VectorMetric {
        self.metric
    }

    fn load(&self, pointer: ItemPointer) -> HnswResult<Option<PagedElement>> {
        let element = self.load_any(pointer)?;
        if element.state == ElementState::Reclaimable {
            return Ok(None);
        }
        Ok(Some(element))
    }

    fn neighbors(&self, node: &PagedElement, layer: u8) -> HnswResult<Vec<ItemPointer>> {
        if layer > node.level {
            return Ok(Vec::new());
        }
        Ok(self
            .neighbor_tuple(node)?
            .map(|tuple| tuple.layer(node.level, layer, self.m))
            .unwrap_or_default())
    }
}

pub(crate) fn check_slot_count(
    tuple: &NeighborTuple,
    element: &PagedElement,
    m: usize,
) -> HnswResult<()> {
    let expected = (element.level as usize + 2) * m;
    if tuple.slots.len() != expected {
        return Err(invalid_tuple(
            element.neighbor_tid,
            &format!(
                "neighbor tuple has {} slots, level {} needs {expected}",
                tuple.slots.len(),
                element.level
            ),
        ));
    }
    Ok(())
}

pub(crate) fn invalid_tuple(pointer: ItemPointer, reason: &str) -> HnswError {
    tracing::error!("[index] structural violation at {pointer}: {reason}");
    HnswError::InvalidTuple {
        pointer,
        reason: reason.to_string(),
    }
}

/// How the entry point may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryUpdate {
    /// Only install an element whose level exceeds the current entry point.
    Greater,
    /// Install unconditionally, `None` included.
    Always,
}

pub(crate) fn read_metadata(store: &PageStore) -> HnswResult<Metadata> {
    let page = store.read_page(PageRef::METADATA)?;
    let item = page.item(0).ok_or_else(|| {
        tracing::error!("[index] metapage holds no metadata item");
        HnswError::Corrupted {
            reason: "metapage holds no metadata item".to_string(),
        }
    })?;
    Ok(Metadata::decode(item)?)
}

/// Write the metadata item, creating it on an empty metapage.
pub(crate) fn write_metadata(store: &PageStore, metadata: &Metadata) -> HnswResult<()> {
    let mut page = store.write_page(PageRef::METADATA)?;
    if page.item_count() == 0 {
        page.add_item(PageRef::METADATA, metadata.encode())?;
    } else {
        page.overwrite_item(PageRef::METADATA, 0, metadata.encode())?;
    }
    store.commit(&[&page])?;
    Ok(())
}

/// Read-modify-write of the metadata under the metapage lock. `change`
/// returns whether it modified anything; unchanged metadata is not written.
fn modify_metadata(
    store: &PageStore,
    change: impl FnOnce(&mut Metadata) -> bool,
) -> HnswResult<bool> {
    let mut page = store.write_page(PageRef::METADATA)?;
    let item = page.item(0).ok_or_else(|| HnswError::Corrupted {
        reason: "metapage holds no metadata item".to_string(),
    })?;
    let mut metadata = Metadata::decode(item)?;
    if !change(&mut metadata) {
        return Ok(false);
    }
    page.overwrite_item(PageRef::METADATA, 0, metadata.encode())?;
    store.commit(&[&page])?;
    Ok(true)
}

/// Returns whether the entry point changed.
pub(crate) fn update_entry_point(
    store: &PageStore,
    entry: Option<EntryPoint>,
    mode: EntryUpdate,
) -> HnswResult<bool> {
    modify_metadata(store, |metadata| {
        let install = match mode {
            EntryUpdate::Always => metadata.entry != entry,
            EntryUpdate::Greater => match (entry, metadata.entry) {
                (Some(new), Some(current)) => new.level > current.level,
                (Some(_), None) => true,
                (None, _) => false,
            },
        };
        if install {
            metadata.entry = entry;
        }
        install
    })
}

pub(crate) fn set_insert_page(store: &PageStore, page: PageRef) -> HnswResult<()> {
    modify_metadata(store, |metadata| {
        let changed = metadata.insert_page != page;
        metadata.insert_page = page;
        changed
    })?;
    Ok(())
}
