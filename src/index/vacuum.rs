//! Vacuum: drop deleted rows, repair the graph around elements that lost
//! all of them, then free their slots.
//!
//! The three passes each walk the page chain once:
//!
//! 1. Remove heap refs the caller reports deleted. Elements left without
//!    rows become tombstones; they stay linked so concurrent searches can
//!    still route through them.
//! 2. Re-attach every live element whose neighbor tuple points at a
//!    tombstone, replacing the entry point first if it was tombstoned.
//!    With `vacuum.repair_unfilled` set, elements whose layer-0 list is
//!    below capacity are re-attached too, even when nothing was deleted.
//! 3. Mark the tombstones reclaimable, which makes their slots available
//!    to later inserts.

use super::paged::{EntryUpdate, PagedGraph, invalid_tuple, set_insert_page, update_entry_point};
use super::{HnswIndex, IndexInner};
use crate::error::HnswResult;
use crate::hnsw::{Candidate, GraphAccess, GraphNode, SearchContext, find_element_neighbors};
use crate::storage::{
    ElementHeader, ElementTuple, EntryPoint, ItemPointer, NeighborTuple, PageRef, PageWrite,
    TupleKind,
};
use crate::types::{ElementState, RowId};
use std::collections::HashSet;

/// What one vacuum run changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VacuumStats {
    /// Heap refs removed from elements.
    pub rows_removed: usize,
    /// Elements that lost their last row in this run.
    pub tombstoned: usize,
    /// Live elements whose neighbors were recomputed.
    pub repaired: usize,
    /// Tombstones turned into reusable slots.
    pub reclaimed: usize,
    pub entry_point_replaced: bool,
    /// Pages visited by the first pass.
    pub pages_scanned: usize,
}

/// State carried from the first pass into the others.
#[derive(Debug, Default)]
struct Tombstones {
    deleted: HashSet<ItemPointer>,
    /// Highest-level surviving element other than the entry point.
    highest_point: Option<EntryPoint>,
}

impl HnswIndex {
    /// Remove every row for which `is_deleted` returns true and clean up the
    /// graph. Safe to run alongside inserts and scans; a second run with no
    /// intervening change does nothing.
    pub fn vacuum(&self, is_deleted: impl Fn(RowId) -> bool) -> HnswResult<VacuumStats> {
        let inner = &self.inner;
        let mut stats = VacuumStats::default();

        let tombstones = inner.remove_heap_refs(&is_deleted, &mut stats)?;
        tracing::info!(
            "[vacuum] removed {} rows over {} pages, {} elements to repair around",
            stats.rows_removed,
            stats.pages_scanned,
            tombstones.deleted.len()
        );

        let repair_unfilled = inner.settings.vacuum.repair_unfilled;
        if tombstones.deleted.is_empty() && !repair_unfilled {
            return Ok(stats);
        }

        inner.repair_graph(&tombstones, &mut stats)?;
        tracing::info!(
            "[vacuum] repaired {} elements, entry point replaced: {}",
            stats.repaired,
            stats.entry_point_replaced
        );

        if tombstones.deleted.is_empty() {
            return Ok(stats);
        }
        inner.mark_reclaimable(&tombstones, &mut stats)?;
        tracing::info!("[vacuum] reclaimed {} element slots", stats.reclaimed);

        Ok(stats)
    }
}

impl IndexInner {
    /// Check for cancellation every `check_interval` pages.
    fn vacuum_checkpoint(&self, pages: usize) -> HnswResult<()> {
        if pages % self.settings.vacuum.check_interval.max(1) == 0 {
            self.interrupt.check()?;
        }
        Ok(())
    }

    fn remove_heap_refs(
        &self,
        is_deleted: &dyn Fn(RowId) -> bool,
        stats: &mut VacuumStats,
    ) -> HnswResult<Tombstones> {
        let entry = self.metadata()?.entry.map(|entry| entry.pointer);
        let mut tombstones = Tombstones::default();
        let mut current = Some(PageRef::HEAD);

        while let Some(page_ref) = current {
            self.vacuum_checkpoint(stats.pages_scanned)?;
            let mut page = self.store.write_page(page_ref)?;

            let mut headers = Vec::new();
            for (offset, item) in page.items() {
                if TupleKind::of(item) == Some(TupleKind::Element) {
                    headers.push((offset, ElementHeader::peek(item)?));
                }
            }

            let mut updated = false;
            for (offset, mut header) in headers {
                let pointer = ItemPointer::new(page_ref, offset);
                match header.state {
                    ElementState::Reclaimable => continue,
                    ElementState::Live => {
                        let mut refs = header.heap_refs;
                        let dropped = refs.retain(|row| !is_deleted(row));
                        if dropped > 0 {
                            let item = page
                                .item(offset)
                                .ok_or_else(|| invalid_tuple(pointer, "no item at this offset"))?;
                            let mut tuple = ElementTuple::decode(item)?;
                            tuple.heap_refs = refs;
                            if refs.is_empty() {
                                tuple.state = ElementState::Tombstoned;
                                stats.tombstoned += 1;
                            }
                            page.overwrite_item(page_ref, offset, tuple.encode())?;
                            stats.rows_removed += dropped;
                            header.state = tuple.state;
                            updated = true;
                        }
                    }
                    ElementState::Tombstoned => {}
                }

                if header.state == ElementState::Tombstoned {
                    tombstones.deleted.insert(pointer);
                } else if Some(pointer) != entry
                    && tombstones
                        .highest_point
                        .is_none_or(|highest| header.level > highest.level)
                {
                    tombstones.highest_point = Some(EntryPoint {
                        pointer,
                        level: header.level,
                    });
                }
            }

            if updated {
                self.store.commit(&[&page])?;
            }
            stats.pages_scanned += 1;
            current = page.next();
        }
        Ok(tombstones)
    }

    fn repair_graph(&self, tombstones: &Tombstones, stats: &mut VacuumStats) -> HnswResult<()> {
        let graph = self.graph();

        // Let inserts that may have linked to a fresh tombstone finish.
        drop(self.locks.update_exclusive());

        {
            let _update = self.locks.update_exclusive();
            if let Some(highest) = tombstones.highest_point {
                self.repair_element(&graph, highest.pointer, tombstones, stats)?;
            }
            if let Some(entry) = self.metadata()?.entry {
                if tombstones.deleted.contains(&entry.pointer) {
                    update_entry_point(&self.store, tombstones.highest_point, EntryUpdate::Always)?;
                    stats.entry_point_replaced = true;
                    tracing::debug!(
                        "[vacuum] entry point {} tombstoned, replaced by {:?}",
                        entry.pointer,
                        tombstones.highest_point
                    );
                } else {
                    self.repair_element(&graph, entry.pointer, tombstones, stats)?;
                }
            }
        }

        let mut current = Some(PageRef::HEAD);
        let mut pages = 0;
        while let Some(page_ref) = current {
            self.vacuum_checkpoint(pages)?;
            let (live, next) = {
                let page = self.store.read_page(page_ref)?;
                let mut live = Vec::new();
                for (offset, item) in page.items() {
                    if TupleKind::of(item) == Some(TupleKind::Element)
                        && ElementHeader::peek(item)?.is_live()
                    {
                        live.push(ItemPointer::new(page_ref, offset));
                    }
                }
                (live, page.next())
            };

            for pointer in live {
                let _update = self.locks.update_shared();
                self.repair_element(&graph, pointer, tombstones, stats)?;
            }
            pages += 1;
            current = next;
        }
        Ok(())
    }

    /// Recompute the neighbors of one live element if any point at a
    /// tombstone, or its layer-0 list is short and `repair_unfilled` is set.
    /// The caller holds the update lock.
    fn repair_element(
        &self,
        graph: &PagedGraph<'_>,
        pointer: ItemPointer,
        tombstones: &Tombstones,
        stats: &mut VacuumStats,
    ) -> HnswResult<()> {
        let m = self.options.m;
        let Some(element) = graph.load(pointer)? else {
            return Ok(());
        };
        if !element.is_live() {
            return Ok(());
        }
        let Some(tuple) = graph.neighbor_tuple(&element)? else {
            return Ok(());
        };

        let points_at_tombstone = tuple
            .slots
            .iter()
            .flatten()
            .any(|neighbor| tombstones.deleted.contains(neighbor));
        let unfilled = self.settings.vacuum.repair_unfilled
            && tuple.layer(element.level, 0, m).len() < 2 * m;
        if !points_at_tombstone && !unfilled {
            return Ok(());
        }

        // An element cannot search from itself.
        let entry = match self.metadata()?.entry {
            Some(entry) if entry.pointer == pointer => match tombstones.highest_point {
                Some(highest) if highest.pointer == pointer => return Ok(()),
                highest => highest,
            },
            entry => entry,
        };

        let layers = match entry {
            Some(entry) => {
                let entry_node = graph
                    .load(entry.pointer)?
                    .ok_or_else(|| invalid_tuple(entry.pointer, "entry point is reclaimed"))?;
                let mut ctx = SearchContext::new(Some(&self.interrupt));
                find_element_neighbors(
                    graph,
                    &element.vector,
                    element.level,
                    &entry_node,
                    self.options.ef_construction,
                    Some(pointer),
                    &mut ctx,
                )?
            }
            None => vec![Vec::new(); element.level as usize + 1],
        };

        let pointers: Vec<Vec<ItemPointer>> = layers
            .iter()
            .map(|kept| kept.iter().map(Candidate::pointer).collect())
            .collect();
        let repaired = NeighborTuple::from_layers(element.level, m, element.version, &pointers);

        {
            let tid = element.neighbor_tid;
            let mut page = self.store.write_page(tid.page)?;
            let item = page
                .item(tid.offset)
                .ok_or_else(|| invalid_tuple(tid, "no neighbor tuple at this offset"))?;
            let current = NeighborTuple::decode(item)?;
            if current.version != element.version {
                return Ok(());
            }
            if current != repaired {
                page.overwrite_item(tid.page, tid.offset, repaired.encode())?;
                self.store.commit(&[&page])?;
            }
        }

        self.update_neighbors_on_disk(graph, &element, &layers, true)?;
        update_entry_point(
            &self.store,
            Some(EntryPoint {
                pointer,
                level: element.level,
            }),
            EntryUpdate::Greater,
        )?;

        tracing::trace!("[vacuum] repaired {pointer} at level {}", element.level());
        stats.repaired += 1;
        Ok(())
    }

    fn mark_reclaimable(&self, tombstones: &Tombstones, stats: &mut VacuumStats) -> HnswResult<()> {
        let mut first_freed = None;
        let mut current = Some(PageRef::HEAD);
        let mut pages = 0;

        while let Some(page_ref) = current {
            self.vacuum_checkpoint(pages)?;
            let _scan = self.locks.scan_exclusive();
            let mut page = self.store.write_page(page_ref)?;

            let mut targets = Vec::new();
            for (offset, item) in page.items() {
                if TupleKind::of(item) != Some(TupleKind::Element) {
                    continue;
                }
                let pointer = ItemPointer::new(page_ref, offset);
                if ElementHeader::peek(item)?.state == ElementState::Tombstoned
                    && tombstones.deleted.contains(&pointer)
                {
                    targets.push(offset);
                }
            }

            for offset in targets {
                let pointer = ItemPointer::new(page_ref, offset);
                let item = page
                    .item(offset)
                    .ok_or_else(|| invalid_tuple(pointer, "no item at this offset"))?;
                let mut tuple = ElementTuple::decode(item)?;
                tuple.state = ElementState::Reclaimable;
                tuple.heap_refs.clear();
                tuple.vector.fill(0.0);
                page.overwrite_item(page_ref, offset, tuple.encode())?;

                let tid = tuple.neighbor_tid;
                if tid.page == page_ref {
                    clear_neighbor_slots(&mut page, tid)?;
                    self.store.commit(&[&page])?;
                } else if tid.page > page_ref {
                    let mut neighbor_page = self.store.write_page(tid.page)?;
                    clear_neighbor_slots(&mut neighbor_page, tid)?;
                    self.store.commit(&[&page, &neighbor_page])?;
                } else {
                    return Err(invalid_tuple(tid, "neighbor tuple precedes its element page"));
                }

                stats.reclaimed += 1;
                first_freed.get_or_insert(page_ref);
            }

            pages += 1;
            current = page.next();
        }

        if let Some(page) = first_freed {
            set_insert_page(&self.store, page)?;
        }
        Ok(())
    }
}

/// Empty every slot of the neighbor tuple at `tid`, keeping its size and
/// version.
fn clear_neighbor_slots(page: &mut PageWrite, tid: ItemPointer) -> HnswResult<()> {
    let item = page
        .item(tid.offset)
        .ok_or_else(|| invalid_tuple(tid, "no neighbor tuple at this offset"))?;
    let mut tuple = NeighborTuple::decode(item)?;
    tuple.slots.fill(None);
    page.overwrite_item(tid.page, tid.offset, tuple.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::HnswError;
    use crate::index::{IndexOptions, InsertOutcome};

    fn row(id: u64) -> RowId {
        RowId::new_unchecked(id)
    }

    fn line_index(n: u64) -> HnswIndex {
        let options = IndexOptions::new(1).with_m(4).with_ef_construction(16);
        let index = HnswIndex::in_memory(options, &Settings::default()).unwrap();
        for i in 1..=n {
            index.insert(&[i as f32], row(i)).unwrap();
        }
        index
    }

    fn all_rows(index: &HnswIndex, query: f32) -> Vec<u64> {
        let mut scan = index.begin_scan(200);
        scan.rescan(&[query]).unwrap();
        let mut rows = Vec::new();
        while let Some(row) = scan.next().unwrap() {
            rows.push(row.get());
        }
        rows.sort_unstable();
        rows
    }

    #[test]
    fn test_vacuum_without_deletions_changes_nothing() {
        let index = line_index(20);
        let stats = index.vacuum(|_| false).unwrap();
        assert_eq!(stats.rows_removed, 0);
        assert_eq!(stats.repaired, 0);
        assert_eq!(stats.reclaimed, 0);
        assert!(stats.pages_scanned >= 1);
    }

    #[test]
    fn test_vacuum_removes_rows_and_repairs() {
        let index = line_index(60);
        let stats = index.vacuum(|row| row.get() % 2 == 0).unwrap();

        assert_eq!(stats.rows_removed, 30);
        assert_eq!(stats.tombstoned, 30);
        assert_eq!(stats.reclaimed, 30);
        assert!(stats.repaired > 0);

        let rows = all_rows(&index, 30.0);
        assert!(rows.iter().all(|r| r % 2 == 1), "deleted row returned: {rows:?}");
        assert_eq!(rows.len(), 30);

        let report = index.verify().unwrap();
        assert!(report.is_healthy(), "{:?}", report.violations);
        assert_eq!(report.reclaimable, 30);
    }

    #[test]
    fn test_vacuum_is_idempotent() {
        let index = line_index(40);
        index.vacuum(|row| row.get() % 3 == 0).unwrap();
        let before = index.stats().unwrap();

        let again = index.vacuum(|row| row.get() % 3 == 0).unwrap();
        assert_eq!(again.rows_removed, 0);
        assert_eq!(again.repaired, 0);
        assert_eq!(again.reclaimed, 0);
        assert!(!again.entry_point_replaced);
        assert_eq!(index.stats().unwrap(), before);
    }

    #[test]
    fn test_duplicate_rows_keep_element_alive() {
        let index = line_index(5);
        index.insert(&[3.0], row(30)).unwrap();

        let stats = index.vacuum(|row| row.get() == 3).unwrap();
        assert_eq!(stats.rows_removed, 1);
        assert_eq!(stats.tombstoned, 0);
        assert!(all_rows(&index, 3.0).contains(&30));
    }

    #[test]
    fn test_deleting_entry_point_replaces_it() {
        let index = line_index(50);
        let entry = index.stats().unwrap().entry.unwrap();
        let entry_rows = index.inner.graph().load_any(entry.pointer).unwrap().heap_refs;

        let stats = index.vacuum(|row| entry_rows.contains(row)).unwrap();
        assert!(stats.entry_point_replaced);

        let new_entry = index.stats().unwrap().entry.unwrap();
        assert_ne!(new_entry.pointer, entry.pointer);
        assert!(index.verify().unwrap().is_healthy());
        assert_eq!(all_rows(&index, 25.0).len(), 49);
    }

    #[test]
    fn test_deleting_everything_empties_index() {
        let index = line_index(12);
        let stats = index.vacuum(|_| true).unwrap();
        assert_eq!(stats.reclaimed, 12);
        assert_eq!(index.stats().unwrap().entry, None);
        assert!(index.search(&[4.0], 5).unwrap().is_empty());

        // the index is usable again and reuses the freed slots
        let pages = index.stats().unwrap().pages;
        let outcome = index.insert(&[7.0], row(100)).unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        assert_eq!(index.stats().unwrap().pages, pages);
        assert_eq!(index.search(&[0.0], 1).unwrap()[0].row_id, row(100));
    }

    #[test]
    fn test_reclaimed_slot_is_reused() {
        // four 400-dimension elements fill the head page
        let options = IndexOptions::new(400).with_m(4).with_ef_construction(16);
        let index = HnswIndex::in_memory(options, &Settings::default()).unwrap();
        for i in 1..=4u64 {
            index.insert(&vec![i as f32; 400], row(i)).unwrap();
        }
        let pages = index.stats().unwrap().pages;

        index.vacuum(|row| row.get() == 2).unwrap();
        let outcome = index.insert(&vec![2.5; 400], row(22)).unwrap();
        let InsertOutcome::Inserted(pointer) = outcome else {
            panic!("expected a new element");
        };
        let element = index.inner.graph().load_any(pointer).unwrap();
        assert_eq!(pointer.page, PageRef::HEAD);
        assert_eq!(element.version, 1);
        assert_eq!(element.state(), ElementState::Live);
        assert_eq!(index.stats().unwrap().pages, pages);
        assert!(index.verify().unwrap().is_healthy());
    }

    fn grid_index(settings: &Settings) -> HnswIndex {
        let options = IndexOptions::new(2).with_m(4).with_ef_construction(16);
        let index = HnswIndex::in_memory(options, settings).unwrap();
        for i in 1..=60u64 {
            index.insert(&[(i % 8) as f32, (i / 8) as f32], row(i)).unwrap();
        }
        index
    }

    /// Cut the layer-0 list of the first element down to one neighbor.
    fn detach(index: &HnswIndex) -> ItemPointer {
        let graph = index.inner.graph();
        let pointer = ItemPointer::new(PageRef::HEAD, 0);
        let element = graph.load_any(pointer).unwrap();
        let tuple = graph.neighbor_tuple(&element).unwrap().unwrap();
        let mut layers: Vec<Vec<ItemPointer>> =
            (0..=element.level).map(|lc| tuple.layer(element.level, lc, 4)).collect();
        layers[0].truncate(1);

        let tid = element.neighbor_tid;
        let store = &index.inner.store;
        let mut page = store.write_page(tid.page).unwrap();
        let short = NeighborTuple::from_layers(element.level, 4, element.version, &layers);
        page.overwrite_item(tid.page, tid.offset, short.encode()).unwrap();
        store.commit(&[&page]).unwrap();
        pointer
    }

    fn layer0_len(index: &HnswIndex, pointer: ItemPointer) -> usize {
        let graph = index.inner.graph();
        let element = graph.load_any(pointer).unwrap();
        let tuple = graph.neighbor_tuple(&element).unwrap().unwrap();
        tuple.layer(element.level, 0, 4).len()
    }

    #[test]
    fn test_short_neighbor_list_left_alone_by_default() {
        let index = grid_index(&Settings::default());
        let pointer = detach(&index);

        let stats = index.vacuum(|_| false).unwrap();
        assert_eq!(stats.repaired, 0);
        assert_eq!(layer0_len(&index, pointer), 1);
    }

    #[test]
    fn test_repair_unfilled_reattaches_short_neighbor_list() {
        let mut settings = Settings::default();
        settings.vacuum.repair_unfilled = true;
        let index = grid_index(&settings);
        let pointer = detach(&index);

        let stats = index.vacuum(|_| false).unwrap();
        assert_eq!(stats.rows_removed, 0);
        assert_eq!(stats.reclaimed, 0);
        assert!(stats.repaired >= 1);
        assert!(layer0_len(&index, pointer) > 1);

        let report = index.verify().unwrap();
        assert!(report.is_healthy(), "{:?}", report.violations);
        assert_eq!(report.rows, 60);
        assert_eq!(index.search(&[1.0, 0.0], 1).unwrap()[0].row_id, row(1));
    }

    #[test]
    fn test_vacuum_honors_interrupt() {
        let index = line_index(10);
        index.interrupt().trigger();
        let err = index.vacuum(|_| true).unwrap_err();
        assert!(matches!(err, HnswError::Cancelled));
        index.interrupt().reset();
        assert_eq!(index.vacuum(|_| true).unwrap().reclaimed, 10);
    }
}
