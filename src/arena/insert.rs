//! Element insertion into the build arena.

use super::{Arena, ArenaElement, ArenaEntry, ArenaNode, ArenaRef};
use crate::error::HnswResult;
use crate::hnsw::{
    Candidate, ConnectionUpdate, GraphAccess, GraphNode, Neighbor, NeighborArray, SearchContext,
    find_element_neighbors, layer_capacity, update_connection,
};
use crate::metric::bit_identical;
use crate::types::{HeapRefs, Interrupt, RowId};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::ops::Deref;
use std::sync::Arc;

/// Result of inserting one row into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaInsert {
    /// A new element was created.
    Inserted(ArenaRef),
    /// The row was added to an existing element with an identical vector.
    Duplicate(ArenaRef),
    /// The memory budget is exhausted; nothing was changed.
    Full,
}

/// Entry-point lock held for the duration of one insert.
enum EntryGuard<'a> {
    Shared(RwLockReadGuard<'a, Option<ArenaEntry>>),
    Exclusive(RwLockWriteGuard<'a, Option<ArenaEntry>>),
}

impl Deref for EntryGuard<'_> {
    type Target = Option<ArenaEntry>;

    fn deref(&self) -> &Option<ArenaEntry> {
        match self {
            Self::Shared(guard) => guard,
            Self::Exclusive(guard) => guard,
        }
    }
}

impl Arena {
    /// Insert `vector` for `row` at a freshly drawn level.
    pub fn insert(
        &self,
        vector: Arc<[f32]>,
        row: RowId,
        interrupt: Option<&Interrupt>,
    ) -> HnswResult<ArenaInsert> {
        let level = self.levels.generate();
        self.insert_at_level(vector, row, level, interrupt)
    }

    pub(crate) fn insert_at_level(
        &self,
        vector: Arc<[f32]>,
        row: RowId,
        level: u8,
        interrupt: Option<&Interrupt>,
    ) -> HnswResult<ArenaInsert> {
        if !self.has_room(level) {
            return Ok(ArenaInsert::Full);
        }

        let mut guard = self.lock_entry_shared();
        if guard.is_none_or(|entry| level > entry.level) {
            drop(guard);
            guard = self.lock_entry_exclusive();
        }

        let entry = match *guard {
            Some(entry) => self.load(entry.element)?,
            None => None,
        };

        let mut ctx = SearchContext::new(interrupt);
        let layers = match &entry {
            Some(entry) => find_element_neighbors(
                self,
                &vector,
                level,
                entry,
                self.ef_construction,
                None,
                &mut ctx,
            )?,
            None => vec![Vec::new(); level as usize + 1],
        };

        if let Some(duplicate) = self.absorb_duplicate(&layers[0], &vector, row) {
            return Ok(ArenaInsert::Duplicate(duplicate));
        }

        let arrays = layers
            .iter()
            .enumerate()
            .map(|(lc, kept)| {
                NeighborArray::from_candidates(kept, layer_capacity(lc as u8, self.m))
            })
            .collect();
        let node = ArenaNode::new(vector, level, arrays, HeapRefs::single(row));
        let Some(id) = self.allocate(node) else {
            return Ok(ArenaInsert::Full);
        };

        self.add_back_edges(id, &layers)?;

        if let EntryGuard::Exclusive(mut entry) = guard {
            if entry.is_none_or(|e| level > e.level) {
                *entry = Some(ArenaEntry { element: id, level });
            }
        }

        Ok(ArenaInsert::Inserted(id))
    }

    fn lock_entry_shared(&self) -> EntryGuard<'_> {
        drop(self.wait.lock());
        EntryGuard::Shared(self.entry.read())
    }

    fn lock_entry_exclusive(&self) -> EntryGuard<'_> {
        let _wait = self.wait.lock();
        EntryGuard::Exclusive(self.entry.write())
    }

    /// Attach `row` to the first layer-0 neighbor with a bit-identical
    /// vector and spare capacity. Stops at the first neighbor that differs.
    fn absorb_duplicate(
        &self,
        neighbors: &[Candidate<ArenaElement>],
        vector: &[f32],
        row: RowId,
    ) -> Option<ArenaRef> {
        for candidate in neighbors {
            if !bit_identical(candidate.node.vector(), vector) {
                return None;
            }
            let _lock = self.locks.lock(candidate.pointer());
            let mut refs = candidate.node.node().heap_refs();
            if !refs.push(row) {
                continue;
            }
            candidate.node.node().heap_refs.store(Arc::new(refs));
            return Some(candidate.pointer());
        }
        None
    }

    /// Add `id` to the neighbor lists of the elements it selected.
    fn add_back_edges(
        &self,
        id: ArenaRef,
        layers: &[Vec<Candidate<ArenaElement>>],
    ) -> HnswResult<()> {
        let Some(new_element) = self.load(id)? else {
            return Ok(());
        };

        for (lc, kept) in layers.iter().enumerate() {
            let lc = lc as u8;
            let lm = layer_capacity(lc, self.m);
            for neighbor in kept {
                if neighbor.node.level() < lc {
                    continue;
                }
                let _lock = self.locks.lock(neighbor.pointer());
                let slot = &neighbor.node.node().neighbors[lc as usize];
                let current = slot.load_full();

                let mut existing = Vec::with_capacity(current.len());
                for item in current.iter() {
                    if let Some(node) = self.load(item.element)? {
                        existing.push(Candidate::new(node, item.distance));
                    }
                }

                let new_edge = Candidate::new(new_element.clone(), neighbor.distance);
                let update = update_connection(&existing, new_edge, lm, self.metric());
                if update == ConnectionUpdate::Rejected {
                    continue;
                }

                let mut next = (*current).clone();
                next.apply(
                    update,
                    Neighbor {
                        element: id,
                        distance: neighbor.distance,
                    },
                );
                slot.store(Arc::new(next));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn arena(dimensions: usize, limit: usize) -> Arena {
        Arena::new(dimensions, 4, 32, MetricKind::L2.metric(), limit)
    }

    fn row(id: u64) -> RowId {
        RowId::new_unchecked(id)
    }

    #[test]
    fn test_first_insert_becomes_entry_point() {
        let arena = arena(2, 1 << 20);
        let result = arena
            .insert_at_level(Arc::from(vec![1.0, 2.0]), row(1), 2, None)
            .unwrap();
        assert_eq!(result, ArenaInsert::Inserted(ArenaRef::new(0)));
        assert_eq!(
            arena.entry(),
            Some(ArenaEntry {
                element: ArenaRef::new(0),
                level: 2
            })
        );
    }

    #[test]
    fn test_higher_level_promotes_entry_point() {
        let arena = arena(1, 1 << 20);
        arena.insert_at_level(Arc::from(vec![0.0]), row(1), 0, None).unwrap();
        arena.insert_at_level(Arc::from(vec![1.0]), row(2), 3, None).unwrap();
        arena.insert_at_level(Arc::from(vec![2.0]), row(3), 1, None).unwrap();
        assert_eq!(arena.entry().map(|e| e.element), Some(ArenaRef::new(1)));
    }

    #[test]
    fn test_identical_vectors_collapse() {
        let arena = arena(3, 1 << 20);
        let v: Arc<[f32]> = Arc::from(vec![0.25, 0.5, 0.75]);
        arena.insert_at_level(Arc::clone(&v), row(1), 0, None).unwrap();
        let second = arena.insert_at_level(Arc::clone(&v), row(2), 0, None).unwrap();
        assert_eq!(second, ArenaInsert::Duplicate(ArenaRef::new(0)));
        assert_eq!(arena.len(), 1);

        let refs = arena.elements()[0].heap_refs();
        assert_eq!(refs.iter().collect::<Vec<_>>(), vec![row(1), row(2)]);
    }

    #[test]
    fn test_back_edges_respect_degree_bound() {
        let arena = arena(4, 1 << 24);
        let mut rng = StdRng::seed_from_u64(42);
        for i in 1..=300u64 {
            let v: Vec<f32> = (0..4).map(|_| rng.random::<f32>()).collect();
            arena.insert(Arc::from(v), row(i), None).unwrap();
        }

        for node in arena.elements() {
            for lc in 0..=node.level() {
                assert!(node.neighbors(lc).len() <= layer_capacity(lc, 4));
            }
        }
        // every element after the first is reachable from someone
        let linked = arena
            .elements()
            .iter()
            .filter(|n| !n.neighbors(0).is_empty())
            .count();
        assert_eq!(linked, arena.len());
    }

    #[test]
    fn test_full_arena_changes_nothing() {
        let arena = arena(2, 0);
        let result = arena
            .insert_at_level(Arc::from(vec![1.0, 1.0]), row(1), 0, None)
            .unwrap();
        assert_eq!(result, ArenaInsert::Full);
        assert!(arena.is_empty());
        assert_eq!(arena.entry(), None);
    }
}
