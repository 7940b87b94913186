//! Type-safe wrappers shared by the graph, the storage layer and the index.

use crate::error::{HnswError, HnswResult};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum number of external rows collapsed into one graph element.
pub const MAX_HEAP_REFS: usize = 10;

/// External row identifier attached to an indexed vector.
///
/// Uses `NonZeroU64` so that zero can mark an unused slot on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(NonZeroU64);

impl RowId {
    /// Creates a new `RowId`, returning `None` for zero.
    #[must_use]
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    /// Creates a new `RowId`, panicking if zero.
    ///
    /// # Panics
    /// Panics if `id` is zero. Use `new()` for fallible construction.
    #[must_use]
    pub fn new_unchecked(id: u64) -> Self {
        Self(NonZeroU64::new(id).expect("RowId cannot be zero"))
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// Converts to little-endian bytes for storage.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.get().to_le_bytes()
    }

    /// Creates from little-endian bytes, `None` when the slot is empty.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Option<Self> {
        Self::new(u64::from_le_bytes(bytes))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a graph element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ElementState {
    /// Holds at least one row and is fully linked.
    #[default]
    Live,
    /// Lost all of its rows; still linked until vacuum repairs its neighbors.
    Tombstoned,
    /// Unlinked; the slot may be reused by a later insert.
    Reclaimable,
}

impl ElementState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Live => 0,
            Self::Tombstoned => 1,
            Self::Reclaimable => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Live),
            1 => Some(Self::Tombstoned),
            2 => Some(Self::Reclaimable),
            _ => None,
        }
    }
}

/// Bounded, ordered list of rows mapped to one vector.
///
/// Order is insertion order; scans emit the most recently added row first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapRefs {
    rows: [Option<RowId>; MAX_HEAP_REFS],
    len: u8,
}

impl HeapRefs {
    #[must_use]
    pub fn single(row: RowId) -> Self {
        let mut refs = Self::default();
        refs.rows[0] = Some(row);
        refs.len = 1;
        refs
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_HEAP_REFS
    }

    /// Appends a row; returns false when the list is full.
    pub fn push(&mut self, row: RowId) -> bool {
        if self.is_full() {
            return false;
        }
        self.rows[self.len()] = Some(row);
        self.len += 1;
        true
    }

    pub fn contains(&self, row: RowId) -> bool {
        self.iter().any(|r| r == row)
    }

    /// Keeps the rows for which `keep` returns true, compacting them to the
    /// front. Returns how many rows were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(RowId) -> bool) -> usize {
        let mut kept = [None; MAX_HEAP_REFS];
        let mut len = 0;
        for row in self.iter() {
            if keep(row) {
                kept[len] = Some(row);
                len += 1;
            }
        }
        let dropped = self.len() - len;
        self.rows = kept;
        self.len = len as u8;
        dropped
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = RowId> + '_ {
        self.rows[..self.len()].iter().flatten().copied()
    }

    pub(crate) fn slots(&self) -> &[Option<RowId>; MAX_HEAP_REFS] {
        &self.rows
    }

    /// Rebuilds from on-disk slots, stopping at the first empty slot.
    pub(crate) fn from_slots(slots: impl IntoIterator<Item = Option<RowId>>) -> Self {
        let mut refs = Self::default();
        for row in slots {
            match row {
                Some(row) if refs.push(row) => {}
                _ => break,
            }
        }
        refs
    }
}

/// Cooperative cancellation flag shared between a caller and long-running
/// traversals, builds and vacuum passes.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight work stops at its next check.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear a previous request so the index can be used again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> HnswResult<()> {
        if self.is_triggered() {
            Err(HnswError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_id_rejects_zero() {
        assert!(RowId::new(0).is_none());
        let row = RowId::new(42).unwrap();
        assert_eq!(row.get(), 42);
        assert_eq!(RowId::from_bytes(row.to_bytes()), Some(row));
        assert_eq!(RowId::from_bytes([0; 8]), None);
    }

    #[test]
    fn test_heap_refs_capacity() {
        let mut refs = HeapRefs::default();
        for i in 1..=MAX_HEAP_REFS as u64 {
            assert!(refs.push(RowId::new_unchecked(i)));
        }
        assert!(refs.is_full());
        assert!(!refs.push(RowId::new_unchecked(99)));
        assert_eq!(refs.len(), MAX_HEAP_REFS);
    }

    #[test]
    fn test_heap_refs_retain_compacts() {
        let mut refs = HeapRefs::default();
        for i in 1..=5 {
            refs.push(RowId::new_unchecked(i));
        }
        let dropped = refs.retain(|r| r.get() % 2 == 1);
        assert_eq!(dropped, 2);
        let rows: Vec<u64> = refs.iter().map(|r| r.get()).collect();
        assert_eq!(rows, vec![1, 3, 5]);
        assert_eq!(refs.slots()[3], None);
    }

    #[test]
    fn test_heap_refs_from_slots_stops_at_gap() {
        let refs = HeapRefs::from_slots([
            RowId::new(7),
            None,
            RowId::new(9),
        ]);
        assert_eq!(refs.len(), 1);
        assert!(refs.contains(RowId::new_unchecked(7)));
    }

    #[test]
    fn test_element_state_round_trip() {
        for state in [
            ElementState::Live,
            ElementState::Tombstoned,
            ElementState::Reclaimable,
        ] {
            assert_eq!(ElementState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(ElementState::from_u8(9), None);
    }

    #[test]
    fn test_interrupt_is_shared() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(interrupt.check().is_ok());
        clone.trigger();
        assert!(matches!(interrupt.check(), Err(HnswError::Cancelled)));
        interrupt.reset();
        assert!(!clone.is_triggered());
    }
}
