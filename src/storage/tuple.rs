//! Element and neighbor tuple codec.
//!
//! # Element tuple
//!
//! ```text
//! [type:1][level:1][state:1][version:1]
//! [heap refs: 10 x u64]            0 marks an unused slot
//! [neighbor tid: page u32, offset u16, pad 2]
//! [dimensions: u32]
//! [vector: dimensions x f32]
//! ```
//!
//! # Neighbor tuple
//!
//! ```text
//! [type:1][version:1][count:u16]
//! [pointers: count x (page u32, offset u16)]
//! ```
//!
//! For an element of level `L` the neighbor tuple holds `(L + 2) * m` slots.
//! Layer `lc` occupies `layer_capacity(lc)` slots starting at `(L - lc) * m`,
//! so the layer 0 block (capacity `2m`) sits at the end. All integers are
//! little-endian.

use super::page::{MAX_ITEM_SIZE, PageRef};
use crate::error::{StorageError, StorageResult};
use crate::hnsw::layer_capacity;
use crate::types::{ElementState, HeapRefs, MAX_HEAP_REFS, RowId};
use std::fmt;
use std::ops::Range;

/// Size of an encoded item pointer.
pub const ITEM_POINTER_SIZE: usize = 6;

/// Fixed prefix of an element tuple, before the vector data.
pub const ELEMENT_PREFIX_SIZE: usize = 4 + MAX_HEAP_REFS * 8 + 8 + 4;

/// Fixed prefix of a neighbor tuple, before the pointers.
pub const NEIGHBOR_HEADER_SIZE: usize = 4;

const ELEMENT_TUPLE_TYPE: u8 = 1;
const NEIGHBOR_TUPLE_TYPE: u8 = 2;

/// Location of an item: page plus line pointer offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemPointer {
    pub page: PageRef,
    pub offset: u16,
}

impl ItemPointer {
    #[must_use]
    pub const fn new(page: PageRef, offset: u16) -> Self {
        Self { page, offset }
    }

    pub(crate) fn encode(pointer: Option<ItemPointer>, out: &mut Vec<u8>) {
        match pointer {
            Some(p) => {
                out.extend_from_slice(&p.page.get().to_le_bytes());
                out.extend_from_slice(&p.offset.to_le_bytes());
            }
            None => {
                out.extend_from_slice(&u32::MAX.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes());
            }
        }
    }

    pub(crate) fn decode(bytes: &[u8]) -> Option<ItemPointer> {
        let page = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let offset = u16::from_le_bytes([bytes[4], bytes[5]]);
        PageRef::decode_link(page).map(|page| ItemPointer { page, offset })
    }
}

impl fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.page, self.offset)
    }
}

/// Kind of tuple stored in a page item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleKind {
    Element,
    Neighbor,
}

impl TupleKind {
    /// Classify an item by its leading type byte.
    pub fn of(item: &[u8]) -> Option<Self> {
        match item.first() {
            Some(&ELEMENT_TUPLE_TYPE) => Some(Self::Element),
            Some(&NEIGHBOR_TUPLE_TYPE) => Some(Self::Neighbor),
            _ => None,
        }
    }
}

/// Encoded size of an element tuple with the given dimensions.
pub const fn element_tuple_size(dimensions: usize) -> usize {
    ELEMENT_PREFIX_SIZE + dimensions * 4
}

/// Encoded size of the neighbor tuple for an element of `level`.
pub const fn neighbor_tuple_size(level: u8, m: usize) -> usize {
    NEIGHBOR_HEADER_SIZE + (level as usize + 2) * m * ITEM_POINTER_SIZE
}

/// Largest dimension count whose element tuple fits on one page.
pub const fn max_dimensions() -> usize {
    (MAX_ITEM_SIZE - ELEMENT_PREFIX_SIZE) / 4
}

/// Element tuple without the vector data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub level: u8,
    pub state: ElementState,
    pub version: u8,
    pub heap_refs: HeapRefs,
    pub neighbor_tid: ItemPointer,
    pub dimensions: u32,
}

impl ElementHeader {
    /// Parse the fixed prefix of an element tuple.
    pub fn peek(item: &[u8]) -> StorageResult<Self> {
        if TupleKind::of(item) != Some(TupleKind::Element) {
            return Err(malformed("item is not an element tuple"));
        }
        if item.len() < ELEMENT_PREFIX_SIZE {
            return Err(malformed(format!(
                "element tuple is {} bytes, prefix needs {ELEMENT_PREFIX_SIZE}",
                item.len()
            )));
        }

        let state = ElementState::from_u8(item[2])
            .ok_or_else(|| malformed(format!("unknown element state {}", item[2])))?;

        let refs_end = 4 + MAX_HEAP_REFS * 8;
        let heap_refs = HeapRefs::from_slots(item[4..refs_end].chunks_exact(8).map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            RowId::from_bytes(raw)
        }));

        let neighbor_tid = ItemPointer::decode(&item[refs_end..refs_end + ITEM_POINTER_SIZE])
            .ok_or_else(|| malformed("element tuple has no neighbor tuple pointer"))?;

        let dims_at = refs_end + 8;
        let dimensions = u32::from_le_bytes([
            item[dims_at],
            item[dims_at + 1],
            item[dims_at + 2],
            item[dims_at + 3],
        ]);

        Ok(Self {
            level: item[1],
            state,
            version: item[3],
            heap_refs,
            neighbor_tid,
            dimensions,
        })
    }

    pub fn is_live(&self) -> bool {
        self.state == ElementState::Live
    }
}

/// One graph element as stored on a page.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTuple {
    pub level: u8,
    pub state: ElementState,
    pub version: u8,
    pub heap_refs: HeapRefs,
    pub neighbor_tid: ItemPointer,
    pub vector: Vec<f32>,
}

impl ElementTuple {
    pub fn header(&self) -> ElementHeader {
        ElementHeader {
            level: self.level,
            state: self.state,
            version: self.version,
            heap_refs: self.heap_refs,
            neighbor_tid: self.neighbor_tid,
            dimensions: self.vector.len() as u32,
        }
    }

    pub fn encoded_size(&self) -> usize {
        element_tuple_size(self.vector.len())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        out.push(ELEMENT_TUPLE_TYPE);
        out.push(self.level);
        out.push(self.state.as_u8());
        out.push(self.version);
        for slot in self.heap_refs.slots() {
            out.extend_from_slice(&slot.map_or(0, |row| row.get()).to_le_bytes());
        }
        ItemPointer::encode(Some(self.neighbor_tid), &mut out);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&(self.vector.len() as u32).to_le_bytes());
        for value in &self.vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(item: &[u8]) -> StorageResult<Self> {
        let header = ElementHeader::peek(item)?;
        let dims = header.dimensions as usize;
        if item.len() != element_tuple_size(dims) {
            return Err(malformed(format!(
                "element tuple with {dims} dimensions is {} bytes",
                item.len()
            )));
        }
        let vector = item[ELEMENT_PREFIX_SIZE..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self {
            level: header.level,
            state: header.state,
            version: header.version,
            heap_refs: header.heap_refs,
            neighbor_tid: header.neighbor_tid,
            vector,
        })
    }
}

/// Neighbor pointers of one element, all layers in one tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborTuple {
    pub version: u8,
    pub slots: Vec<Option<ItemPointer>>,
}

impl NeighborTuple {
    /// Empty tuple sized for an element of `level`.
    pub fn empty(level: u8, m: usize, version: u8) -> Self {
        Self {
            version,
            slots: vec![None; (level as usize + 2) * m],
        }
    }

    /// Build a tuple from per-layer neighbor lists, index 0 being layer 0.
    pub fn from_layers(level: u8, m: usize, version: u8, layers: &[Vec<ItemPointer>]) -> Self {
        let mut tuple = Self::empty(level, m, version);
        for (lc, neighbors) in layers.iter().enumerate().take(level as usize + 1) {
            let range = layer_slots(level, lc as u8, m);
            for (slot, pointer) in tuple.slots[range].iter_mut().zip(neighbors) {
                *slot = Some(*pointer);
            }
        }
        tuple
    }

    /// Neighbors stored for layer `lc`, stopping at the first empty slot.
    pub fn layer(&self, level: u8, lc: u8, m: usize) -> Vec<ItemPointer> {
        let range = layer_slots(level, lc, m);
        self.slots
            .get(range)
            .unwrap_or(&[])
            .iter()
            .map_while(|slot| *slot)
            .collect()
    }

    pub fn encoded_size(&self) -> usize {
        NEIGHBOR_HEADER_SIZE + self.slots.len() * ITEM_POINTER_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        out.push(NEIGHBOR_TUPLE_TYPE);
        out.push(self.version);
        out.extend_from_slice(&(self.slots.len() as u16).to_le_bytes());
        for slot in &self.slots {
            ItemPointer::encode(*slot, &mut out);
        }
        out
    }

    pub fn decode(item: &[u8]) -> StorageResult<Self> {
        if TupleKind::of(item) != Some(TupleKind::Neighbor) {
            return Err(malformed("item is not a neighbor tuple"));
        }
        if item.len() < NEIGHBOR_HEADER_SIZE {
            return Err(malformed("neighbor tuple shorter than its header"));
        }
        let count = u16::from_le_bytes([item[2], item[3]]) as usize;
        if item.len() != NEIGHBOR_HEADER_SIZE + count * ITEM_POINTER_SIZE {
            return Err(malformed(format!(
                "neighbor tuple with {count} slots is {} bytes",
                item.len()
            )));
        }
        let slots = item[NEIGHBOR_HEADER_SIZE..]
            .chunks_exact(ITEM_POINTER_SIZE)
            .map(ItemPointer::decode)
            .collect();
        Ok(Self {
            version: item[1],
            slots,
        })
    }
}

/// Slot range occupied by layer `lc` in the neighbor tuple of a `level`
/// element.
pub fn layer_slots(level: u8, lc: u8, m: usize) -> Range<usize> {
    let start = (level as usize).saturating_sub(lc as usize) * m;
    start..start + layer_capacity(lc, m)
}

fn malformed(reason: impl Into<String>) -> StorageError {
    StorageError::MalformedTuple {
        reason: reason.into(),
    }
}
