//! Fixed-size slotted pages.
//!
//! # Page Format
//!
//! Every page is exactly [`PAGE_SIZE`] bytes on disk:
//! - Header (16 bytes): magic, item count, next page link, reserved
//! - Line pointers: `(offset: u16, length: u16)` per item
//! - Item data, packed in item order after the line pointers
//!
//! Items are never removed, only overwritten in place, so an item offset is
//! a stable address for the lifetime of the page.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one line pointer in bytes.
pub const LINE_POINTER_SIZE: usize = 4;

/// Largest single item a page can hold.
pub const MAX_ITEM_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - LINE_POINTER_SIZE;

/// Magic value identifying index pages.
const PAGE_MAGIC: u16 = 0xFF90;

/// Encoded value of an absent page link.
const NO_PAGE: u32 = u32::MAX;

/// Page number within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRef(u32);

impl PageRef {
    /// Page holding the index metadata.
    pub const METADATA: PageRef = PageRef(0);

    /// First element page of the chain.
    pub const HEAD: PageRef = PageRef(1);

    #[must_use]
    pub const fn new(page: u32) -> Self {
        Self(page)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    pub(crate) fn index(&self) -> usize {
        self.0 as usize
    }

    pub(crate) fn encode_link(link: Option<PageRef>) -> u32 {
        link.map_or(NO_PAGE, |p| p.0)
    }

    pub(crate) fn decode_link(raw: u32) -> Option<PageRef> {
        (raw != NO_PAGE).then_some(PageRef(raw))
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// In-memory image of one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    next: Option<PageRef>,
    items: Vec<Vec<u8>>,
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next page in the element chain.
    pub fn next(&self) -> Option<PageRef> {
        self.next
    }

    pub fn set_next(&mut self, next: Option<PageRef>) {
        self.next = next;
    }

    pub fn item_count(&self) -> u16 {
        self.items.len() as u16
    }

    pub fn item(&self, offset: u16) -> Option<&[u8]> {
        self.items.get(offset as usize).map(Vec::as_slice)
    }

    pub fn items(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.items
            .iter()
            .enumerate()
            .map(|(offset, item)| (offset as u16, item.as_slice()))
    }

    /// Bytes still available for items and their line pointers.
    pub fn free_space(&self) -> usize {
        let used: usize = self
            .items
            .iter()
            .map(|item| item.len() + LINE_POINTER_SIZE)
            .sum();
        PAGE_SIZE.saturating_sub(PAGE_HEADER_SIZE + used)
    }

    /// Whether items of the given sizes fit as new items.
    pub fn can_fit(&self, sizes: &[usize]) -> bool {
        let needed: usize = sizes.iter().map(|size| size + LINE_POINTER_SIZE).sum();
        self.free_space() >= needed
    }

    /// Appends an item, returning its offset.
    pub fn add_item(&mut self, page: PageRef, item: Vec<u8>) -> StorageResult<u16> {
        if !self.can_fit(&[item.len()]) {
            return Err(StorageError::PageOverflow {
                page,
                needed: item.len() + LINE_POINTER_SIZE,
                free: self.free_space(),
            });
        }
        if self.items.len() >= u16::MAX as usize {
            return Err(StorageError::PageOverflow {
                page,
                needed: item.len(),
                free: 0,
            });
        }
        self.items.push(item);
        Ok(self.item_count() - 1)
    }

    /// Replaces an existing item. The new item may grow into free space.
    pub fn overwrite_item(
        &mut self,
        page: PageRef,
        offset: u16,
        item: Vec<u8>,
    ) -> StorageResult<()> {
        let free = self.free_space();
        let slot = self
            .items
            .get_mut(offset as usize)
            .ok_or(StorageError::ItemOutOfRange { page, offset })?;
        if item.len() > slot.len() + free {
            return Err(StorageError::PageOverflow {
                page,
                needed: item.len(),
                free: slot.len() + free,
            });
        }
        *slot = item;
        Ok(())
    }

    /// Serializes the page into exactly [`PAGE_SIZE`] bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend_from_slice(&PAGE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&self.item_count().to_le_bytes());
        bytes.extend_from_slice(&PageRef::encode_link(self.next).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);

        let mut offset = PAGE_HEADER_SIZE + self.items.len() * LINE_POINTER_SIZE;
        for item in &self.items {
            bytes.extend_from_slice(&(offset as u16).to_le_bytes());
            bytes.extend_from_slice(&(item.len() as u16).to_le_bytes());
            offset += item.len();
        }
        for item in &self.items {
            bytes.extend_from_slice(item);
        }
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    /// Parses a page image produced by [`Page::encode`].
    ///
    /// An all-zero image decodes as an empty page (freshly extended file).
    pub fn decode(page: PageRef, bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(StorageError::InvalidPage {
                page,
                reason: format!("expected {PAGE_SIZE} bytes, found {}", bytes.len()),
            });
        }
        if bytes.iter().all(|b| *b == 0) {
            return Ok(Self::new());
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != PAGE_MAGIC {
            return Err(StorageError::InvalidPage {
                page,
                reason: format!("bad magic {magic:#06x}"),
            });
        }
        let count = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let next = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let pointers_end = PAGE_HEADER_SIZE + count * LINE_POINTER_SIZE;
        if pointers_end > PAGE_SIZE {
            return Err(StorageError::InvalidPage {
                page,
                reason: format!("{count} line pointers overflow the page"),
            });
        }

        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            let base = PAGE_HEADER_SIZE + i * LINE_POINTER_SIZE;
            let start = u16::from_le_bytes([bytes[base], bytes[base + 1]]) as usize;
            let len = u16::from_le_bytes([bytes[base + 2], bytes[base + 3]]) as usize;
            if start < pointers_end || start + len > PAGE_SIZE {
                return Err(StorageError::InvalidPage {
                    page,
                    reason: format!("item {i} spans {start}..{} outside the page", start + len),
                });
            }
            items.push(bytes[start..start + len].to_vec());
        }

        Ok(Self {
            next: PageRef::decode_link(next),
            items,
        })
    }
}
