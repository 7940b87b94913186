//! Index metadata stored as the only item on page 0.

use super::page::PageRef;
use super::tuple::{ITEM_POINTER_SIZE, ItemPointer};
use crate::error::{StorageError, StorageResult};
use crate::metric::MetricKind;

/// Magic number identifying an index metapage.
pub const META_MAGIC: u32 = 0xA953_A953;

/// Current metapage format version.
pub const META_VERSION: u32 = 1;

const META_SIZE: usize = 4 + 4 + 4 + 2 + 2 + 1 + 1 + ITEM_POINTER_SIZE + 1 + 4;

/// Entry point of the graph: the element with the highest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub pointer: ItemPointer,
    pub level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub dimensions: u32,
    pub m: u16,
    pub ef_construction: u16,
    pub metric: MetricKind,
    pub entry: Option<EntryPoint>,
    /// First page that may still have room for a new element.
    pub insert_page: PageRef,
}

impl Metadata {
    pub fn new(dimensions: u32, m: u16, ef_construction: u16, metric: MetricKind) -> Self {
        Self {
            dimensions,
            m,
            ef_construction,
            metric,
            entry: None,
            insert_page: PageRef::HEAD,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_SIZE);
        out.extend_from_slice(&META_MAGIC.to_le_bytes());
        out.extend_from_slice(&META_VERSION.to_le_bytes());
        out.extend_from_slice(&self.dimensions.to_le_bytes());
        out.extend_from_slice(&self.m.to_le_bytes());
        out.extend_from_slice(&self.ef_construction.to_le_bytes());
        out.push(self.metric.tag());
        out.push(u8::from(self.entry.is_some()));
        ItemPointer::encode(self.entry.map(|e| e.pointer), &mut out);
        out.push(self.entry.map_or(0, |e| e.level));
        out.extend_from_slice(&self.insert_page.get().to_le_bytes());
        out
    }

    pub fn decode(item: &[u8]) -> StorageResult<Self> {
        if item.len() != META_SIZE {
            return Err(invalid(format!(
                "metapage item is {} bytes, expected {META_SIZE}",
                item.len()
            )));
        }
        let u32_at =
            |at: usize| u32::from_le_bytes([item[at], item[at + 1], item[at + 2], item[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([item[at], item[at + 1]]);

        let magic = u32_at(0);
        if magic != META_MAGIC {
            return Err(invalid(format!("bad magic {magic:#010x}")));
        }
        let version = u32_at(4);
        if version != META_VERSION {
            return Err(invalid(format!(
                "unsupported format version {version} (expected {META_VERSION})"
            )));
        }
        let metric = MetricKind::from_tag(item[16])
            .ok_or_else(|| invalid(format!("unknown metric tag {}", item[16])))?;

        let entry = if item[17] != 0 {
            let pointer = ItemPointer::decode(&item[18..18 + ITEM_POINTER_SIZE])
                .ok_or_else(|| invalid("entry point flag set without a pointer".to_string()))?;
            Some(EntryPoint {
                pointer,
                level: item[24],
            })
        } else {
            None
        };

        Ok(Self {
            dimensions: u32_at(8),
            m: u16_at(12),
            ef_construction: u16_at(14),
            metric,
            entry,
            insert_page: PageRef::new(u32_at(25)),
        })
    }
}

fn invalid(reason: String) -> StorageError {
    StorageError::InvalidPage {
        page: PageRef::METADATA,
        reason,
    }
}
