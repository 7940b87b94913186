//! Page store: in-memory page frames with per-page locks over a durable
//! backend.
//!
//! Pages are cached as `Arc<RwLock<Page>>` frames. Readers and writers lock a
//! single page through [`PageRead`] / [`PageWrite`] guards that own their
//! frame, so a guard can outlive the borrow of the store's frame table.
//! Changes become durable only through [`PageStore::commit`], which hands
//! every registered page to the backend as one atomic unit.
//!
//! Callers that hold several page locks at once take them in ascending page
//! order.

use super::page::{PAGE_SIZE, Page, PageRef};
use crate::error::{StorageError, StorageResult};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, MutexGuard, RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable home of the page images.
pub trait PageBackend: Send + Sync {
    /// Read every stored page image, in page order.
    fn load(&self) -> StorageResult<Vec<Vec<u8>>>;

    /// Persist the given page images atomically.
    fn persist(&self, pages: &[(PageRef, Vec<u8>)]) -> StorageResult<()>;

    /// Flush everything persisted so far to stable storage.
    fn sync(&self) -> StorageResult<()>;
}

/// Backend that keeps committed page images in memory.
///
/// Clones share the same images, so a clone can reopen a store and observe
/// exactly what was committed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    images: Arc<Mutex<Vec<Vec<u8>>>>,
    commits: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl PageBackend for MemoryBackend {
    fn load(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.images.lock().clone())
    }

    fn persist(&self, pages: &[(PageRef, Vec<u8>)]) -> StorageResult<()> {
        let mut images = self.images.lock();
        for (page, bytes) in pages {
            let index = page.index();
            if images.len() <= index {
                images.resize(index + 1, vec![0; PAGE_SIZE]);
            }
            images[index].clone_from(bytes);
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Shared lock on one page.
pub struct PageRead {
    page: PageRef,
    guard: ArcRwLockReadGuard<RawRwLock, Page>,
}

impl PageRead {
    pub fn page_ref(&self) -> PageRef {
        self.page
    }
}

impl Deref for PageRead {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

/// Exclusive lock on one page.
pub struct PageWrite {
    page: PageRef,
    guard: ArcRwLockWriteGuard<RawRwLock, Page>,
}

impl PageWrite {
    pub fn page_ref(&self) -> PageRef {
        self.page
    }
}

impl Deref for PageWrite {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWrite {
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.guard
    }
}

pub struct PageStore {
    frames: RwLock<Vec<Arc<RwLock<Page>>>>,
    backend: Box<dyn PageBackend>,
    extension: Mutex<()>,
}

impl PageStore {
    /// Open a store over `backend`, loading every page it holds.
    pub fn open(backend: impl PageBackend + 'static) -> StorageResult<Self> {
        let images = backend.load()?;
        let frames = images
            .iter()
            .enumerate()
            .map(|(i, bytes)| {
                Page::decode(PageRef::new(i as u32), bytes).map(|page| Arc::new(RwLock::new(page)))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        tracing::debug!("[storage] opened page store with {} pages", frames.len());

        Ok(Self {
            frames: RwLock::new(frames),
            backend: Box::new(backend),
            extension: Mutex::new(()),
        })
    }

    /// Ephemeral store backed by memory only.
    pub fn in_memory() -> Self {
        Self {
            frames: RwLock::new(Vec::new()),
            backend: Box::new(MemoryBackend::new()),
            extension: Mutex::new(()),
        }
    }

    pub fn page_count(&self) -> u32 {
        self.frames.read().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.frames.read().is_empty()
    }

    /// Serialize appends to the end of the page chain.
    pub fn lock_extension(&self) -> MutexGuard<'_, ()> {
        self.extension.lock()
    }

    /// Append a new empty page. It becomes durable with its first commit.
    pub fn allocate_page(&self) -> PageRef {
        let mut frames = self.frames.write();
        frames.push(Arc::new(RwLock::new(Page::new())));
        PageRef::new(frames.len() as u32 - 1)
    }

    pub fn read_page(&self, page: PageRef) -> StorageResult<PageRead> {
        let frame = self.frame(page)?;
        Ok(PageRead {
            page,
            guard: frame.read_arc(),
        })
    }

    pub fn write_page(&self, page: PageRef) -> StorageResult<PageWrite> {
        let frame = self.frame(page)?;
        Ok(PageWrite {
            page,
            guard: frame.write_arc(),
        })
    }

    /// Persist the given locked pages as one atomic unit.
    pub fn commit(&self, pages: &[&PageWrite]) -> StorageResult<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let images: Vec<(PageRef, Vec<u8>)> =
            pages.iter().map(|p| (p.page, p.encode())).collect();
        self.backend.persist(&images)
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.backend.sync()
    }

    fn frame(&self, page: PageRef) -> StorageResult<Arc<RwLock<Page>>> {
        let frames = self.frames.read();
        frames
            .get(page.index())
            .cloned()
            .ok_or(StorageError::PageOutOfRange {
                page,
                count: frames.len() as u32,
            })
    }
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("pages", &self.page_count())
            .finish()
    }
}
