//! Single-file page backend with a redo journal.
//!
//! # Journal Format
//!
//! Every commit first writes a journal next to the page file:
//! - Magic bytes `NGJ1`
//! - Page count (u32)
//! - Per page: page number (u32) followed by the full page image
//! - SHA-256 digest of everything above
//!
//! Once the journal is on disk the pages are written in place and the
//! journal is truncated. Commits are serialized for their whole duration.
//! A complete journal found at open time belongs to a commit that may not
//! have reached the page file, so it is replayed. A journal that is short
//! or fails its digest was never acknowledged and is discarded.

use super::page::{PAGE_SIZE, PageRef};
use super::store::PageBackend;
use crate::error::{IoContext, StorageError, StorageResult};
use memmap2::MmapOptions;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"NGJ1";

const DIGEST_SIZE: usize = 32;

#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    journal_path: PathBuf,
    file: Mutex<File>,
    synchronous: bool,
}

impl FileBackend {
    /// Open (or create) the page file at `path`.
    ///
    /// With `synchronous` set, every commit is fsynced before it returns.
    pub fn open(path: impl AsRef<Path>, synchronous: bool) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_path(&path)?;

        let backend = Self {
            journal_path: path.with_extension("journal"),
            path,
            file: Mutex::new(file),
            synchronous,
        };
        backend.recover()?;
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay a complete journal left behind by an interrupted commit.
    fn recover(&self) -> StorageResult<()> {
        let bytes = match fs::read(&self.journal_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_path(&self.journal_path),
        };
        if bytes.is_empty() {
            return Ok(());
        }

        match self.parse_journal(&bytes)? {
            Some(pages) => {
                tracing::warn!(
                    "[storage] replaying journal with {} pages into {}",
                    pages.len(),
                    self.path.display()
                );
                let mut file = self.file.lock();
                self.write_in_place(&mut file, &pages)?;
                file.sync_data().with_path(&self.path)?;
            }
            None => {
                tracing::warn!(
                    "[storage] discarding incomplete journal {}",
                    self.journal_path.display()
                );
            }
        }
        self.clear_journal()
    }

    /// Returns `None` for a journal that never completed.
    fn parse_journal(&self, bytes: &[u8]) -> StorageResult<Option<Vec<(PageRef, Vec<u8>)>>> {
        if bytes.len() < JOURNAL_MAGIC.len() + 4 + DIGEST_SIZE {
            return Ok(None);
        }
        if &bytes[..4] != JOURNAL_MAGIC {
            return Err(StorageError::JournalCorrupted {
                path: self.journal_path.clone(),
                reason: "missing journal magic".to_string(),
            });
        }
        let count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let body_len = 8 + count * (4 + PAGE_SIZE);
        if bytes.len() != body_len + DIGEST_SIZE {
            return Ok(None);
        }
        let digest = Sha256::digest(&bytes[..body_len]);
        if digest.as_slice() != &bytes[body_len..] {
            return Ok(None);
        }

        let pages = bytes[8..body_len]
            .chunks_exact(4 + PAGE_SIZE)
            .map(|record| {
                let page = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
                (PageRef::new(page), record[4..].to_vec())
            })
            .collect();
        Ok(Some(pages))
    }

    fn write_journal(&self, pages: &[(PageRef, Vec<u8>)]) -> StorageResult<()> {
        let mut bytes = Vec::with_capacity(8 + pages.len() * (4 + PAGE_SIZE) + DIGEST_SIZE);
        bytes.extend_from_slice(JOURNAL_MAGIC);
        bytes.extend_from_slice(&(pages.len() as u32).to_le_bytes());
        for (page, image) in pages {
            bytes.extend_from_slice(&page.get().to_le_bytes());
            bytes.extend_from_slice(image);
        }
        let digest = Sha256::digest(&bytes);
        bytes.extend_from_slice(&digest);

        let mut journal = File::create(&self.journal_path).with_path(&self.journal_path)?;
        journal.write_all(&bytes).with_path(&self.journal_path)?;
        if self.synchronous {
            journal.sync_data().with_path(&self.journal_path)?;
        }
        Ok(())
    }

    fn write_in_place(&self, file: &mut File, pages: &[(PageRef, Vec<u8>)]) -> StorageResult<()> {
        for (page, image) in pages {
            let offset = page.get() as u64 * PAGE_SIZE as u64;
            file.seek(SeekFrom::Start(offset)).with_path(&self.path)?;
            file.write_all(image).with_path(&self.path)?;
        }
        Ok(())
    }

    fn clear_journal(&self) -> StorageResult<()> {
        match fs::remove_file(&self.journal_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_path(&self.journal_path),
        }
    }
}

impl PageBackend for FileBackend {
    fn load(&self) -> StorageResult<Vec<Vec<u8>>> {
        let file = self.file.lock();
        let len = file.metadata().with_path(&self.path)?.len() as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        if len % PAGE_SIZE != 0 {
            return Err(StorageError::InvalidPage {
                page: PageRef::new((len / PAGE_SIZE) as u32),
                reason: format!("page file length {len} is not a multiple of {PAGE_SIZE}"),
            });
        }

        let mmap = unsafe { MmapOptions::new().map(&*file).with_path(&self.path)? };
        Ok(mmap.chunks_exact(PAGE_SIZE).map(<[u8]>::to_vec).collect())
    }

    fn persist(&self, pages: &[(PageRef, Vec<u8>)]) -> StorageResult<()> {
        // Commits share one journal path: the file lock is held from the
        // journal write until the journal is cleared.
        let mut file = self.file.lock();
        self.write_journal(pages)?;
        self.write_in_place(&mut file, pages)?;
        if self.synchronous {
            file.sync_data().with_path(&self.path)?;
        }
        self.clear_journal()
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.lock().sync_all().with_path(&self.path)
    }
}
