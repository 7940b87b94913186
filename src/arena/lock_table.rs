//! Striped per-element locks for the build arena.

use super::ArenaRef;
use parking_lot::{Mutex, MutexGuard};

const DEFAULT_STRIPES: usize = 1024;

/// Fixed set of mutexes keyed by element reference.
///
/// Guards one element's neighbor lists and heap refs during a
/// read-modify-write. Callers never hold two stripes at once, so distinct
/// elements sharing a stripe cannot deadlock.
#[derive(Debug)]
pub struct LockTable {
    stripes: Box<[Mutex<()>]>,
}

impl LockTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, element: ArenaRef) -> MutexGuard<'_, ()> {
        self.stripes[element.index() % self.stripes.len()].lock()
    }

    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
