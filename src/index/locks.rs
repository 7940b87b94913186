//! Index-wide locks.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Locks shared by every handle of one index.
///
/// - `update`: inserts hold it shared; inserts that may promote the entry
///   point, and vacuum's entry-point repair, hold it exclusively.
/// - `wait`: taken before `update` is requested exclusively. Shared
///   acquisitions pass through it first, so new readers queue behind a
///   pending promotion instead of starving it.
/// - `scan`: scans hold it shared while traversing; reclaiming slots holds
///   it exclusively.
#[derive(Debug, Default)]
pub(crate) struct IndexLocks {
    update: RwLock<()>,
    wait: Mutex<()>,
    scan: RwLock<()>,
}

/// Update lock held by one operation, in whichever mode it needed.
pub(crate) enum UpdateGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl UpdateGuard<'_> {
    pub(crate) fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive(_))
    }
}

impl IndexLocks {
    pub(crate) fn update_shared(&self) -> UpdateGuard<'_> {
        drop(self.wait.lock());
        UpdateGuard::Shared(self.update.read())
    }

    pub(crate) fn update_exclusive(&self) -> UpdateGuard<'_> {
        let _wait = self.wait.lock();
        UpdateGuard::Exclusive(self.update.write())
    }

    pub(crate) fn scan_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.scan.read()
    }

    pub(crate) fn scan_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.scan.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_updates_coexist() {
        let locks = IndexLocks::default();
        let a = locks.update_shared();
        let b = locks.update_shared();
        assert!(!a.is_exclusive());
        assert!(!b.is_exclusive());
        assert!(locks.update.try_write().is_none());
    }

    #[test]
    fn test_exclusive_update_blocks_readers() {
        let locks = IndexLocks::default();
        let guard = locks.update_exclusive();
        assert!(guard.is_exclusive());
        assert!(locks.update.try_read().is_none());
        // the wait lock is only held while acquiring
        assert!(locks.wait.try_lock().is_some());
        drop(guard);
        assert!(locks.update.try_read().is_some());
    }

    #[test]
    fn test_scan_exclusion() {
        let locks = IndexLocks::default();
        let scan = locks.scan_shared();
        assert!(locks.scan.try_write().is_none());
        drop(scan);
        let _reclaim = locks.scan_exclusive();
        assert!(locks.scan.try_read().is_none());
    }
}
