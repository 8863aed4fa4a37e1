//! Lock Manager: per-`FileId` reader/writer locking so concurrent facade
//! calls on different files never block each other, while calls on the
//! same file serialize the way POSIX expects. Built from
//! `parking_lot::RwLock` sharded by a `dashmap` (see `DESIGN.md` for the
//! grounding for this combination).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::ids::FileId;

pub type SharedGuard = ArcRwLockReadGuard<RawRwLock, ()>;
pub type ExclusiveGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

#[derive(Default)]
pub struct LockManager {
    locks: DashMap<FileId, Arc<RwLock<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: FileId) -> Arc<RwLock<()>> {
        self.locks.entry(id).or_insert_with(|| Arc::new(RwLock::new(()))).clone()
    }

    /// Acquire a shared (reader) lock on `id`. The returned guard owns an
    /// `Arc` to the underlying lock, so it stays alive even if another
    /// thread removes `id`'s entry from the table concurrently.
    pub fn acquire_shared(&self, id: FileId) -> SharedGuard {
        let lock = self.lock_for(id);
        RwLock::read_arc(&lock)
    }

    /// Acquire an exclusive (writer) lock on `id`. `parking_lot::RwLock`
    /// is write-preferring: once a writer starts waiting, new readers
    /// queue behind it, so exclusive waiters can't be starved by a
    /// steady stream of readers.
    pub fn acquire_exclusive(&self, id: FileId) -> ExclusiveGuard {
        let lock = self.lock_for(id);
        RwLock::write_arc(&lock)
    }

    /// Drop the table entry for `id` if nothing else references its lock.
    /// Safe to call opportunistically after a file is deleted; a racing
    /// lock acquisition simply recreates the entry.
    pub fn forget(&self, id: FileId) {
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn distinct_files_do_not_contend() {
        let mgr = Arc::new(LockManager::new());
        let _a = mgr.acquire_exclusive(FileId(2));
        let _b = mgr.acquire_exclusive(FileId(3));
    }

    #[test]
    fn same_file_shared_locks_coexist() {
        let mgr = LockManager::new();
        let _a = mgr.acquire_shared(FileId(2));
        let _b = mgr.acquire_shared(FileId(2));
    }

    #[test]
    fn exclusive_blocks_until_shared_released() {
        let mgr = Arc::new(LockManager::new());
        let reader = mgr.acquire_shared(FileId(2));
        let acquired = Arc::new(AtomicBool::new(false));

        let mgr2 = mgr.clone();
        let acquired2 = acquired.clone();
        let handle = thread::spawn(move || {
            let _w = mgr2.acquire_exclusive(FileId(2));
            acquired2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(reader);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn forget_removes_unreferenced_entry() {
        let mgr = LockManager::new();
        {
            let _g = mgr.acquire_exclusive(FileId(2));
        }
        mgr.forget(FileId(2));
        assert!(mgr.locks.is_empty());
    }
}
