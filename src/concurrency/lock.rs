//! Guard-less reader/writer latches and the named lock table.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::trace;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use crate::storage::error::{StorageError, StorageResult};

/// A reader/writer latch whose ownership is tracked by the caller instead of
/// by a guard object.
///
/// Only the crate can release a hold: every release goes through the memo
/// slot that recorded the acquisition.
///
/// ```compile_fail
/// let latch = vibedb_mtr::concurrency::RwLatch::new();
/// latch.x_lock();
/// latch.s_unlock();
/// ```
pub struct RwLatch {
    raw: RawRwLock,
}

impl RwLatch {
    pub fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
        }
    }

    /// Acquire in shared mode, blocking until available.
    pub fn s_lock(&self) {
        self.raw.lock_shared();
    }

    /// Acquire in exclusive mode, blocking until available.
    pub fn x_lock(&self) {
        self.raw.lock_exclusive();
    }

    pub fn try_s_lock(&self) -> bool {
        self.raw.try_lock_shared()
    }

    pub fn try_x_lock(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    /// Release one shared hold owned by the caller.
    pub(crate) fn s_unlock(&self) {
        // The writer bit may be set by a waiting writer, so only the lock
        // state as a whole can be checked here.
        assert!(
            self.raw.is_locked(),
            "shared unlock of a latch that is not locked"
        );
        // SAFETY: the latch is held in shared mode by the caller. Holders
        // record the acquisition in exactly one memo slot and release it once.
        unsafe { self.raw.unlock_shared() }
    }

    /// Release the exclusive hold owned by the caller.
    pub(crate) fn x_unlock(&self) {
        assert!(
            self.raw.is_locked_exclusive(),
            "exclusive unlock of a latch that is not x-locked"
        );
        // SAFETY: the latch is held exclusively (checked above) and only its
        // single owner can reach this call through its memo slot.
        unsafe { self.raw.unlock_exclusive() }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.raw.is_locked_exclusive()
    }
}

impl Default for RwLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RwLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLatch")
            .field("locked", &self.is_locked())
            .field("exclusive", &self.is_locked_exclusive())
            .finish()
    }
}

/// Identifier of a named lock in the `LockTable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u32);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock {}", self.0)
    }
}

struct NamedLock {
    name: String,
    latch: RwLatch,
}

/// Registry of named reader/writer locks.
///
/// Memo slots of kind `SLock`/`XLock` hold a `LockId` and resolve it here at
/// release time; the table owns the locks. Outside the crate a lock is taken
/// through `Mtr::s_lock`/`Mtr::x_lock` and released at commit.
///
/// ```compile_fail
/// let table = vibedb_mtr::concurrency::LockTable::new();
/// let id = table.create("index_tree");
/// table.x_lock(id).unwrap();
/// table.x_unlock(id).unwrap();
/// ```
pub struct LockTable {
    locks: DashMap<LockId, Arc<NamedLock>>,
    next_id: AtomicU32,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a new lock and return its id.
    pub fn create(&self, name: &str) -> LockId {
        let id = LockId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.locks.insert(
            id,
            Arc::new(NamedLock {
                name: name.to_string(),
                latch: RwLatch::new(),
            }),
        );
        trace!("created {} ({})", id, name);
        id
    }

    pub fn name(&self, id: LockId) -> StorageResult<String> {
        Ok(self.get(id)?.name.clone())
    }

    pub fn s_lock(&self, id: LockId) -> StorageResult<()> {
        self.get(id)?.latch.s_lock();
        Ok(())
    }

    pub fn x_lock(&self, id: LockId) -> StorageResult<()> {
        self.get(id)?.latch.x_lock();
        Ok(())
    }

    pub(crate) fn s_unlock(&self, id: LockId) -> StorageResult<()> {
        self.get(id)?.latch.s_unlock();
        Ok(())
    }

    pub(crate) fn x_unlock(&self, id: LockId) -> StorageResult<()> {
        self.get(id)?.latch.x_unlock();
        Ok(())
    }

    pub fn is_locked(&self, id: LockId) -> StorageResult<bool> {
        Ok(self.get(id)?.latch.is_locked())
    }

    pub fn is_locked_exclusive(&self, id: LockId) -> StorageResult<bool> {
        Ok(self.get(id)?.latch.is_locked_exclusive())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn get(&self, id: LockId) -> StorageResult<Arc<NamedLock>> {
        self.locks
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::LockNotFound(id))
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_latch_shared_holders() {
        let latch = RwLatch::new();
        latch.s_lock();
        assert!(latch.try_s_lock());
        assert!(!latch.try_x_lock());
        assert!(latch.is_locked());
        assert!(!latch.is_locked_exclusive());

        latch.s_unlock();
        latch.s_unlock();
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_latch_exclusive() {
        let latch = RwLatch::new();
        latch.x_lock();
        assert!(latch.is_locked_exclusive());
        assert!(!latch.try_s_lock());

        latch.x_unlock();
        assert!(latch.try_x_lock());
        latch.x_unlock();
    }

    #[test]
    #[should_panic(expected = "not x-locked")]
    fn test_latch_unlock_without_hold() {
        let latch = RwLatch::new();
        latch.x_unlock();
    }

    #[test]
    fn test_lock_table_lifecycle() {
        let table = LockTable::new();
        let index_lock = table.create("index_tree");
        let space_lock = table.create("space_latch");

        assert_ne!(index_lock, space_lock);
        assert_eq!(table.len(), 2);
        assert_eq!(table.name(index_lock).unwrap(), "index_tree");

        table.x_lock(index_lock).unwrap();
        assert!(table.is_locked_exclusive(index_lock).unwrap());
        table.x_unlock(index_lock).unwrap();
        assert!(!table.is_locked(index_lock).unwrap());
    }

    #[test]
    fn test_lock_table_unknown_id() {
        let table = LockTable::new();
        assert!(matches!(
            table.s_lock(LockId(42)),
            Err(StorageError::LockNotFound(LockId(42)))
        ));
    }

    #[test]
    fn test_lock_table_blocks_writer() {
        let table = Arc::new(LockTable::new());
        let id = table.create("contended");

        table.s_lock(id).unwrap();

        let table2 = Arc::clone(&table);
        let writer = thread::spawn(move || {
            table2.x_lock(id).unwrap();
            table2.x_unlock(id).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        table.s_unlock(id).unwrap();
        writer.join().unwrap();
        assert!(!table.is_locked(id).unwrap());
    }
}
