pub mod flush_list;

use crate::concurrency::RwLatch;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::LSN;
use crate::storage::{PageId, PAGE_SIZE};
use dashmap::DashMap;
use flush_list::FlushList;
use log::trace;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a fixed page is latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Pinned only.
    NoLatch,
    Shared,
    Exclusive,
}

/// A page frame in the buffer pool.
pub struct Block {
    page_id: PageId,
    latch: RwLatch,
    /// Pin count, guarded by the per-page mutex.
    fix_count: Mutex<u32>,
    /// LSN of the first unflushed modification, 0 when clean.
    oldest_modification: AtomicU64,
    /// LSN at the end of the latest modification.
    newest_modification: AtomicU64,
    frame: Mutex<Box<[u8; PAGE_SIZE]>>,
}

impl Block {
    fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            latch: RwLatch::new(),
            fix_count: Mutex::new(0),
            oldest_modification: AtomicU64::new(0),
            newest_modification: AtomicU64::new(0),
            frame: Mutex::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn fix_count(&self) -> u32 {
        *self.fix_count.lock()
    }

    /// Increment the pin count.
    pub fn fix(&self) {
        *self.fix_count.lock() += 1;
    }

    /// Decrement the pin count.
    pub fn unfix(&self) {
        let mut fix_count = self.fix_count.lock();
        assert!(*fix_count > 0, "unfix of unpinned {}", self.page_id);
        *fix_count -= 1;
    }

    /// Acquire the page latch in `mode`.
    pub fn latch(&self, mode: LatchMode) {
        match mode {
            LatchMode::NoLatch => {}
            LatchMode::Shared => self.latch.s_lock(),
            LatchMode::Exclusive => self.latch.x_lock(),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latch.is_locked()
    }

    pub fn is_latched_exclusive(&self) -> bool {
        self.latch.is_locked_exclusive()
    }

    pub fn oldest_modification(&self) -> LSN {
        LSN(self.oldest_modification.load(Ordering::Acquire))
    }

    pub fn newest_modification(&self) -> LSN {
        LSN(self.newest_modification.load(Ordering::Acquire))
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        check_bounds(offset, len)?;
        let frame = self.frame.lock();
        Ok(frame[offset..offset + len].to_vec())
    }

    /// Overwrite frame bytes. Callers hold the page latch exclusively.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> StorageResult<()> {
        check_bounds(offset, data.len())?;
        debug_assert!(self.is_latched_exclusive());
        let mut frame = self.frame.lock();
        frame[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("page_id", &self.page_id)
            .field("fix_count", &self.fix_count())
            .field("latch", &self.latch)
            .field("oldest_modification", &self.oldest_modification())
            .field("newest_modification", &self.newest_modification())
            .finish()
    }
}

fn check_bounds(offset: usize, len: usize) -> StorageResult<()> {
    if offset + len > PAGE_SIZE {
        return Err(StorageError::PageOverflow { offset, len });
    }
    Ok(())
}

/// In-memory page cache.
///
/// Blocks are created on first fix and stay resident; the pool owns them and
/// everyone else refers to them by `PageId`.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    page_table: DashMap<PageId, Arc<Block>>,
    flush_list: Mutex<FlushList>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                page_table: DashMap::with_capacity(capacity),
                flush_list: Mutex::new(FlushList::new()),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Pin a page, creating its frame on first use.
    pub fn fix(&self, page_id: PageId) -> StorageResult<Arc<Block>> {
        if page_id.0 as usize >= self.inner.capacity {
            return Err(StorageError::PageOutOfRange {
                page_id,
                capacity: self.inner.capacity,
            });
        }

        let block = self
            .inner
            .page_table
            .entry(page_id)
            .or_insert_with(|| Arc::new(Block::new(page_id)))
            .value()
            .clone();
        block.fix();
        Ok(block)
    }

    /// Find a resident page without pinning it.
    pub fn lookup(&self, page_id: PageId) -> StorageResult<Arc<Block>> {
        self.inner
            .page_table
            .get(&page_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::PageNotFound(page_id))
    }

    /// Release the latch taken on `block` in `mode`. The pin is untouched.
    pub(crate) fn release_latch(&self, block: &Block, mode: LatchMode) {
        match mode {
            LatchMode::NoLatch => {}
            LatchMode::Shared => block.latch.s_unlock(),
            LatchMode::Exclusive => block.latch.x_unlock(),
        }
    }

    /// Whether modifying `block` will move it from clean to dirty.
    pub fn is_block_dirtied(&self, block: &Block) -> bool {
        debug_assert!(block.fix_count() > 0);
        // No other thread can reset oldest_modification while the caller has
        // the page fixed and latched, except the page writer which holds the
        // latch in shared mode.
        block.oldest_modification().is_invalid()
    }

    /// Record a modification of `block` by the log group `start..end`.
    ///
    /// A clean page enters the flush list at `start`. Callers serialise
    /// flush list insertion in LSN order with the flush-order mutex.
    pub fn note_modification(&self, block: &Block, start: LSN, end: LSN) {
        debug_assert!(!start.is_invalid());
        debug_assert!(end >= start);
        debug_assert!(block.is_latched_exclusive());

        block.newest_modification.store(end.0, Ordering::Release);

        if block.oldest_modification().is_invalid() {
            block.oldest_modification.store(start.0, Ordering::Release);
            self.inner.flush_list.lock().insert(block.page_id, start);
            trace!("{} dirtied at {}", block.page_id, start);
        } else {
            debug_assert!(block.oldest_modification() <= start);
        }
    }

    /// Mark a flushed page clean and take it off the flush list.
    pub fn mark_clean(&self, block: &Block) {
        if self.inner.flush_list.lock().remove(block.page_id) {
            block.oldest_modification.store(0, Ordering::Release);
            block.newest_modification.store(0, Ordering::Release);
        }
    }

    /// Snapshot of the flush list, oldest modification first.
    pub fn flush_list(&self) -> Vec<(PageId, LSN)> {
        self.inner.flush_list.lock().pages()
    }

    /// LSN of the oldest unflushed modification, if any page is dirty.
    pub fn oldest_modification(&self) -> Option<LSN> {
        self.inner.flush_list.lock().oldest().map(|(lsn, _)| lsn)
    }

    pub fn dirty_page_count(&self) -> usize {
        self.inner.flush_list.lock().len()
    }

    pub fn is_flush_list_ordered(&self) -> bool {
        self.inner.flush_list.lock().is_ordered()
    }

    pub fn resident_page_count(&self) -> usize {
        self.inner.page_table.len()
    }
}
