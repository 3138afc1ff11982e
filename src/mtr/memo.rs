//! The memo: the ledger of resources a mini-transaction holds.
//!
//! Slots are appended in acquisition order into fixed-capacity blocks and are
//! visited newest first, which is the order they must be released in.

use std::fmt;
use std::mem;
use std::ops::ControlFlow;

use crate::concurrency::LockId;
use crate::storage::{LatchMode, PageId};

/// Slots per memo block.
pub const MEMO_BLOCK_CAPACITY: usize = 32;

/// What a memo slot records about its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoType {
    /// Page pinned without a latch.
    BufFix,
    /// Page pinned and share-latched.
    PageSFix,
    /// Page pinned and exclusively latched.
    PageXFix,
    /// Named lock held in shared mode.
    SLock,
    /// Named lock held in exclusive mode.
    XLock,
    /// The page was modified by this mini-transaction.
    Modify,
}

impl MemoType {
    /// Latch mode of a page slot, `None` for other kinds.
    pub fn latch_mode(&self) -> Option<LatchMode> {
        match self {
            MemoType::BufFix => Some(LatchMode::NoLatch),
            MemoType::PageSFix => Some(LatchMode::Shared),
            MemoType::PageXFix => Some(LatchMode::Exclusive),
            MemoType::SLock | MemoType::XLock | MemoType::Modify => None,
        }
    }

    /// Whether the slot holds a pin on a page.
    pub fn is_page_fix(&self) -> bool {
        self.latch_mode().is_some()
    }

    pub fn for_latch(mode: LatchMode) -> Self {
        match mode {
            LatchMode::NoLatch => MemoType::BufFix,
            LatchMode::Shared => MemoType::PageSFix,
            LatchMode::Exclusive => MemoType::PageXFix,
        }
    }
}

/// Non-owning reference to the object of a slot. Pages resolve through the
/// buffer pool, locks through the lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoObject {
    Page(PageId),
    Lock(LockId),
}

impl fmt::Display for MemoObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoObject::Page(page_id) => write!(f, "{}", page_id),
            MemoObject::Lock(lock_id) => write!(f, "{}", lock_id),
        }
    }
}

/// One ledger entry. `object` is cleared once the resource is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoSlot {
    pub object: Option<MemoObject>,
    pub kind: MemoType,
}

impl MemoSlot {
    pub fn is_released(&self) -> bool {
        self.object.is_none()
    }

    fn matches(&self, object: MemoObject, kind: MemoType) -> bool {
        self.object == Some(object) && self.kind == kind
    }
}

#[derive(Debug)]
pub struct Memo {
    blocks: Vec<Vec<MemoSlot>>,
}

impl Memo {
    pub fn new() -> Self {
        Self {
            blocks: vec![Vec::with_capacity(MEMO_BLOCK_CAPACITY)],
        }
    }

    pub fn push(&mut self, object: MemoObject, kind: MemoType) {
        let needs_block = self
            .blocks
            .last()
            .map_or(true, |block| block.len() == MEMO_BLOCK_CAPACITY);
        if needs_block {
            self.blocks.push(Vec::with_capacity(MEMO_BLOCK_CAPACITY));
        }
        if let Some(block) = self.blocks.last_mut() {
            block.push(MemoSlot {
                object: Some(object),
                kind,
            });
        }
    }

    /// Visit slots newest first, stopping as soon as `visitor` breaks.
    ///
    /// Returns `Break` if the walk was stopped early.
    pub fn for_each_reverse<F>(&mut self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&mut MemoSlot) -> ControlFlow<()>,
    {
        for block in self.blocks.iter_mut().rev() {
            for slot in block.iter_mut().rev() {
                if visitor(slot).is_break() {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Slots newest first.
    pub fn iter_rev(&self) -> impl Iterator<Item = &MemoSlot> {
        self.blocks.iter().rev().flat_map(|block| block.iter().rev())
    }

    /// The most recent live slot holding `object` as `kind`.
    pub fn find(&mut self, object: MemoObject, kind: MemoType) -> Option<&mut MemoSlot> {
        self.blocks
            .iter_mut()
            .rev()
            .flat_map(|block| block.iter_mut().rev())
            .find(|slot| slot.matches(object, kind))
    }

    pub fn contains(&self, object: MemoObject, kind: MemoType) -> bool {
        self.iter_rev().any(|slot| slot.matches(object, kind))
    }

    /// Number of slots, released ones included.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes used by the slots.
    pub fn size(&self) -> usize {
        self.len() * mem::size_of::<MemoSlot>()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn erase(&mut self) {
        self.blocks.truncate(1);
        if let Some(block) = self.blocks.first_mut() {
            block.clear();
        }
    }
}

impl Default for Memo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32) -> MemoObject {
        MemoObject::Page(PageId(n))
    }

    #[test]
    fn test_reverse_walk_spans_blocks() {
        let mut memo = Memo::new();
        let count = MEMO_BLOCK_CAPACITY * 2 + 5;
        for n in 0..count as u32 {
            memo.push(page(n), MemoType::BufFix);
        }
        assert_eq!(memo.len(), count);
        assert_eq!(memo.block_count(), 3);

        let mut visited = Vec::new();
        let flow = memo.for_each_reverse(|slot| {
            visited.push(slot.object);
            ControlFlow::Continue(())
        });

        assert!(flow.is_continue());
        let expected: Vec<_> = (0..count as u32).rev().map(|n| Some(page(n))).collect();
        assert_eq!(visited, expected);
    }

    #[test]
    fn test_reverse_walk_early_exit() {
        let mut memo = Memo::new();
        for n in 0..10 {
            memo.push(page(n), MemoType::PageSFix);
        }

        let mut visited = 0;
        let flow = memo.for_each_reverse(|slot| {
            visited += 1;
            if slot.object == Some(page(7)) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        assert!(flow.is_break());
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_find_newest_live_slot() {
        let mut memo = Memo::new();
        memo.push(page(1), MemoType::PageSFix);
        memo.push(page(2), MemoType::PageXFix);
        memo.push(page(1), MemoType::PageSFix);

        let slot = memo.find(page(1), MemoType::PageSFix).unwrap();
        slot.object = None;

        // The older slot for the same page is found next.
        assert!(memo.find(page(1), MemoType::PageSFix).is_some());
        let released: Vec<_> = memo.iter_rev().map(|s| s.is_released()).collect();
        assert_eq!(released, vec![true, false, false]);

        // Kind must match too.
        assert!(memo.find(page(2), MemoType::PageSFix).is_none());
        assert!(memo.contains(page(2), MemoType::PageXFix));
    }

    #[test]
    fn test_lock_objects() {
        let mut memo = Memo::new();
        memo.push(MemoObject::Lock(LockId(4)), MemoType::XLock);
        assert!(memo.contains(MemoObject::Lock(LockId(4)), MemoType::XLock));
        assert!(!memo.contains(MemoObject::Lock(LockId(4)), MemoType::SLock));
        assert!(!memo.contains(page(4), MemoType::XLock));
    }

    #[test]
    fn test_erase() {
        let mut memo = Memo::new();
        for n in 0..(MEMO_BLOCK_CAPACITY as u32 + 1) {
            memo.push(page(n), MemoType::BufFix);
        }
        assert_eq!(memo.size(), memo.len() * mem::size_of::<MemoSlot>());

        memo.erase();
        assert!(memo.is_empty());
        assert_eq!(memo.block_count(), 1);
    }

    #[test]
    fn test_memo_type_latch_modes() {
        assert_eq!(MemoType::PageXFix.latch_mode(), Some(LatchMode::Exclusive));
        assert_eq!(MemoType::for_latch(LatchMode::Shared), MemoType::PageSFix);
        assert!(MemoType::BufFix.is_page_fix());
        assert!(!MemoType::Modify.is_page_fix());
        assert!(!MemoType::SLock.is_page_fix());
    }
}
