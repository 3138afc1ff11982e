//! Mini-transactions.
//!
//! A mini-transaction (mtr) is the unit of atomic physical change. It records
//! every page pin, page latch and named lock it takes in a memo, accumulates
//! the redo bytes describing its changes, and at commit publishes those bytes
//! to the redo log, stamps the modified pages with the assigned LSN range and
//! releases everything it holds in reverse acquisition order.

mod command;
pub mod log_buf;
pub mod memo;
mod mlog;

use std::sync::Arc;

use log::{debug, info};

use crate::concurrency::LockId;
use crate::database::Database;
use crate::storage::{Block, LatchMode, PageId, StorageResult, LSN};

use command::Command;
pub use log_buf::MtrLog;
pub use memo::{Memo, MemoObject, MemoSlot, MemoType};

/// Lifecycle of a mini-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrState {
    Active,
    Committing,
    Committed,
}

/// What happens to redo records a mini-transaction generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Records are kept and written to the log.
    All,
    /// Nothing is logged.
    None,
    /// Changes are not logged but modified pages still join the flush list.
    NoRedo,
}

/// Per-start state of a mini-transaction, freed at commit.
#[derive(Debug)]
pub(crate) struct MtrImpl {
    memo: Memo,
    log: MtrLog,
    state: MtrState,
    log_mode: LogMode,
    read_only: bool,
    modifications: bool,
    made_dirty: bool,
    n_log_recs: usize,
    /// Payload bytes the last record header declared but not yet appended.
    pending_payload: usize,
    n_freed_pages: usize,
}

impl MtrImpl {
    fn new(read_only: bool) -> Self {
        Self {
            memo: Memo::new(),
            log: MtrLog::new(),
            state: MtrState::Active,
            log_mode: LogMode::All,
            read_only,
            modifications: false,
            made_dirty: false,
            n_log_recs: 0,
            pending_payload: 0,
            n_freed_pages: 0,
        }
    }
}

/// Handle of a mini-transaction.
///
/// A handle can be started again after it has committed.
pub struct Mtr<'db> {
    db: &'db Database,
    imp: Option<Box<MtrImpl>>,
    sync: bool,
    commit_lsn: LSN,
    committed: bool,
}

impl<'db> Mtr<'db> {
    pub fn new(db: &'db Database) -> Self {
        Self {
            db,
            imp: None,
            sync: false,
            commit_lsn: LSN::new(),
            committed: false,
        }
    }

    /// Begin a mini-transaction with an empty memo and log.
    pub fn start(&mut self, sync: bool, read_only: bool) {
        assert!(
            !self.is_active(),
            "start of a mini-transaction that is already active"
        );
        self.sync = sync;
        self.commit_lsn = LSN::new();
        self.committed = false;
        self.imp = Some(Box::new(MtrImpl::new(read_only)));
    }

    /// Commit the mini-transaction.
    ///
    /// If it modified pages and produced redo (or runs without redo), its log
    /// group is appended to the redo log and its pages are stamped with the
    /// assigned range before any latch is released. Otherwise the resources
    /// are released without touching the log.
    pub fn commit(&mut self) {
        let Some(mut imp) = self.imp.take() else {
            panic!("commit of a mini-transaction that was not started");
        };
        debug_assert_eq!(imp.state, MtrState::Active);
        debug_assert_eq!(
            imp.pending_payload, 0,
            "record payload shorter than its header declares"
        );
        imp.state = MtrState::Committing;

        let modifying =
            imp.modifications && (imp.n_log_recs > 0 || imp.log_mode == LogMode::NoRedo);
        debug_assert!(!modifying || self.db.log().is_write_allowed());
        let command = Command::new(self, imp);
        if modifying {
            command.execute();
        } else {
            command.release_all();
        }
        self.committed = true;
    }

    /// End LSN of the committed log group.
    pub fn commit_lsn(&self) -> LSN {
        assert!(
            self.committed && !self.commit_lsn.is_invalid(),
            "commit LSN requested from a mini-transaction that did not write redo"
        );
        self.commit_lsn
    }

    /// Record a resource the caller has already acquired.
    ///
    /// A `Modify` mark makes the mini-transaction modifying, as
    /// [`Mtr::memo_modify_page`] does.
    pub fn memo_push(&mut self, object: MemoObject, kind: MemoType) {
        if kind == MemoType::Modify {
            self.set_modified();
        }
        if kind == MemoType::PageXFix {
            if let MemoObject::Page(page_id) = object {
                if let Ok(block) = self.db.buffer_pool().lookup(page_id) {
                    self.note_x_fix(&block);
                }
            }
        }
        let imp = self.active_mut();
        imp.memo.push(object, kind);
    }

    /// Release the most recent live slot holding `object` as `kind` before
    /// commit. Returns false if there is none.
    pub fn memo_release(&mut self, object: MemoObject, kind: MemoType) -> bool {
        let db = self.db;
        let imp = self.active_mut();
        debug_assert!(
            !(imp.modifications && kind == MemoType::PageXFix),
            "early release of an exclusively latched page in a modifying mini-transaction"
        );

        match imp.memo.find(object, kind) {
            Some(slot) => {
                command::memo_slot_release(db, slot);
                true
            }
            None => false,
        }
    }

    pub fn memo_contains(&self, object: MemoObject, kind: MemoType) -> bool {
        self.active().memo.contains(object, kind)
    }

    pub fn memo_contains_page(&self, page_id: PageId, kind: MemoType) -> bool {
        self.memo_contains(MemoObject::Page(page_id), kind)
    }

    /// Pin `page_id`, latch it in `mode` and record both in the memo.
    pub fn get_page(&mut self, page_id: PageId, mode: LatchMode) -> StorageResult<Arc<Block>> {
        self.active();
        let block = self.db.buffer_pool().fix(page_id)?;
        block.latch(mode);
        let kind = MemoType::for_latch(mode);
        if kind == MemoType::PageXFix {
            self.note_x_fix(&block);
        }
        self.active_mut().memo.push(MemoObject::Page(page_id), kind);
        Ok(block)
    }

    /// Release a page obtained with [`Mtr::get_page`] before commit.
    pub fn release_page(&mut self, page_id: PageId, mode: LatchMode) -> bool {
        self.memo_release(MemoObject::Page(page_id), MemoType::for_latch(mode))
    }

    pub fn s_lock(&mut self, lock_id: LockId) -> StorageResult<()> {
        self.active();
        self.db.locks().s_lock(lock_id)?;
        self.active_mut()
            .memo
            .push(MemoObject::Lock(lock_id), MemoType::SLock);
        Ok(())
    }

    pub fn x_lock(&mut self, lock_id: LockId) -> StorageResult<()> {
        self.active();
        self.db.locks().x_lock(lock_id)?;
        self.active_mut()
            .memo
            .push(MemoObject::Lock(lock_id), MemoType::XLock);
        Ok(())
    }

    /// Note that `page_id` was modified by this mini-transaction.
    pub fn memo_modify_page(&mut self, page_id: PageId) {
        debug_assert!(
            self.memo_contains_page(page_id, MemoType::PageXFix),
            "{} modified without an exclusive latch",
            page_id
        );
        self.set_modified();
        let imp = self.active_mut();
        let object = MemoObject::Page(page_id);
        if !imp.memo.contains(object, MemoType::Modify) {
            imp.memo.push(object, MemoType::Modify);
        }
    }

    pub fn set_modified(&mut self) {
        let imp = self.active_mut();
        debug_assert!(!imp.read_only, "read-only mini-transaction modified a page");
        imp.modifications = true;
    }

    pub fn has_modifications(&self) -> bool {
        self.active().modifications
    }

    /// Change the log mode, returning the previous one.
    pub fn set_log_mode(&mut self, mode: LogMode) -> LogMode {
        let imp = self.active_mut();
        let old = imp.log_mode;
        imp.log_mode = mode;
        old
    }

    pub fn log_mode(&self) -> LogMode {
        self.active().log_mode
    }

    /// Whether committing this mini-transaction will move a clean page onto
    /// the flush list.
    pub fn is_dirty_made(&self) -> bool {
        self.active().made_dirty
    }

    pub fn n_log_recs(&self) -> usize {
        self.active().n_log_recs
    }

    pub fn add_freed_page(&mut self) {
        self.active_mut().n_freed_pages += 1;
    }

    pub fn n_freed_pages(&self) -> usize {
        self.active().n_freed_pages
    }

    pub fn memo_size(&self) -> usize {
        self.active().memo.size()
    }

    pub fn log_size(&self) -> usize {
        self.active().log.size()
    }

    pub fn is_active(&self) -> bool {
        self.imp
            .as_ref()
            .map_or(false, |imp| imp.state == MtrState::Active)
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    pub fn is_read_only(&self) -> bool {
        self.active().read_only
    }

    pub fn print(&self) {
        let imp = self.active();
        info!(
            "Mini-transaction handle: memo size {} bytes log size {} bytes",
            imp.memo.size(),
            imp.log.size()
        );
    }

    fn note_x_fix(&mut self, block: &Block) {
        let pool = self.db.buffer_pool();
        let imp = self.active_mut();
        if !imp.made_dirty && pool.is_block_dirtied(block) {
            debug!("{} will be dirtied by this mini-transaction", block.page_id());
            imp.made_dirty = true;
        }
    }

    fn active(&self) -> &MtrImpl {
        match self.imp.as_deref() {
            Some(imp) if imp.state == MtrState::Active => imp,
            _ => panic!("mini-transaction is not active"),
        }
    }

    fn active_mut(&mut self) -> &mut MtrImpl {
        match self.imp.as_deref_mut() {
            Some(imp) if imp.state == MtrState::Active => imp,
            _ => panic!("mini-transaction is not active"),
        }
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.imp.is_none() || std::thread::panicking(),
            "mini-transaction dropped without commit"
        );
    }
}
