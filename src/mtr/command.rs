//! Commit of a mini-transaction.
//!
//! The order of the steps matters:
//! 1. The log group is appended while the log mutex is held.
//! 2. If the commit dirties a clean page, the flush-order mutex is taken
//!    before the log mutex is released, so flush list insertions happen in
//!    the order their start LSNs were assigned.
//! 3. Modified pages are stamped with the range and every pin is dropped.
//! 4. The flush-order mutex is released, then the latches and locks.

use std::ops::ControlFlow;
use std::sync::Arc;

use log::trace;

use super::{LogMode, Mtr, MtrImpl, MtrState};
use crate::database::Database;
use crate::mtr::memo::{MemoObject, MemoSlot, MemoType};
use crate::storage::{parse_group, Block, LogWriter, MlogType, PageId, LSN, SINGLE_REC_FLAG};

pub(super) struct Command<'m, 'db> {
    mtr: &'m mut Mtr<'db>,
    imp: Box<MtrImpl>,
    start_lsn: LSN,
    end_lsn: LSN,
}

impl<'m, 'db> Command<'m, 'db> {
    pub(super) fn new(mtr: &'m mut Mtr<'db>, imp: Box<MtrImpl>) -> Self {
        debug_assert_eq!(imp.state, MtrState::Committing);
        Self {
            mtr,
            imp,
            start_lsn: LSN::new(),
            end_lsn: LSN::new(),
        }
    }

    /// Write the log group, stamp the dirtied pages and release everything.
    pub(super) fn execute(mut self) {
        let db = self.mtr.db;

        let writer = self.write();
        let flush_order = if self.imp.made_dirty {
            Some(db.log().flush_order_lock())
        } else {
            None
        };
        writer.release();

        self.mtr.commit_lsn = self.end_lsn;
        self.release_blocks();
        drop(flush_order);

        self.release_latches();
        trace!(
            "mtr committed {}..{} ({} records)",
            self.start_lsn,
            self.end_lsn,
            self.imp.n_log_recs
        );
        self.release_resources();
    }

    /// Release every resource of a mini-transaction that wrote no redo.
    pub(super) fn release_all(mut self) {
        let db = self.mtr.db;
        let _ = self.imp.memo.for_each_reverse(|slot| {
            if !slot.is_released() {
                memo_slot_release(db, slot);
            }
            ControlFlow::Continue(())
        });
        self.release_resources();
    }

    /// Finish the log group and append it, returning with the log mutex held.
    fn write(&mut self) -> LogWriter<'db> {
        let db = self.mtr.db;
        let imp = &mut self.imp;

        if imp.n_log_recs > 1 {
            imp.log.push_u8(MlogType::MultiRecEnd as u8);
        } else if imp.n_log_recs == 1 {
            imp.log.set_first_byte_flag(SINGLE_REC_FLAG);
        }

        let write_bytes = imp.log_mode == LogMode::All;
        if cfg!(debug_assertions) && write_bytes && imp.n_log_recs > 0 {
            let group = imp.log.to_vec();
            debug_assert!(
                parse_group(&group).map_or(false, |parsed| parsed.len == group.len()),
                "log group of {} records does not parse",
                imp.n_log_recs
            );
        }
        let mut writer = db.log().lock();

        if imp.log.is_small() {
            let len = if write_bytes { imp.log.front().len() } else { 0 };
            if let Some((start, end)) = writer.append_small(imp.log.front(), len) {
                self.start_lsn = start;
                self.end_lsn = end;
                return writer;
            }
        }

        let size = if write_bytes { imp.log.size() } else { 0 };
        self.start_lsn = writer.open(size);
        if write_bytes {
            let _ = imp.log.for_each_block(|block| {
                writer.write(block);
                ControlFlow::Continue(())
            });
        }
        self.end_lsn = writer.close();
        writer
    }

    /// Stamp exclusively fixed pages with the commit range and drop every pin.
    /// Latches stay held.
    fn release_blocks(&mut self) {
        let db = self.mtr.db;
        let (start, end) = (self.start_lsn, self.end_lsn);
        let pool = db.buffer_pool();

        let _ = self.imp.memo.for_each_reverse(|slot| {
            match slot.object {
                Some(MemoObject::Page(page_id)) if slot.kind.is_page_fix() => {
                    let block = resolve_block(db, page_id);
                    if slot.kind == MemoType::PageXFix {
                        pool.note_modification(&block, start, end);
                    }
                    block.unfix();
                }
                _ => {}
            }
            ControlFlow::Continue(())
        });
    }

    fn release_latches(&mut self) {
        let db = self.mtr.db;
        let _ = self.imp.memo.for_each_reverse(|slot| {
            if !slot.is_released() {
                memo_latch_release(db, slot);
            }
            ControlFlow::Continue(())
        });
    }

    /// Free the per-start state. Every slot must have been released.
    fn release_resources(mut self) {
        if cfg!(debug_assertions) {
            for slot in self.imp.memo.iter_rev() {
                assert!(
                    slot.is_released(),
                    "{:?} still held at the end of commit",
                    slot
                );
            }
        }

        self.imp.log.erase();
        self.imp.memo.erase();
        self.imp.state = MtrState::Committed;
    }
}

/// Release the pin, latch or lock held by `slot`.
pub(super) fn memo_slot_release(db: &Database, slot: &mut MemoSlot) {
    match slot.object {
        Some(MemoObject::Page(page_id)) => {
            if let Some(mode) = slot.kind.latch_mode() {
                let block = resolve_block(db, page_id);
                block.unfix();
                db.buffer_pool().release_latch(&block, mode);
            }
        }
        Some(MemoObject::Lock(_)) => unlock(db, slot),
        None => return,
    }
    release_slot(db, slot);
}

/// Release the latch or lock held by `slot`; pins were already dropped.
fn memo_latch_release(db: &Database, slot: &mut MemoSlot) {
    match slot.object {
        Some(MemoObject::Page(page_id)) => {
            if let Some(mode) = slot.kind.latch_mode() {
                let block = resolve_block(db, page_id);
                db.buffer_pool().release_latch(&block, mode);
            }
        }
        Some(MemoObject::Lock(_)) => unlock(db, slot),
        None => return,
    }
    release_slot(db, slot);
}

fn unlock(db: &Database, slot: &MemoSlot) {
    if let Some(MemoObject::Lock(lock_id)) = slot.object {
        let result = match slot.kind {
            MemoType::SLock => db.locks().s_unlock(lock_id),
            MemoType::XLock => db.locks().x_unlock(lock_id),
            kind => panic!("{} recorded as {:?}", lock_id, kind),
        };
        if let Err(e) = result {
            panic!("memo holds a lock the lock table cannot release: {}", e);
        }
    }
}

fn release_slot(db: &Database, slot: &mut MemoSlot) {
    if let Some(object) = slot.object.take() {
        db.notify_release(object, slot.kind);
    }
}

/// A page in the memo is pinned, so it is resident.
fn resolve_block(db: &Database, page_id: PageId) -> Arc<Block> {
    match db.buffer_pool().lookup(page_id) {
        Ok(block) => block,
        Err(e) => panic!("memo holds a page that is not resident: {}", e),
    }
}
