//! Page writes and the redo records describing them.

use std::sync::Arc;

use bytes::BytesMut;

use super::{LogMode, MemoType, Mtr};
use crate::storage::wal::{encode_header, RECORD_HEADER_SIZE};
use crate::storage::{Block, LatchMode, MlogType, PageId, StorageError, StorageResult, PAGE_SIZE};

impl<'db> Mtr<'db> {
    /// Append one redo record to the group.
    ///
    /// The mini-transaction counts as modifying whatever the log mode; the
    /// bytes are kept only in `LogMode::All`.
    pub fn log_record(&mut self, rec_type: MlogType, page_id: PageId, offset: u16, payload: &[u8]) {
        self.log_record_header(rec_type, page_id, offset, payload.len());
        self.log_catenate(payload);
    }

    /// Open a record whose `payload_len` bytes follow through
    /// [`Mtr::log_catenate`].
    pub fn log_record_header(
        &mut self,
        rec_type: MlogType,
        page_id: PageId,
        offset: u16,
        payload_len: usize,
    ) {
        self.set_modified();
        let imp = self.active_mut();
        if imp.log_mode != LogMode::All {
            return;
        }
        debug_assert_eq!(
            imp.pending_payload, 0,
            "record opened before the previous payload was complete"
        );

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE);
        encode_header(&mut buf, rec_type, page_id, offset, payload_len);
        imp.log.append(&buf);
        imp.n_log_recs += 1;
        imp.pending_payload = payload_len;
    }

    /// Append payload bytes to the record opened by
    /// [`Mtr::log_record_header`]. They may arrive in several pieces but must
    /// not exceed the declared length.
    pub fn log_catenate(&mut self, data: &[u8]) {
        let imp = self.active_mut();
        if imp.log_mode != LogMode::All {
            return;
        }
        assert!(
            data.len() <= imp.pending_payload,
            "catenated {} bytes past the declared record payload",
            data.len() - imp.pending_payload
        );
        imp.log.append(data);
        imp.pending_payload -= data.len();
    }

    pub fn write_u8(&mut self, page_id: PageId, offset: usize, value: u8) -> StorageResult<()> {
        self.write_logged(page_id, offset, &[value], MlogType::Write1Byte)
    }

    pub fn write_u16(&mut self, page_id: PageId, offset: usize, value: u16) -> StorageResult<()> {
        self.write_logged(page_id, offset, &value.to_be_bytes(), MlogType::Write2Bytes)
    }

    pub fn write_u32(&mut self, page_id: PageId, offset: usize, value: u32) -> StorageResult<()> {
        self.write_logged(page_id, offset, &value.to_be_bytes(), MlogType::Write4Bytes)
    }

    pub fn write_u64(&mut self, page_id: PageId, offset: usize, value: u64) -> StorageResult<()> {
        self.write_logged(page_id, offset, &value.to_be_bytes(), MlogType::Write8Bytes)
    }

    /// Write `data` into the page and log it as one string record.
    pub fn write_bytes(&mut self, page_id: PageId, offset: usize, data: &[u8]) -> StorageResult<()> {
        self.write_logged(page_id, offset, data, MlogType::WriteString)
    }

    /// Fix and exclusively latch a page, zero it and log its creation.
    pub fn create_page(&mut self, page_id: PageId) -> StorageResult<Arc<Block>> {
        self.check_write_allowed()?;
        let block = self.get_page(page_id, LatchMode::Exclusive)?;
        block.write_bytes(0, &[0u8; PAGE_SIZE])?;
        self.memo_modify_page(page_id);
        self.log_record(MlogType::PageCreate, page_id, 0, &[]);
        Ok(block)
    }

    /// Log that an exclusively latched page was freed.
    pub fn free_page(&mut self, page_id: PageId) -> StorageResult<()> {
        self.check_write_allowed()?;
        self.db.buffer_pool().lookup(page_id)?;
        self.memo_modify_page(page_id);
        self.log_record(MlogType::PageFree, page_id, 0, &[]);
        self.add_freed_page();
        Ok(())
    }

    fn write_logged(
        &mut self,
        page_id: PageId,
        offset: usize,
        data: &[u8],
        rec_type: MlogType,
    ) -> StorageResult<()> {
        self.check_write_allowed()?;
        debug_assert!(
            self.memo_contains_page(page_id, MemoType::PageXFix),
            "write to {} without an exclusive latch",
            page_id
        );

        let block = self.db.buffer_pool().lookup(page_id)?;
        block.write_bytes(offset, data)?;
        self.memo_modify_page(page_id);
        // In bounds of an 8KiB page, so the offset fits.
        self.log_record(rec_type, page_id, offset as u16, data);
        Ok(())
    }

    fn check_write_allowed(&self) -> StorageResult<()> {
        if self.db.log().is_write_allowed() {
            Ok(())
        } else {
            Err(StorageError::LogClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::storage::{parse_group, parse_groups, RedoRecord, LSN};

    #[test]
    fn test_write_u16_updates_page_and_log() {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();

        let block = mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        mtr.write_u16(PageId(1), 10, 0xbeef).unwrap();

        assert_eq!(block.read_bytes(10, 2).unwrap(), vec![0xbe, 0xef]);
        assert!(mtr.has_modifications());
        assert!(mtr.memo_contains_page(PageId(1), MemoType::Modify));
        assert_eq!(mtr.n_log_recs(), 1);
        assert_eq!(mtr.log_size(), 9 + 2);
        mtr.commit();
    }

    #[test]
    fn test_modify_slot_pushed_once() {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        mtr.write_u8(PageId(1), 0, 1).unwrap();
        mtr.write_u8(PageId(1), 1, 2).unwrap();

        assert_eq!(mtr.n_log_recs(), 2);
        assert_eq!(mtr.memo_size(), 2 * std::mem::size_of::<crate::mtr::MemoSlot>());
        mtr.commit();
    }

    #[test]
    fn test_single_record_group() {
        let db = Database::in_memory(16);
        let start = db.log().current_lsn();
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(3), LatchMode::Exclusive).unwrap();
        mtr.write_bytes(PageId(3), 100, b"hello").unwrap();
        mtr.commit();

        let bytes = db.log().read(start, mtr.commit_lsn()).unwrap();
        let group = parse_group(&bytes).unwrap();
        assert!(group.single);
        assert_eq!(group.len, bytes.len());
        assert_eq!(
            group.records,
            vec![RedoRecord::new(MlogType::WriteString, PageId(3), 100, b"hello")]
        );
    }

    #[test]
    fn test_multi_record_group() {
        let db = Database::in_memory(16);
        let start = db.log().current_lsn();
        let mut mtr = db.start_mtr();

        mtr.create_page(PageId(4)).unwrap();
        mtr.write_u32(PageId(4), 0, 7).unwrap();
        mtr.write_u64(PageId(4), 8, u64::MAX).unwrap();
        mtr.commit();

        let bytes = db.log().read(start, mtr.commit_lsn()).unwrap();
        assert_eq!(bytes.last(), Some(&(MlogType::MultiRecEnd as u8)));
        let group = parse_group(&bytes).unwrap();
        assert!(!group.single);
        let types: Vec<_> = group.records.iter().map(|r| r.rec_type).collect();
        assert_eq!(
            types,
            vec![MlogType::PageCreate, MlogType::Write4Bytes, MlogType::Write8Bytes]
        );
    }

    #[test]
    fn test_log_mode_none_keeps_no_bytes() {
        let db = Database::in_memory(16);
        let start = db.log().current_lsn();
        let mut mtr = db.start_mtr();
        mtr.set_log_mode(LogMode::None);

        let block = mtr.get_page(PageId(2), LatchMode::Exclusive).unwrap();
        mtr.write_u8(PageId(2), 0, 9).unwrap();
        assert!(mtr.has_modifications());
        assert_eq!(mtr.n_log_recs(), 0);
        assert_eq!(mtr.log_size(), 0);
        mtr.commit();

        // Nothing reached the log and the page did not join the flush list.
        assert_eq!(db.log().current_lsn(), start);
        assert!(block.oldest_modification().is_invalid());
        assert_eq!(block.read_bytes(0, 1).unwrap(), vec![9]);
    }

    #[test]
    fn test_catenate_fills_declared_payload() {
        let db = Database::in_memory(16);
        let start = db.log().current_lsn();
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        mtr.log_record_header(MlogType::WriteString, PageId(1), 0, 3);
        mtr.log_catenate(b"ab");
        mtr.log_catenate(b"c");
        assert_eq!(mtr.n_log_recs(), 1);
        assert_eq!(mtr.log_size(), 9 + 3);
        mtr.commit();

        let bytes = db.log().read(start, mtr.commit_lsn()).unwrap();
        let group = parse_group(&bytes).unwrap();
        assert_eq!(group.len, bytes.len());
        assert_eq!(
            group.records,
            vec![RedoRecord::new(MlogType::WriteString, PageId(1), 0, b"abc")]
        );
        assert_eq!(parse_groups(&bytes).unwrap().len(), 1);
    }

    #[test]
    #[should_panic(expected = "past the declared record payload")]
    fn test_catenate_beyond_declared_payload() {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        mtr.log_record(MlogType::WriteString, PageId(1), 0, &[]);
        mtr.log_catenate(b"abc");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "shorter than its header declares")]
    fn test_commit_with_incomplete_payload() {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        mtr.log_record_header(MlogType::WriteString, PageId(1), 0, 4);
        mtr.log_catenate(b"ab");
        mtr.commit();
    }

    #[test]
    fn test_free_page() {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(6), LatchMode::Exclusive).unwrap();
        mtr.free_page(PageId(6)).unwrap();
        assert_eq!(mtr.n_freed_pages(), 1);
        assert_eq!(mtr.n_log_recs(), 1);
        mtr.commit();
        assert!(mtr.commit_lsn() > LSN::new());
    }

    #[test]
    fn test_write_out_of_page_bounds() {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();

        mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        let result = mtr.write_u32(PageId(1), PAGE_SIZE - 2, 1);
        assert!(matches!(result, Err(StorageError::PageOverflow { .. })));
        assert!(!mtr.has_modifications());
        mtr.commit();
    }

    #[test]
    fn test_write_after_shutdown() {
        let db = Database::in_memory(16);
        db.shutdown().unwrap();

        let mut mtr = db.start_mtr();
        mtr.get_page(PageId(1), LatchMode::Exclusive).unwrap();
        let result = mtr.write_u8(PageId(1), 0, 1);
        assert!(matches!(result, Err(StorageError::LogClosed)));
        mtr.commit();
    }
}
