use std::ops::ControlFlow;

use bytes::{BufMut, BytesMut};

/// Bytes per log accumulator block.
pub const LOG_BLOCK_CAPACITY: usize = 512;

/// Redo bytes accumulated by one mini-transaction.
///
/// Appends fill fixed-capacity blocks in order; a group that fits in the
/// first block is eligible for the log's small-append fast path.
#[derive(Debug)]
pub struct MtrLog {
    blocks: Vec<BytesMut>,
}

impl MtrLog {
    pub fn new() -> Self {
        Self {
            blocks: vec![BytesMut::with_capacity(LOG_BLOCK_CAPACITY)],
        }
    }

    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let block = self.tail();
            let n = (LOG_BLOCK_CAPACITY - block.len()).min(data.len());
            block.put_slice(&data[..n]);
            data = &data[n..];
        }
    }

    pub fn push_u8(&mut self, byte: u8) {
        self.tail().put_u8(byte);
    }

    /// OR `flag` into the first byte of the log.
    pub fn set_first_byte_flag(&mut self, flag: u8) {
        if let Some(byte) = self.blocks.first_mut().and_then(|b| b.first_mut()) {
            *byte |= flag;
        }
    }

    /// Whether all bytes sit in the first block.
    pub fn is_small(&self) -> bool {
        self.blocks.len() == 1
    }

    pub fn size(&self) -> usize {
        self.blocks.iter().map(BytesMut::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn front(&self) -> &[u8] {
        self.blocks.first().map_or(&[][..], |b| &b[..])
    }

    pub fn for_each_block<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        for block in &self.blocks {
            if visitor(&block[..]).is_break() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    pub fn erase(&mut self) {
        self.blocks.truncate(1);
        if let Some(block) = self.blocks.first_mut() {
            block.clear();
        }
    }

    fn tail(&mut self) -> &mut BytesMut {
        let full = self
            .blocks
            .last()
            .map_or(true, |b| b.len() == LOG_BLOCK_CAPACITY);
        if full {
            self.blocks.push(BytesMut::with_capacity(LOG_BLOCK_CAPACITY));
        }
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }
}

impl Default for MtrLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_log() {
        let mut log = MtrLog::new();
        assert!(log.is_empty());
        assert!(log.is_small());

        log.append(&[1, 2, 3]);
        log.push_u8(4);
        assert_eq!(log.size(), 4);
        assert_eq!(log.front(), &[1, 2, 3, 4]);
        assert!(log.is_small());
    }

    #[test]
    fn test_append_spills_into_new_block() {
        let mut log = MtrLog::new();
        let data: Vec<u8> = (0..LOG_BLOCK_CAPACITY + 10).map(|i| i as u8).collect();
        log.append(&data);

        assert!(!log.is_small());
        assert_eq!(log.size(), data.len());
        assert_eq!(log.front().len(), LOG_BLOCK_CAPACITY);
        assert_eq!(log.to_vec(), data);

        let mut sizes = Vec::new();
        let flow = log.for_each_block(|block| {
            sizes.push(block.len());
            ControlFlow::Continue(())
        });
        assert!(flow.is_continue());
        assert_eq!(sizes, vec![LOG_BLOCK_CAPACITY, 10]);
    }

    #[test]
    fn test_push_at_block_boundary() {
        let mut log = MtrLog::new();
        log.append(&vec![0u8; LOG_BLOCK_CAPACITY]);
        assert!(log.is_small());

        log.push_u8(31);
        assert!(!log.is_small());
        assert_eq!(log.size(), LOG_BLOCK_CAPACITY + 1);
    }

    #[test]
    fn test_first_byte_flag() {
        let mut log = MtrLog::new();
        log.set_first_byte_flag(0x80);
        assert!(log.is_empty());

        log.append(&[0x1e, 0x00]);
        log.set_first_byte_flag(0x80);
        assert_eq!(log.front(), &[0x9e, 0x00]);
    }

    #[test]
    fn test_erase() {
        let mut log = MtrLog::new();
        log.append(&vec![7u8; LOG_BLOCK_CAPACITY * 3]);
        log.erase();
        assert!(log.is_empty());
        assert!(log.is_small());
    }
}
