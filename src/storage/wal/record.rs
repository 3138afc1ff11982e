//! Redo record layout.
//!
//! A mini-transaction writes its records as one group. A record is
//!
//! ```text
//! type:u8 | page_id:u32 | offset:u16 | len:u16 | payload[len]
//! ```
//!
//! with all integers big-endian. A group holding one record has
//! `SINGLE_REC_FLAG` OR-ed into that record's type byte. A group holding
//! more records ends with a lone `MlogType::MultiRecEnd` byte.

use std::fmt;
use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PageId;

/// Log Sequence Number: a byte position in the redo log.
/// LSNs are monotonically increasing and used to order log groups and
/// dirty pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LSN(pub u64);

impl LSN {
    /// Create a new LSN with value 0.
    pub fn new() -> Self {
        LSN(0)
    }

    /// The LSN `len` bytes further into the log.
    pub fn advance(&self, len: usize) -> Self {
        LSN(self.0 + len as u64)
    }

    /// Check if this is an invalid LSN (0).
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for LSN {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// Flag OR-ed into the type byte of the only record of a group.
pub const SINGLE_REC_FLAG: u8 = 0x80;

/// Bytes preceding the payload of a record.
pub const RECORD_HEADER_SIZE: usize = 9;

/// Redo record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MlogType {
    /// One byte written at an offset.
    Write1Byte = 1,
    /// Two bytes written at an offset.
    Write2Bytes = 2,
    /// Four bytes written at an offset.
    Write4Bytes = 4,
    /// Eight bytes written at an offset.
    Write8Bytes = 8,
    /// A page was initialised.
    PageCreate = 19,
    /// A page was freed.
    PageFree = 20,
    /// An arbitrary byte string written at an offset.
    WriteString = 30,
    /// Terminates a multi-record group.
    MultiRecEnd = 31,
}

impl MlogType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Write1Byte),
            2 => Some(Self::Write2Bytes),
            4 => Some(Self::Write4Bytes),
            8 => Some(Self::Write8Bytes),
            19 => Some(Self::PageCreate),
            20 => Some(Self::PageFree),
            30 => Some(Self::WriteString),
            31 => Some(Self::MultiRecEnd),
            _ => None,
        }
    }
}

/// One decoded redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRecord {
    pub rec_type: MlogType,
    pub page_id: PageId,
    pub offset: u16,
    pub payload: Vec<u8>,
}

impl RedoRecord {
    pub fn new(rec_type: MlogType, page_id: PageId, offset: u16, payload: &[u8]) -> Self {
        Self {
            rec_type,
            page_id,
            offset,
            payload: payload.to_vec(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        encode_header(buf, self.rec_type, self.page_id, self.offset, self.payload.len());
        buf.put_slice(&self.payload);
    }
}

/// Write a record header for a payload of `len` bytes.
pub fn encode_header<B: BufMut>(
    buf: &mut B,
    rec_type: MlogType,
    page_id: PageId,
    offset: u16,
    len: usize,
) {
    debug_assert!(rec_type != MlogType::MultiRecEnd);
    debug_assert!(len <= u16::MAX as usize);
    buf.put_u8(rec_type as u8);
    buf.put_u32(page_id.0);
    buf.put_u16(offset);
    buf.put_u16(len as u16);
}

/// A decoded mini-transaction log group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoGroup {
    pub records: Vec<RedoRecord>,
    /// The group carried `SINGLE_REC_FLAG` instead of an end marker.
    pub single: bool,
    /// Encoded length of the group in bytes.
    pub len: usize,
}

/// Decode the group starting at the beginning of `data`.
pub fn parse_group(data: &[u8]) -> StorageResult<RedoGroup> {
    let mut cursor = Cursor::new(data);
    let mut records = Vec::new();

    let first = read_type(&mut cursor)?;
    if first & SINGLE_REC_FLAG != 0 {
        records.push(read_record(&mut cursor, first & !SINGLE_REC_FLAG)?);
        return Ok(RedoGroup {
            records,
            single: true,
            len: cursor.position() as usize,
        });
    }

    let mut type_byte = first;
    loop {
        if type_byte == MlogType::MultiRecEnd as u8 {
            break;
        }
        records.push(read_record(&mut cursor, type_byte)?);
        type_byte = read_type(&mut cursor)?;
    }

    Ok(RedoGroup {
        records,
        single: false,
        len: cursor.position() as usize,
    })
}

/// Decode consecutive groups until `data` is exhausted.
pub fn parse_groups(data: &[u8]) -> StorageResult<Vec<RedoGroup>> {
    let mut groups = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let group = parse_group(&data[offset..]).map_err(|e| match e {
            StorageError::MalformedRecord { offset: inner, reason } => {
                StorageError::MalformedRecord {
                    offset: offset + inner,
                    reason,
                }
            }
            other => other,
        })?;
        offset += group.len;
        groups.push(group);
    }
    Ok(groups)
}

fn read_type(cursor: &mut Cursor<&[u8]>) -> StorageResult<u8> {
    let offset = cursor.position() as usize;
    cursor
        .read_u8()
        .map_err(|e| malformed(offset, format!("missing record type: {}", e)))
}

fn read_record(cursor: &mut Cursor<&[u8]>, type_byte: u8) -> StorageResult<RedoRecord> {
    let start = cursor.position() as usize - 1;
    let rec_type = match MlogType::from_u8(type_byte) {
        Some(MlogType::MultiRecEnd) | None => {
            return Err(malformed(start, format!("unexpected record type {}", type_byte)))
        }
        Some(rec_type) => rec_type,
    };

    read_body(cursor, rec_type)
        .map_err(|e| malformed(start, format!("truncated record: {}", e)))
}

fn read_body(cursor: &mut Cursor<&[u8]>, rec_type: MlogType) -> io::Result<RedoRecord> {
    let page_id = PageId(cursor.read_u32::<BigEndian>()?);
    let offset = cursor.read_u16::<BigEndian>()?;
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let mut payload = vec![0u8; len];
    cursor.read_exact(&mut payload)?;
    Ok(RedoRecord {
        rec_type,
        page_id,
        offset,
        payload,
    })
}

fn malformed(offset: usize, reason: String) -> StorageError {
    StorageError::MalformedRecord { offset, reason }
}
