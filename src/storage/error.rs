//! Storage layer error types.

use thiserror::Error;

use crate::concurrency::lock::LockId;
use crate::storage::page::PageId;
use crate::storage::wal::LSN;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{page_id} is outside the buffer pool (capacity: {capacity} pages)")]
    PageOutOfRange { page_id: PageId, capacity: usize },

    #[error("{0} is not in the buffer pool")]
    PageNotFound(PageId),

    #[error("Access of {len} bytes at offset {offset} overflows the page")]
    PageOverflow { offset: usize, len: usize },

    #[error("Unknown lock: {0}")]
    LockNotFound(LockId),

    #[error("LSN range {start}..{end} is not available in the redo log")]
    LsnOutOfRange { start: LSN, end: LSN },

    #[error("Malformed redo record at offset {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },

    #[error("Redo log is closed for writing")]
    LogClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
