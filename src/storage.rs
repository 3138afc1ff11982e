//! Storage layer collaborators of the mini-transaction engine.
//!
//! - **BufferPool**: in-memory page cache with per-page pin counts, page
//!   latches and an LSN-ordered flush list
//! - **LogManager**: the redo log, assigning LSN ranges and appending
//!   mini-transaction log groups in order
//! - **record**: byte layout of the redo records callers produce
//!
//! Page eviction, on-disk page I/O and log replay are not part of this layer.

pub mod buffer;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPool, Block, LatchMode};
pub use error::{StorageError, StorageResult};
pub use page::{PageId, PAGE_SIZE};
pub use wal::{
    parse_group, parse_groups, LogConfig, LogManager, LogStats, LogWriter, MlogType, RedoGroup,
    RedoRecord, LOG_START_LSN, LSN, SINGLE_REC_FLAG,
};
