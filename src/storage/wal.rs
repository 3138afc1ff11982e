//! Redo log module.
//!
//! This module implements the redo log collaborator of the mini-transaction
//! engine:
//! - LSN assignment for mini-transaction log groups (fast and slow path)
//! - The log buffer and its flushing to a log file or in-memory archive
//! - The flush-order mutex that keeps the flush list in LSN order
//! - The byte layout of redo records and log groups

pub mod manager;
pub mod record;

pub use manager::{read_log_file, LogConfig, LogManager, LogStats, LogWriter, LOG_START_LSN};
pub use record::{
    encode_header, parse_group, parse_groups, MlogType, RedoGroup, RedoRecord, LSN,
    RECORD_HEADER_SIZE, SINGLE_REC_FLAG,
};
