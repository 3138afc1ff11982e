//! Concurrency primitives shared by the page cache and the mini-transaction
//! engine.
//!
//! - `RwLatch`: a reader/writer latch that can be held across calls without a
//!   guard, so a memo slot can record it and release it later
//! - `LockTable`: registry of named reader/writer locks (index tree locks,
//!   tablespace latches) addressed by `LockId`

pub mod lock;

pub use lock::{LockId, LockTable, RwLatch};
