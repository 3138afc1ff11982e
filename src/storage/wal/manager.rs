//! Redo log manager.
//!
//! The log manager owns the single ordered log. Every mini-transaction that
//! commits with redo takes the log mutex through a [`LogWriter`], receives a
//! contiguous LSN range and appends its group to the log buffer. The buffer is
//! written to the log sink (a file or an in-memory archive) by `flush`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::BytesMut;
use log::{debug, error, trace};
use parking_lot::{Mutex, MutexGuard};

use super::record::LSN;
use crate::storage::error::{StorageError, StorageResult};

/// First LSN handed out. Keeps every assigned LSN non-zero.
pub const LOG_START_LSN: LSN = LSN(8192);

/// Name of the redo log file inside `LogConfig::log_dir`.
const LOG_FILE_NAME: &str = "redo.log";

/// Log manager configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the log file. `None` keeps flushed bytes in memory.
    pub log_dir: Option<PathBuf>,
    /// Size of the log buffer; a region that would overflow it flushes first.
    pub buffer_size: usize,
    /// Log block size. The small-log fast path never crosses a block boundary.
    pub block_size: usize,
    /// Whether the small-log fast path is enabled.
    pub fast_path: bool,
    /// Whether to fsync the log file on every flush.
    pub sync_on_flush: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_dir: None,
            buffer_size: 1024 * 1024, // 1MB
            block_size: 512,
            fast_path: true,
            sync_on_flush: true,
        }
    }
}

/// Counters describing how the log has been used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Groups appended through the fast path.
    pub fast_appends: u64,
    /// Regions opened and closed through the slow path.
    pub slow_appends: u64,
    /// Bytes appended to the log.
    pub bytes_written: u64,
    /// Buffer flushes to the sink.
    pub flushes: u64,
}

enum LogSink {
    Memory(Vec<u8>),
    File(LogFile),
}

struct LogFile {
    file: BufWriter<File>,
    path: PathBuf,
    /// Bytes known to have reached the file.
    written: u64,
}

impl LogFile {
    fn create(path: PathBuf) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        Ok(LogFile {
            file: BufWriter::new(file),
            path,
            written: 0,
        })
    }

    fn append(&mut self, data: &[u8], sync: bool) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()?;
        if sync {
            self.file.get_ref().sync_data()?;
        }
        self.written += data.len() as u64;
        Ok(())
    }

    /// Cut the file back to `written` bytes and drop anything still buffered,
    /// so a retried append does not duplicate a partial write.
    fn rollback(&mut self) -> io::Result<()> {
        let fresh = BufWriter::new(self.file.get_ref().try_clone()?);
        let (file, _unwritten) = std::mem::replace(&mut self.file, fresh).into_parts();
        file.set_len(self.written)?;
        self.file.get_mut().seek(SeekFrom::Start(self.written))?;
        Ok(())
    }
}

impl LogSink {
    fn append(&mut self, data: &[u8], sync: bool) -> StorageResult<()> {
        match self {
            LogSink::Memory(archive) => archive.extend_from_slice(data),
            LogSink::File(log_file) => {
                if let Err(e) = log_file.append(data, sync) {
                    if let Err(rollback) = log_file.rollback() {
                        error!("failed to roll back redo log file: {}", rollback);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Read `len` bytes starting `offset` bytes after `LOG_START_LSN`.
    fn read(&mut self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        match self {
            LogSink::Memory(archive) => {
                let start = offset as usize;
                Ok(archive[start..start + len].to_vec())
            }
            LogSink::File(log_file) => {
                log_file.file.flush()?;
                let mut file = File::open(&log_file.path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut data = vec![0u8; len];
                file.read_exact(&mut data)?;
                Ok(data)
            }
        }
    }
}

/// State protected by the log mutex.
struct LogState {
    /// Next LSN to assign.
    lsn: LSN,
    /// LSN of the first byte in `buf`.
    buf_start_lsn: LSN,
    /// Appended bytes not yet written to the sink.
    buf: BytesMut,
    /// Start of the region opened by the slow path, if any.
    region_start: Option<LSN>,
    /// Bytes reserved by the open region.
    region_reserved: usize,
    sink: LogSink,
    stats: LogStats,
}

impl LogState {
    /// Write the whole buffer to the sink.
    fn write_buffer(&mut self, sync: bool) -> StorageResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.buf, sync)?;
        self.buf_start_lsn = self.lsn;
        self.buf.clear();
        self.stats.flushes += 1;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.lsn = self.lsn.advance(data.len());
        self.stats.bytes_written += data.len() as u64;
    }
}

/// The redo log.
pub struct LogManager {
    config: LogConfig,
    state: Mutex<LogState>,
    /// Orders dirty-page insertion by LSN; see `flush_order_lock`.
    flush_order: Mutex<()>,
    /// All bytes below this LSN have reached the sink.
    flushed_lsn: AtomicU64,
    write_allowed: AtomicBool,
}

impl LogManager {
    /// Create a log manager. With a `log_dir` the log file is created (or
    /// truncated) inside it.
    pub fn new(config: LogConfig) -> StorageResult<Self> {
        let sink = match &config.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(LOG_FILE_NAME);
                debug!("redo log file {:?}", path);
                LogSink::File(LogFile::create(path)?)
            }
            None => LogSink::Memory(Vec::new()),
        };

        Ok(Self::with_sink(config, sink))
    }

    /// Create a log manager that keeps flushed bytes in memory.
    pub fn in_memory() -> Self {
        Self::with_sink(LogConfig::default(), LogSink::Memory(Vec::new()))
    }

    fn with_sink(config: LogConfig, sink: LogSink) -> Self {
        LogManager {
            state: Mutex::new(LogState {
                lsn: LOG_START_LSN,
                buf_start_lsn: LOG_START_LSN,
                buf: BytesMut::with_capacity(config.buffer_size),
                region_start: None,
                region_reserved: 0,
                sink,
                stats: LogStats::default(),
            }),
            config,
            flush_order: Mutex::new(()),
            flushed_lsn: AtomicU64::new(LOG_START_LSN.0),
            write_allowed: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Path of the log file, if the log is file backed.
    pub fn path(&self) -> Option<PathBuf> {
        match &self.state.lock().sink {
            LogSink::File(log_file) => Some(log_file.path.clone()),
            LogSink::Memory(_) => None,
        }
    }

    /// Take the log mutex. The returned writer holds it until dropped.
    pub fn lock(&self) -> LogWriter<'_> {
        LogWriter {
            log: self,
            state: self.state.lock(),
        }
    }

    /// Take the flush-order mutex.
    ///
    /// A committing mini-transaction that dirties a clean page takes this
    /// mutex before releasing the log mutex and holds it while inserting into
    /// the flush list, so flush list order agrees with LSN order.
    pub fn flush_order_lock(&self) -> MutexGuard<'_, ()> {
        self.flush_order.lock()
    }

    /// Get the next LSN to be assigned.
    pub fn current_lsn(&self) -> LSN {
        self.state.lock().lsn
    }

    /// Get the flush LSN - all bytes below it have reached the sink.
    pub fn flushed_lsn(&self) -> LSN {
        LSN(self.flushed_lsn.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }

    pub fn is_write_allowed(&self) -> bool {
        self.write_allowed.load(Ordering::Acquire)
    }

    /// Write the log buffer to the sink.
    pub fn flush(&self) -> StorageResult<LSN> {
        let mut state = self.state.lock();
        state.write_buffer(self.config.sync_on_flush)?;
        let lsn = state.lsn;
        self.flushed_lsn.store(lsn.0, Ordering::Release);
        trace!("log flushed up to {}", lsn);
        Ok(lsn)
    }

    /// Make sure every byte below `lsn` has reached the sink.
    pub fn flush_up_to(&self, lsn: LSN) -> StorageResult<()> {
        if self.flushed_lsn() >= lsn {
            return Ok(());
        }
        self.flush()?;
        Ok(())
    }

    /// Read the bytes of the LSN range `start..end`.
    pub fn read(&self, start: LSN, end: LSN) -> StorageResult<Vec<u8>> {
        let mut state = self.state.lock();
        if start < LOG_START_LSN || start > end || end > state.lsn {
            return Err(StorageError::LsnOutOfRange { start, end });
        }

        let mut data = Vec::with_capacity((end.0 - start.0) as usize);
        let buf_start = state.buf_start_lsn;

        if start < buf_start {
            let sink_end = end.min(buf_start);
            let offset = start.0 - LOG_START_LSN.0;
            let len = (sink_end.0 - start.0) as usize;
            data.extend_from_slice(&state.sink.read(offset, len)?);
        }
        if end > buf_start {
            let from = (start.max(buf_start).0 - buf_start.0) as usize;
            let to = (end.0 - buf_start.0) as usize;
            data.extend_from_slice(&state.buf[from..to]);
        }
        Ok(data)
    }

    /// Flush the log and refuse further writes.
    pub fn shutdown(&self) -> StorageResult<LSN> {
        let lsn = self.flush()?;
        self.write_allowed.store(false, Ordering::Release);
        debug!("redo log shut down at {}", lsn);
        Ok(lsn)
    }
}

/// Holder of the log mutex.
///
/// Dropping the writer releases the mutex.
pub struct LogWriter<'a> {
    log: &'a LogManager,
    state: MutexGuard<'a, LogState>,
}

impl<'a> LogWriter<'a> {
    /// Fast path: append the first `len` bytes of `data` and return the
    /// assigned range in one step.
    ///
    /// Declines with `None` when the fast path is disabled, when the bytes
    /// would cross a log block boundary, or when the buffer has no room.
    pub fn append_small(&mut self, data: &[u8], len: usize) -> Option<(LSN, LSN)> {
        debug_assert!(len <= data.len());
        debug_assert!(self.state.region_start.is_none());

        let config = &self.log.config;
        if !config.fast_path {
            return None;
        }
        let block_offset = ((self.state.lsn.0 - LOG_START_LSN.0) % config.block_size as u64) as usize;
        if block_offset + len > config.block_size {
            return None;
        }
        if self.state.buf.len() + len > config.buffer_size {
            return None;
        }

        let start_lsn = self.state.lsn;
        self.state.append(&data[..len]);
        self.state.stats.fast_appends += 1;
        Some((start_lsn, self.state.lsn))
    }

    /// Slow path: open a region of `size` bytes and return its start LSN.
    pub fn open(&mut self, size: usize) -> LSN {
        debug_assert!(self.state.region_start.is_none());

        if self.state.buf.len() + size > self.log.config.buffer_size {
            match self.state.write_buffer(self.log.config.sync_on_flush) {
                Ok(()) => {
                    let lsn = self.state.lsn;
                    self.log.flushed_lsn.store(lsn.0, Ordering::Release);
                }
                // The bytes stay buffered; the next flush retries.
                Err(e) => error!("failed to write redo log buffer: {}", e),
            }
        }

        let start_lsn = self.state.lsn;
        self.state.region_start = Some(start_lsn);
        self.state.region_reserved = size;
        start_lsn
    }

    /// Append bytes to the open region.
    pub fn write(&mut self, data: &[u8]) {
        debug_assert!(self.state.region_start.is_some());
        self.state.append(data);
        debug_assert!(self.region_written() <= self.state.region_reserved);
    }

    /// Close the open region and return its end LSN.
    pub fn close(&mut self) -> LSN {
        let start_lsn = self.state.region_start.take();
        debug_assert!(start_lsn.is_some());
        self.state.region_reserved = 0;
        self.state.stats.slow_appends += 1;
        self.state.lsn
    }

    /// Release the log mutex.
    pub fn release(self) {}

    fn region_written(&self) -> usize {
        match self.state.region_start {
            Some(start) => (self.state.lsn.0 - start.0) as usize,
            None => 0,
        }
    }
}

impl Drop for LogWriter<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.state.region_start.is_none() || std::thread::panicking(),
            "log region released while still open"
        );
    }
}

/// Open the log file at `path` read-only and return its whole contents.
pub fn read_log_file(path: &Path) -> StorageResult<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}
