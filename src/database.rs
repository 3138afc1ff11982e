use crate::concurrency::LockTable;
use crate::mtr::{MemoObject, MemoType, Mtr};
use crate::storage::{BufferPool, LatchMode, LogConfig, LogManager, LSN};
use anyhow::{bail, Result};
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback invoked whenever a mini-transaction releases a memo slot.
pub type ReleaseHook = Arc<dyn Fn(MemoObject, MemoType) + Send + Sync>;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub log: LogConfig,
    /// Number of page frames in the buffer pool
    pub buffer_pool_pages: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            buffer_pool_pages: 1024,
        }
    }
}

/// The collaborators a mini-transaction works against: the redo log, the
/// buffer pool and the named lock table.
pub struct Database {
    log: LogManager,
    buffer_pool: BufferPool,
    locks: LockTable,
    release_hook: RwLock<Option<ReleaseHook>>,
}

impl Database {
    /// Open a database with the given configuration
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        if config.buffer_pool_pages == 0 {
            bail!("Buffer pool must hold at least one page");
        }
        if let Some(dir) = &config.log.log_dir {
            if !dir.is_dir() {
                bail!("Log directory does not exist at {:?}", dir);
            }
        }

        let log = LogManager::new(config.log)?;
        info!(
            "Database opened with {} buffer pool pages, log at {:?}",
            config.buffer_pool_pages,
            log.path()
        );
        Ok(Self::with_log(log, config.buffer_pool_pages))
    }

    /// Create a database whose log lives in memory
    pub fn in_memory(buffer_pool_pages: usize) -> Self {
        Self::with_log(LogManager::in_memory(), buffer_pool_pages)
    }

    fn with_log(log: LogManager, buffer_pool_pages: usize) -> Self {
        Self {
            log,
            buffer_pool: BufferPool::new(buffer_pool_pages),
            locks: LockTable::new(),
            release_hook: RwLock::new(None),
        }
    }

    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Start a read-write mini-transaction
    pub fn start_mtr(&self) -> Mtr<'_> {
        let mut mtr = Mtr::new(self);
        mtr.start(false, false);
        mtr
    }

    /// Start a mini-transaction that will not modify pages
    pub fn start_read_only_mtr(&self) -> Mtr<'_> {
        let mut mtr = Mtr::new(self);
        mtr.start(false, true);
        mtr
    }

    /// Install or clear the release hook
    pub fn set_release_hook(&self, hook: Option<ReleaseHook>) {
        *self.release_hook.write() = hook;
    }

    pub(crate) fn notify_release(&self, object: MemoObject, kind: MemoType) {
        if let Some(hook) = self.release_hook.read().as_ref() {
            hook(object, kind);
        }
    }

    /// Write back dirty pages whose oldest modification is below `limit`
    /// (all dirty pages if `None`), oldest first.
    ///
    /// The log is flushed past a page's newest modification before the page
    /// is marked clean. The caller must not hold page latches.
    pub fn flush_dirty_pages(&self, limit: Option<LSN>) -> Result<usize> {
        let mut flushed = 0;
        for (page_id, oldest) in self.buffer_pool.flush_list() {
            if limit.map_or(false, |limit| oldest >= limit) {
                break;
            }

            let block = self.buffer_pool.fix(page_id)?;
            block.latch(LatchMode::Shared);
            let result = self.log.flush_up_to(block.newest_modification());
            if result.is_ok() {
                self.buffer_pool.mark_clean(&block);
            }
            self.buffer_pool.release_latch(&block, LatchMode::Shared);
            block.unfix();

            result?;
            flushed += 1;
        }

        debug!("Flushed {} dirty pages", flushed);
        Ok(flushed)
    }

    /// LSN below which every change is reflected in clean pages
    pub fn checkpoint_lsn(&self) -> LSN {
        self.buffer_pool
            .oldest_modification()
            .unwrap_or_else(|| self.log.current_lsn())
    }

    /// Flush every dirty page and close the log for writing
    pub fn shutdown(&self) -> Result<LSN> {
        self.flush_dirty_pages(None)?;
        let lsn = self.log.shutdown()?;
        info!("Database shut down at {}", lsn);
        Ok(lsn)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.log.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageId, LOG_START_LSN};
    use parking_lot::Mutex;
    use tempfile::tempdir;

    #[test]
    fn test_open_with_log_dir() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            log: LogConfig {
                log_dir: Some(dir.path().to_path_buf()),
                ..LogConfig::default()
            },
            buffer_pool_pages: 8,
        };

        let db = Database::open(config)?;
        assert!(db.log().path().is_some());
        assert_eq!(db.buffer_pool().capacity(), 8);
        assert_eq!(db.log().current_lsn(), LOG_START_LSN);
        Ok(())
    }

    #[test]
    fn test_open_missing_log_dir() -> Result<()> {
        let dir = tempdir()?;
        let config = DatabaseConfig {
            log: LogConfig {
                log_dir: Some(dir.path().join("missing")),
                ..LogConfig::default()
            },
            ..DatabaseConfig::default()
        };

        let result = Database::open(config);
        assert!(result.is_err());
        let err_msg = result.err().unwrap().to_string();
        assert!(err_msg.contains("does not exist"));
        Ok(())
    }

    #[test]
    fn test_open_empty_buffer_pool() {
        let config = DatabaseConfig {
            buffer_pool_pages: 0,
            ..DatabaseConfig::default()
        };
        assert!(Database::open(config).is_err());
    }

    #[test]
    fn test_flush_dirty_pages() -> Result<()> {
        let db = Database::in_memory(16);

        for n in 0..3 {
            let mut mtr = db.start_mtr();
            mtr.get_page(PageId(n), LatchMode::Exclusive)?;
            mtr.write_u32(PageId(n), 0, n)?;
            mtr.commit();
        }
        assert_eq!(db.buffer_pool().dirty_page_count(), 3);
        let oldest = db.checkpoint_lsn();

        // Only the first page was dirtied below the second page's LSN.
        let second = db.buffer_pool().flush_list()[1].1;
        assert_eq!(db.flush_dirty_pages(Some(second))?, 1);
        assert!(db.log().flushed_lsn() > oldest);
        assert_eq!(db.checkpoint_lsn(), second);

        assert_eq!(db.flush_dirty_pages(None)?, 2);
        assert_eq!(db.buffer_pool().dirty_page_count(), 0);
        assert_eq!(db.checkpoint_lsn(), db.log().current_lsn());
        Ok(())
    }

    #[test]
    fn test_release_hook() {
        let db = Database::in_memory(16);
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let hook: ReleaseHook = Arc::new(move |object: MemoObject, kind: MemoType| {
            sink.lock().push((object, kind));
        });
        db.set_release_hook(Some(hook));

        let mut mtr = db.start_read_only_mtr();
        assert!(mtr.is_read_only());
        mtr.get_page(PageId(1), LatchMode::Shared).unwrap();
        mtr.get_page(PageId(2), LatchMode::NoLatch).unwrap();
        mtr.commit();

        assert_eq!(
            *released.lock(),
            vec![
                (MemoObject::Page(PageId(2)), MemoType::BufFix),
                (MemoObject::Page(PageId(1)), MemoType::PageSFix),
            ]
        );

        db.set_release_hook(None);
        let mut mtr = db.start_mtr();
        mtr.get_page(PageId(1), LatchMode::Shared).unwrap();
        mtr.commit();
        assert_eq!(released.lock().len(), 2);
    }

    #[test]
    fn test_shutdown() -> Result<()> {
        let db = Database::in_memory(16);
        let mut mtr = db.start_mtr();
        mtr.get_page(PageId(0), LatchMode::Exclusive)?;
        mtr.write_u8(PageId(0), 0, 1)?;
        mtr.commit();

        let lsn = db.shutdown()?;
        assert_eq!(lsn, mtr.commit_lsn());
        assert_eq!(db.buffer_pool().dirty_page_count(), 0);
        assert!(!db.log().is_write_allowed());
        Ok(())
    }
}
