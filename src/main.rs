//! Mini-transaction stress driver
//!
//! Runs concurrent mini-transactions that increment counters on randomly
//! chosen pages, then checks that the redo log, the flush list and the page
//! contents agree.

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use rand::seq::index::sample;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;
use vibedb_mtr::concurrency::LockId;
use vibedb_mtr::database::{Database, DatabaseConfig};
use vibedb_mtr::mtr::Mtr;
use vibedb_mtr::storage::{parse_groups, LatchMode, LogConfig, PageId, LOG_START_LSN};

/// Mini-transaction stress driver
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Mini-transactions per thread
    #[arg(short, long, default_value = "1000")]
    iterations: usize,

    /// Number of pages in the buffer pool
    #[arg(short, long, default_value = "64")]
    pages: usize,

    /// Pages latched and modified by each mini-transaction
    #[arg(short = 'k', long, default_value = "3")]
    pages_per_mtr: usize,

    /// Flush dirty pages every N mini-transactions on the first thread (0 disables)
    #[arg(short, long, default_value = "100")]
    flush_every: usize,

    /// Directory for the redo log file; kept in memory if omitted
    #[arg(short = 'D', long)]
    log_dir: Option<PathBuf>,

    /// Disable the small-log fast path
    #[arg(long)]
    no_fast_path: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if args.pages_per_mtr == 0 || args.pages_per_mtr > args.pages {
        bail!(
            "pages per mini-transaction must be between 1 and {}",
            args.pages
        );
    }
    if let Some(dir) = &args.log_dir {
        std::fs::create_dir_all(dir).context("Failed to create log directory")?;
    }

    let config = DatabaseConfig {
        log: LogConfig {
            log_dir: args.log_dir.clone(),
            fast_path: !args.no_fast_path,
            sync_on_flush: false,
            ..LogConfig::default()
        },
        buffer_pool_pages: args.pages,
    };
    let db = Database::open(config).context("Failed to open database")?;
    let counter_lock = db.locks().create("counters");

    let started = Instant::now();
    thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..args.threads)
            .map(|worker| {
                let db = &db;
                let args = &args;
                scope.spawn(move || run_worker(db, args, worker, counter_lock))
            })
            .collect();

        for worker in workers {
            match worker.join() {
                Ok(result) => result?,
                Err(_) => bail!("worker thread panicked"),
            }
        }
        Ok(())
    })?;
    let elapsed = started.elapsed();

    verify(&db, &args)?;

    let stats = db.log().stats();
    let commits = args.threads * args.iterations;
    println!("Committed {} mini-transactions in {:.2?}", commits, elapsed);
    println!("   - Fast path appends: {}", stats.fast_appends);
    println!("   - Slow path appends: {}", stats.slow_appends);
    println!("   - Redo bytes: {}", stats.bytes_written);
    println!("   - Log buffer flushes: {}", stats.flushes);
    println!("   - Dirty pages: {}", db.buffer_pool().dirty_page_count());

    let lsn = db.shutdown().context("Failed to shut down")?;
    println!("Shut down at {}", lsn);
    Ok(())
}

fn run_worker(
    db: &Database,
    args: &Args,
    worker: usize,
    counter_lock: LockId,
) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut mtr = Mtr::new(db);

    for i in 0..args.iterations {
        // Latch in ascending page order so workers cannot deadlock.
        let mut pages: Vec<u32> = sample(&mut rng, args.pages, args.pages_per_mtr)
            .into_iter()
            .map(|n| n as u32)
            .collect();
        pages.sort_unstable();

        mtr.start(false, false);
        let result = increment_counters(&mut mtr, counter_lock, &pages);
        mtr.commit();
        result?;

        if worker == 0 && args.flush_every > 0 && (i + 1) % args.flush_every == 0 {
            db.flush_dirty_pages(None)?;
        }
    }
    Ok(())
}

fn verify(db: &Database, args: &Args) -> Result<()> {
    if !db.buffer_pool().is_flush_list_ordered() {
        bail!("flush list is not in LSN order");
    }

    let mut mtr = db.start_read_only_mtr();
    let total = sum_counters(&mut mtr, args.pages as u32);
    mtr.commit();
    let total = total?;

    let expected = (args.threads * args.iterations * args.pages_per_mtr) as u64;
    if total != expected {
        bail!("page counters sum to {}, expected {}", total, expected);
    }

    let redo = db.log().read(LOG_START_LSN, db.log().current_lsn())?;
    let groups = parse_groups(&redo)?;
    if groups.len() != args.threads * args.iterations {
        bail!(
            "redo log holds {} groups, expected {}",
            groups.len(),
            args.threads * args.iterations
        );
    }
    Ok(())
}

fn increment_counters(mtr: &mut Mtr<'_>, counter_lock: LockId, pages: &[u32]) -> Result<()> {
    mtr.s_lock(counter_lock)?;
    for &n in pages {
        let page_id = PageId(n);
        let block = mtr.get_page(page_id, LatchMode::Exclusive)?;
        let count = read_counter(&block.read_bytes(0, 8)?);
        mtr.write_u64(page_id, 0, count + 1)?;
    }
    Ok(())
}

fn sum_counters(mtr: &mut Mtr<'_>, pages: u32) -> Result<u64> {
    let mut total = 0;
    for n in 0..pages {
        let block = mtr.get_page(PageId(n), LatchMode::Shared)?;
        total += read_counter(&block.read_bytes(0, 8)?);
    }
    Ok(total)
}

fn read_counter(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}
