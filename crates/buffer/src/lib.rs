//! Server-side page buffer pool.
//!
//! A fixed-size, latched cache of disk pages sitting between the storage
//! engine and the file layer:
//! - every page read, write, and log-ordered flush goes through `fix` /
//!   `unfix` and the flush paths here,
//! - frames are recycled through a two-zone LRU policy with per-list victim
//!   sweeps and a background flusher that cleans list bottoms,
//! - each frame carries a reader/writer/flush latch with a FIFO wait queue
//!   and per-thread reentrancy,
//! - the WAL rule is enforced on every flush: the log is forced up to the
//!   page LSA before the image reaches disk.
//!
//! # Example
//!
//! ```no_run
//! use buffer::{BufferPool, FixMode, FixCondition, PageFetch};
//! use common::{Config, PageId, PageType, VolId, Vpid};
//! use std::sync::Arc;
//! use storage::DiskManager;
//! use wal::Wal;
//!
//! let config = Config::builder().data_dir("./db".into()).build();
//! let disk = Arc::new(DiskManager::new("./db", config.page_size));
//! disk.format_volume(VolId(0), 64).unwrap();
//! let wal = Arc::new(Wal::open("./db/log.wal").unwrap());
//!
//! let pool = BufferPool::new(config, disk, wal).unwrap();
//! let th = pool.register_thread().unwrap();
//!
//! let vpid = Vpid::new(VolId(0), PageId(3));
//! let page = pool.fix_new(&th, vpid, PageType::Heap).unwrap();
//! pool.page_mut(&page).body_mut()[0] = 42;
//! pool.set_dirty_and_unfix(&th, page);
//!
//! let page = pool
//!     .fix(&th, vpid, PageFetch::Old, FixMode::Read, FixCondition::Unconditional, PageType::Heap)
//!     .unwrap();
//! assert_eq!(pool.page(&page).body()[0], 42);
//! pool.unfix(&th, page);
//! ```

mod bcb;
mod fix;
mod flush;
mod flusher;
mod hash;
mod holder;
mod latch;
mod lru;
mod threads;
mod victim;


pub use bcb::{FixCondition, FixMode, PageFetch};
pub use threads::{ThreadCtx, ThreadRegistry, TranBinding};

use bcb::Frame;
use common::{Config, DbError, DbResult, VolId, Vpid};
use flush::FlushState;
use flusher::FlusherHandle;
use hash::HashTable;
use holder::HolderTable;
use lru::LruList;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use storage::{DiskManager, IoPage};
use wal::Wal;

/// Validation level at which fix requests probe the disk layer for page
/// validity.
pub(crate) const VALIDATION_FETCH: i32 = 1;

/// Handle to a fixed page. Obtained from `fix` and returned to the pool
/// through `unfix` (or one of the `_and_unfix` combinations).
#[must_use = "fixed pages must be unfixed"]
#[derive(Debug)]
pub struct PageRef {
    frame: usize,
    vpid: Vpid,
}

impl PageRef {
    pub(crate) fn new(frame: usize, vpid: Vpid) -> Self {
        Self { frame, vpid }
    }

    pub(crate) fn frame(&self) -> usize {
        self.frame
    }

    /// Identity of the fixed page.
    pub fn vpid(&self) -> Vpid {
        self.vpid
    }
}

#[derive(Default)]
pub(crate) struct Stats {
    pub fetches: AtomicU64,
    pub hits: AtomicU64,
    pub ioreads: AtomicU64,
    pub iowrites: AtomicU64,
    pub dirties: AtomicU64,
    pub victims: AtomicU64,
    pub timeouts: AtomicU64,
}

/// Point-in-time counters of pool activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub fetches: u64,
    pub hits: u64,
    pub ioreads: u64,
    pub iowrites: u64,
    pub dirties: u64,
    pub victims: u64,
    pub timeouts: u64,
}

pub(crate) struct VolInfo {
    /// Highest permanent volume id; anything above is temporary.
    pub(crate) last_perm: VolId,
    /// Permanent volumes registered as holding temporary data.
    pub(crate) temp_vols: Vec<VolId>,
}

/// The page buffer pool.
///
/// Mutex hierarchy, outermost first; each level may be taken while holding
/// the previous one and never the other way around:
/// 1. bucket mutex, then BCB mutex (lookup try-locks only; a blocking BCB
///    acquisition drops the bucket mutex first),
/// 2. BCB mutex, then LRU list mutex,
/// 3. BCB mutex, then page image lock,
/// 4. BCB or bucket mutex, then thread wait mutex,
/// 5. flush state mutex, then BCB mutex (flusher rounds only),
/// 6. invalid list and volume info mutexes are leaves.
pub struct BufferPool {
    pub(crate) cfg: Config,
    pub(crate) disk: Arc<DiskManager>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) threads: Arc<ThreadRegistry>,
    pub(crate) holders: HolderTable,
    pub(crate) frames: Box<[Frame]>,
    pub(crate) hash: HashTable,
    pub(crate) lru: Box<[Mutex<LruList>]>,
    pub(crate) num_lru_lists: usize,
    pub(crate) per_list_capacity: usize,
    pub(crate) hot_threshold: usize,
    pub(crate) invalid: Mutex<Vec<usize>>,
    pub(crate) vol_info: Mutex<VolInfo>,
    check_for_interrupts: AtomicBool,
    pub(crate) flush_state: Mutex<FlushState>,
    pub(crate) flusher: Mutex<Option<FlusherHandle>>,
    pub(crate) shutdown_flag: AtomicBool,
    pub(crate) stats: Stats,
}

impl BufferPool {
    /// Build a pool of `page_buffer_size / page_size` frames over the given
    /// disk and log managers. The frame table, hash index, LRU lists, and
    /// thread slots are all sized here and never grow.
    pub fn new(cfg: Config, disk: Arc<DiskManager>, wal: Arc<Wal>) -> DbResult<Arc<Self>> {
        let num_frames = cfg.num_frames();
        if num_frames == 0 {
            return Err(DbError::Storage(
                "page buffer smaller than one page".into(),
            ));
        }
        debug_assert_eq!(disk.page_size(), cfg.page_size);

        let num_lru_lists = if cfg.num_lru_lists == 0 {
            (num_frames / 512).clamp(4, 64)
        } else {
            cfg.num_lru_lists
        };
        let per_list_capacity = (num_frames / num_lru_lists).max(1);
        let hot_threshold = (per_list_capacity * cfg.hot_zone_pct / 100).max(1);

        let pool = Arc::new(Self {
            threads: Arc::new(ThreadRegistry::new(cfg.max_threads)),
            holders: HolderTable::new(cfg.max_threads),
            frames: (0..num_frames).map(|_| Frame::new(cfg.page_size)).collect(),
            hash: HashTable::new(num_frames),
            lru: (0..num_lru_lists).map(|_| Mutex::new(LruList::new())).collect(),
            num_lru_lists,
            per_list_capacity,
            hot_threshold,
            invalid: Mutex::new((0..num_frames).rev().collect()),
            vol_info: Mutex::new(VolInfo {
                last_perm: VolId(i16::MAX),
                temp_vols: Vec::new(),
            }),
            check_for_interrupts: AtomicBool::new(false),
            flush_state: Mutex::new(FlushState {
                last_flushed_list_idx: 0,
                candidates: Vec::with_capacity(num_frames),
            }),
            flusher: Mutex::new(None),
            shutdown_flag: AtomicBool::new(false),
            stats: Stats::default(),
            cfg,
            disk,
            wal,
        });
        Ok(pool)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Claim a worker-thread slot on the pool's registry.
    pub fn register_thread(&self) -> DbResult<ThreadCtx> {
        self.threads.register()
    }

    /// Read access to a fixed page's image. Drop the guard before calling
    /// back into the pool with the same page.
    pub fn page<'a>(&'a self, page: &PageRef) -> RwLockReadGuard<'a, IoPage> {
        self.frames[page.frame].page.read()
    }

    /// Write access to a fixed page's image; callers hold the write latch.
    /// Drop the guard before calling back into the pool with the same page.
    pub fn page_mut<'a>(&'a self, page: &PageRef) -> RwLockWriteGuard<'a, IoPage> {
        self.frames[page.frame].page.write()
    }

    /// Flip the shared interrupt flag polled at the top of every fix
    /// attempt; the next attempt on any thread surfaces an interrupt.
    pub fn force_interrupt_polling(&self) {
        self.check_for_interrupts.store(true, Ordering::Release);
    }

    pub fn is_interrupt_pending(&self, th: &ThreadCtx) -> bool {
        self.threads.is_interrupt_pending(th.index())
    }

    pub(crate) fn poll_interrupt(&self, th: &ThreadCtx) -> DbResult<()> {
        if self.threads.take_interrupt(th.index()) {
            self.check_for_interrupts.store(false, Ordering::Release);
            return Err(DbError::Interrupted);
        }
        if self.check_for_interrupts.swap(false, Ordering::AcqRel) {
            return Err(DbError::Interrupted);
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            ioreads: self.stats.ioreads.load(Ordering::Relaxed),
            iowrites: self.stats.iowrites.load(Ordering::Relaxed),
            dirties: self.stats.dirties.load(Ordering::Relaxed),
            victims: self.stats.victims.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
