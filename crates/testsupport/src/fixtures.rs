//! Buffer-pool harnesses over temporary volumes.

use buffer::{BufferPool, ThreadCtx};
use common::{Config, DbResult, Lsa, PageId, VolId, Vpid};
use std::sync::Arc;
use storage::DiskManager;
use tempfile::TempDir;
use wal::{Wal, WalRecord};

/// Page size used by harness pools; small enough that eviction tests stay
/// cheap.
pub const TEST_PAGE_SIZE: usize = 1024;

/// Pages formatted into each harness volume.
pub const TEST_VOLUME_PAGES: usize = 256;

/// A buffer pool wired to a scratch volume and log, all torn down with the
/// temp directory.
pub struct PoolHarness {
    pub dir: TempDir,
    pub disk: Arc<DiskManager>,
    pub wal: Arc<Wal>,
    pub pool: Arc<BufferPool>,
}

impl PoolHarness {
    /// Harness with `num_frames` frames, a single LRU list, and one
    /// formatted volume `VolId(0)`.
    pub fn new(num_frames: usize) -> Self {
        Self::with_lists(num_frames, 1)
    }

    /// Harness with an explicit LRU list count.
    pub fn with_lists(num_frames: usize, num_lru_lists: usize) -> Self {
        let config = Config::builder()
            .page_size(TEST_PAGE_SIZE)
            .page_buffer_size(TEST_PAGE_SIZE * num_frames)
            .num_lru_lists(num_lru_lists)
            .build();
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let disk = Arc::new(DiskManager::new(dir.path(), config.page_size));
        disk.format_volume(VolId(0), TEST_VOLUME_PAGES)
            .expect("format volume");
        let wal = Arc::new(Wal::open(dir.path().join("log.wal")).expect("open wal"));
        let pool = BufferPool::new(config, Arc::clone(&disk), Arc::clone(&wal))
            .expect("create buffer pool");
        Self {
            dir,
            disk,
            wal,
            pool,
        }
    }

    /// Format an additional volume.
    pub fn add_volume(&self, volid: VolId, npages: usize) {
        self.disk.format_volume(volid, npages).expect("format volume");
    }

    /// Register a worker thread with the pool.
    pub fn thread(&self) -> ThreadCtx {
        self.pool.register_thread().expect("register thread")
    }

    /// Append a log record so tests can stamp pages with real LSAs.
    pub fn mint_lsa(&self, vpid: Vpid) -> DbResult<Lsa> {
        self.wal.append(&WalRecord::PageUpdate {
            vpid,
            payload: vec![0xA5; 8],
        })
    }
}

/// Shorthand for building page identities in tests.
pub fn vpid(volid: i16, pageid: i32) -> Vpid {
    Vpid::new(VolId(volid), PageId(pageid))
}
