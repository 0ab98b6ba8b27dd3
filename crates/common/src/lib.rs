
use serde::{Deserialize, Serialize};
use std::fmt;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Identifier of a database volume.
/// Examples:
/// - `let first_data_volume = VolId(0);`
/// - `let temp_volume = VolId(3);`
/// - `let unset = VolId::NULL;`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolId(pub i16);

impl VolId {
    pub const NULL: VolId = VolId(-1);

    pub fn is_null(self) -> bool {
        self.0 < 0
    }

    /// Auxiliary volumes (backups, copies) sit below the first database
    /// volume and are never stamped with a real LSA.
    pub fn is_auxiliary(self) -> bool {
        self.0 < 0
    }
}

/// Identifier of a page within a volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub i32);

impl PageId {
    pub const NULL: PageId = PageId(-1);

    pub fn is_null(self) -> bool {
        self.0 < 0
    }
}

/// Stable identity of a logical page: volume plus page id.
/// Examples:
/// - `let vpid = Vpid::new(VolId(1), PageId(10));`
/// - `assert!(Vpid::NULL.is_null());`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vpid {
    pub volid: VolId,
    pub pageid: PageId,
}

impl Vpid {
    pub const NULL: Vpid = Vpid {
        volid: VolId::NULL,
        pageid: PageId::NULL,
    };

    pub fn new(volid: VolId, pageid: PageId) -> Self {
        Self { volid, pageid }
    }

    pub fn is_null(self) -> bool {
        self.pageid.is_null()
    }
}

impl fmt::Display for Vpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.volid.0, self.pageid.0)
    }
}

/// Log sequence address: a monotonic position in the write-ahead log.
///
/// Ordering is lexicographic on (pageid, offset). `Lsa::NULL` doubles as the
/// unset value and the sentinel stamped on freshly initialized permanent
/// pages; `Lsa::INIT_TEMP` marks pages of temporary volumes, which are never
/// recovered and therefore never logged.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsa {
    pub pageid: i64,
    pub offset: i32,
}

impl Lsa {
    pub const NULL: Lsa = Lsa {
        pageid: -1,
        offset: -1,
    };

    pub const INIT_TEMP: Lsa = Lsa {
        pageid: -2,
        offset: -1,
    };

    pub fn new(pageid: i64, offset: i32) -> Self {
        Self { pageid, offset }
    }

    pub fn is_null(self) -> bool {
        self == Lsa::NULL
    }

    pub fn is_init_temp(self) -> bool {
        self == Lsa::INIT_TEMP
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.pageid, self.offset)
    }
}

/// Type tag stamped in the reserved area of every disk page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    Unknown = 0,
    FileHeader = 1,
    FileTab = 2,
    Heap = 3,
    HeapHeader = 4,
    VolHeader = 5,
    VolBitmap = 6,
    Overflow = 7,
    Ehash = 8,
    Area = 9,
    Catalog = 10,
    Qresult = 11,
    Btree = 12,
}

impl PageType {
    pub fn from_u8(raw: u8) -> Option<PageType> {
        use PageType::*;
        Some(match raw {
            0 => Unknown,
            1 => FileHeader,
            2 => FileTab,
            3 => Heap,
            4 => HeapHeader,
            5 => VolHeader,
            6 => VolBitmap,
            7 => Overflow,
            8 => Ehash,
            9 => Area,
            10 => Catalog,
            11 => Qresult,
            12 => Btree,
            _ => return None,
        })
    }

    /// Whether a stored page type satisfies an expected one. `Unknown`
    /// accepts whatever is stored; file header/table pages and heap
    /// header/data pages are interchangeable families.
    pub fn is_compatible(self, stored: PageType) -> bool {
        use PageType::*;
        if self == Unknown || self == stored {
            return true;
        }
        matches!(
            (self, stored),
            (FileHeader | FileTab, FileHeader | FileTab) | (Heap | HeapHeader, Heap | HeapHeader)
        )
    }
}

/// Identifier of a transaction as assigned by the transaction table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranId(pub i32);

impl fmt::Display for TranId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a transaction is willing to wait for a page latch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait until granted; timeouts are treated as deadlock victims.
    Infinite,
    /// Never wait; requests that cannot be granted fail immediately.
    Zero,
    /// Like `Zero` but imposed by the system rather than the client.
    ForceZero,
    /// Wait up to the given number of milliseconds.
    Msecs(u32),
}

impl WaitMode {
    pub fn is_zero(self) -> bool {
        matches!(self, WaitMode::Zero | WaitMode::ForceZero)
    }
}

/// Client attribution carried by latch-timeout errors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub program: String,
    pub user: String,
    pub host: String,
    pub pid: i32,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (pid {})", self.user, self.host, self.pid)
    }
}

/// Canonical error type shared across database subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("interrupted")]
    Interrupted,
    #[error("tran {tran} ({client}) timed out waiting for {mode} latch on page {vpid}")]
    PageTimeout {
        tran: TranId,
        client: ClientInfo,
        mode: &'static str,
        vpid: Vpid,
        /// Set when an infinite-wait request expired; the transaction layer
        /// is expected to unilaterally abort the transaction.
        unilateral_abort: bool,
    },
    #[error("bad page id: {0}")]
    BadPageId(Vpid),
    #[error("all buffers are fixed or dirty")]
    AllBuffersFixed,
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("wal: {0}")]
    Wal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DbError {
    /// Timeout-class errors are the ones retried by `fix_with_retry`.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DbError::PageTimeout { .. })
    }
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the storage and buffer subsystems.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .page_size(8192)
///     .page_buffer_size(8192 * 64)
///     .build();
/// assert_eq!(config.num_frames(), 64);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory where volume files and the WAL live.
    #[builder(default = PathBuf::from("./db_data"))]
    pub data_dir: PathBuf,
    /// Fixed on-disk page size in bytes.
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Total bytes of page frames kept resident; frame count is
    /// `page_buffer_size / page_size`.
    #[builder(default = 4096 * 256)]
    pub page_buffer_size: usize,
    /// Number of parallel LRU chains; 0 derives a count from the frame
    /// count.
    #[builder(default = 0)]
    pub num_lru_lists: usize,
    /// Share of each LRU list protected as the hot zone, in percent.
    #[builder(default = 50)]
    pub hot_zone_pct: usize,
    /// Share of each LRU list scanned per background flush round.
    #[builder(default = 0.1)]
    pub buffer_flush_ratio: f32,
    /// Debug page validation level; 0 disables all checks.
    #[builder(default = 0)]
    pub debug_page_validation_level: i32,
    /// Number of worker threads the pool reserves wait slots for.
    #[builder(default = 64)]
    pub max_threads: usize,
    /// Pause between page writes during a checkpoint flush, to avoid IO
    /// bursts. Zero disables pacing.
    #[builder(default = 0)]
    pub checkpoint_flush_pace_msecs: u64,
    /// Interval between unsolicited background flusher rounds.
    #[builder(default = 60_000)]
    pub flush_interval_msecs: u64,
}

impl Config {
    pub fn num_frames(&self) -> usize {
        self.page_buffer_size / self.page_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        ClientInfo, Config, DbError, DbResult, Lsa, PageId, PageType, TranId, VolId, Vpid, WaitMode,
    };
}
