//! Buffer control blocks: per-frame metadata and the frame slab entry.

use common::{Lsa, Vpid};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use storage::IoPage;

/// Latch held on a frame, or the terminal invalidation intents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LatchMode {
    /// The frame is on the invalid list.
    Invalid,
    None,
    Read,
    Write,
    /// A flusher owns the frame while its image is written out.
    Flush,
    /// A victim selector owns the frame while it is being evicted.
    Victim,
    /// Invalidation arrived while a flush was in flight.
    FlushInvalid,
    /// Invalidation arrived while the frame was latched.
    VictimInvalid,
}

/// Latch mode a caller may request through `fix`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixMode {
    Read,
    Write,
}

impl FixMode {
    pub(crate) fn as_latch(self) -> LatchMode {
        match self {
            FixMode::Read => LatchMode::Read,
            FixMode::Write => LatchMode::Write,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FixMode::Read => "READ",
            FixMode::Write => "WRITE",
        }
    }
}

/// Whether a fix may block waiting for the latch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixCondition {
    Unconditional,
    Conditional,
}

/// Whether the page image must be read from disk or is brand new.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFetch {
    Old,
    New,
}

/// Latch mode recorded for a blocked thread on a frame's wait queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestMode {
    Read,
    Write,
    Flush,
    Victim,
}

impl RequestMode {
    pub(crate) fn as_latch(self) -> LatchMode {
        match self {
            RequestMode::Read => LatchMode::Read,
            RequestMode::Write => LatchMode::Write,
            RequestMode::Flush => LatchMode::Flush,
            RequestMode::Victim => LatchMode::Victim,
        }
    }

    pub(crate) fn is_reader_writer(self) -> bool {
        matches!(self, RequestMode::Read | RequestMode::Write)
    }
}

impl From<FixMode> for RequestMode {
    fn from(mode: FixMode) -> Self {
        match mode {
            FixMode::Read => RequestMode::Read,
            FixMode::Write => RequestMode::Write,
        }
    }
}

/// Replacement zone a frame currently belongs to.
///
/// Stored as an atomic beside the BCB: transitions happen under the mutex of
/// whichever container owns the frame (LRU list, invalid list), and readers
/// that only hold the BCB mutex treat the value as advisory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Zone {
    Invalid = 0,
    Void = 1,
    Lru1 = 2,
    Lru2 = 3,
}

pub(crate) struct ZoneCell(AtomicU8);

impl ZoneCell {
    pub(crate) fn new(zone: Zone) -> Self {
        Self(AtomicU8::new(zone as u8))
    }

    pub(crate) fn get(&self) -> Zone {
        match self.0.load(Ordering::Acquire) {
            0 => Zone::Invalid,
            1 => Zone::Void,
            2 => Zone::Lru1,
            _ => Zone::Lru2,
        }
    }

    pub(crate) fn set(&self, zone: Zone) {
        self.0.store(zone as u8, Ordering::Release);
    }
}

/// A thread blocked on a frame's latch.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Waiter {
    pub thread: usize,
    pub mode: RequestMode,
    /// Fix count granted along with the latch; more than one only for a
    /// write upgrade that folded the caller's read fixes into the request.
    pub fix_count: u32,
}

/// Metadata of one buffer frame.
pub(crate) struct Bcb {
    /// Identity of the resident page, or null while the frame is free.
    pub vpid: Vpid,
    pub fix_count: u32,
    pub latch_mode: LatchMode,
    pub dirty: bool,
    /// Set while a flush is in flight to veto reuse of the frame.
    pub avoid_victim: bool,
    /// Set by a flusher that found the frame write latched; honored at
    /// unfix.
    pub async_flush_request: bool,
    /// Earliest LSA dirtying the page since its last successful flush.
    pub oldest_unflush_lsa: Lsa,
    /// FIFO of blocked latch requests; flush requests are inserted at the
    /// head.
    pub waiters: VecDeque<Waiter>,
}

impl Bcb {
    pub(crate) fn new() -> Self {
        Self {
            vpid: Vpid::NULL,
            fix_count: 0,
            latch_mode: LatchMode::Invalid,
            dirty: false,
            avoid_victim: false,
            async_flush_request: false,
            oldest_unflush_lsa: Lsa::NULL,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn has_blocked_reader_writer(&self) -> bool {
        self.waiters.iter().any(|w| w.mode.is_reader_writer())
    }

    pub(crate) fn has_blocked_reader_writer_victim(&self) -> bool {
        self.waiters
            .iter()
            .any(|w| w.mode.is_reader_writer() || w.mode == RequestMode::Victim)
    }
}

/// One slot of the frame slab: metadata plus the page image.
///
/// The page image sits under its own lock so fixed pages can be read and
/// written without the BCB mutex; the latch protocol is what actually
/// serializes conflicting access. Where both are taken the order is BCB
/// mutex first, page lock second.
pub(crate) struct Frame {
    pub bcb: Mutex<Bcb>,
    pub zone: ZoneCell,
    pub page: RwLock<IoPage>,
}

impl Frame {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            bcb: Mutex::new(Bcb::new()),
            zone: ZoneCell::new(Zone::Invalid),
            page: RwLock::new(IoPage::new(page_size)),
        }
    }
}
