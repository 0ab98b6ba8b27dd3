//! Thread registry: per-thread wait machinery and transaction binding.
//!
//! The pool reserves one slot per worker thread at construction. A slot
//! carries the condition variable the thread sleeps on while blocked on a
//! latch or a page read-in, the resume handshake state, the latch request
//! the thread is blocked for, its interrupt flag, and the transaction
//! attributes (wait setting, active flag, client attribution) the latch
//! protocol consults.

use crate::bcb::RequestMode;
use common::{ClientInfo, DbError, DbResult, TranId, WaitMode};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Why a sleeping thread woke up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResumeStatus {
    Idle,
    Suspended,
    Resumed,
    Interrupted,
}

pub(crate) struct WaitState {
    pub resume: ResumeStatus,
    /// Latch request this thread is blocked for; cleared by the thread
    /// itself on timeout or interrupt so a waker will not grant a request
    /// nobody is waiting on anymore.
    pub request_mode: Option<RequestMode>,
    /// Set when a blocked victim request was kicked off the queue.
    pub victim_request_fail: bool,
}

pub(crate) struct ThreadSlot {
    pub wait: Mutex<WaitState>,
    pub cond: Condvar,
    pub interrupted: AtomicBool,
    pub tran: Mutex<TranBinding>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            wait: Mutex::new(WaitState {
                resume: ResumeStatus::Idle,
                request_mode: None,
                victim_request_fail: false,
            }),
            cond: Condvar::new(),
            interrupted: AtomicBool::new(false),
            tran: Mutex::new(TranBinding::default()),
        }
    }

    /// Wake the thread if it is suspended. Grant-style wakeups overwrite an
    /// interrupt that has not been observed yet: the grant is already
    /// applied, and the interrupt is re-polled at the next fix.
    pub(crate) fn wake(&self, status: ResumeStatus) {
        let mut ws = self.wait.lock();
        if ws.resume == ResumeStatus::Suspended
            || (ws.resume == ResumeStatus::Interrupted && status == ResumeStatus::Resumed)
        {
            ws.resume = status;
            self.cond.notify_one();
        }
    }
}

/// Transaction attributes of the session a thread works for.
#[derive(Clone, Debug)]
pub struct TranBinding {
    pub tran: TranId,
    pub wait_mode: WaitMode,
    pub active: bool,
    pub client: ClientInfo,
}

impl Default for TranBinding {
    fn default() -> Self {
        Self {
            tran: TranId(-1),
            wait_mode: WaitMode::Infinite,
            active: true,
            client: ClientInfo::default(),
        }
    }
}

/// Handle identifying a registered worker thread.
///
/// One per thread; every pool operation takes it so holder tables, wait
/// slots, and transaction attributes resolve without thread-local state.
#[derive(Debug)]
pub struct ThreadCtx {
    index: usize,
}

impl ThreadCtx {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fixed-size table of thread slots.
pub struct ThreadRegistry {
    slots: Box<[ThreadSlot]>,
    next: AtomicUsize,
}

impl ThreadRegistry {
    pub fn new(max_threads: usize) -> Self {
        Self {
            slots: (0..max_threads.max(1)).map(|_| ThreadSlot::new()).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn max_threads(&self) -> usize {
        self.slots.len()
    }

    /// Claim a slot for the calling thread.
    pub fn register(&self) -> DbResult<ThreadCtx> {
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        if index >= self.slots.len() {
            return Err(DbError::Storage(format!(
                "thread table exhausted ({} slots)",
                self.slots.len()
            )));
        }
        Ok(ThreadCtx { index })
    }

    pub(crate) fn slot(&self, index: usize) -> &ThreadSlot {
        &self.slots[index]
    }

    /// Bind the thread to a transaction's attributes.
    pub fn set_tran(&self, th: &ThreadCtx, binding: TranBinding) {
        *self.slots[th.index].tran.lock() = binding;
    }

    pub fn set_wait_mode(&self, th: &ThreadCtx, wait_mode: WaitMode) {
        self.slots[th.index].tran.lock().wait_mode = wait_mode;
    }

    pub fn set_active(&self, th: &ThreadCtx, active: bool) {
        self.slots[th.index].tran.lock().active = active;
    }

    pub fn wait_mode(&self, index: usize) -> WaitMode {
        self.slots[index].tran.lock().wait_mode
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.slots[index].tran.lock().active
    }

    pub fn tran_id(&self, index: usize) -> TranId {
        self.slots[index].tran.lock().tran
    }

    pub fn client_info(&self, index: usize) -> ClientInfo {
        self.slots[index].tran.lock().client.clone()
    }

    /// Flag a thread as interrupted and wake it if it sleeps on a latch or
    /// a page read-in.
    pub fn interrupt(&self, index: usize) {
        let slot = &self.slots[index];
        slot.interrupted.store(true, Ordering::Release);
        slot.wake(ResumeStatus::Interrupted);
    }

    pub fn is_interrupt_pending(&self, index: usize) -> bool {
        self.slots[index].interrupted.load(Ordering::Acquire)
    }

    /// Consume the thread's interrupt flag.
    pub(crate) fn take_interrupt(&self, index: usize) -> bool {
        self.slots[index].interrupted.swap(false, Ordering::AcqRel)
    }
}
