//! The per-frame latch state machine: grants, blocking, timed sleeps, and
//! the wakeup rules.

use crate::BufferPool;
use crate::bcb::{Bcb, FixCondition, FixMode, LatchMode, RequestMode, Waiter, Zone};
use crate::threads::{ResumeStatus, ThreadCtx};
use common::{DbError, DbResult, Vpid, WaitMode};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Slice an unconditional latch wait sleeps for before the waiter is
/// treated as a deadlock victim.
const LATCH_TIMEOUT_SECS: u64 = 300;

impl BufferPool {
    /// Apply the latch protocol for a fix request. The caller holds the BCB
    /// mutex; it is released on every path. On success the holder record is
    /// updated or created.
    pub(crate) fn latch_on_fix(
        &self,
        th: &ThreadCtx,
        frame: usize,
        mut bcb: MutexGuard<'_, Bcb>,
        request: FixMode,
        buf_lock_acquired: bool,
        condition: FixCondition,
    ) -> DbResult<()> {
        let thread = th.index();

        // A freshly allocated frame, or an idle one: grant immediately.
        if buf_lock_acquired || bcb.latch_mode == LatchMode::None {
            bcb.latch_mode = request.as_latch();
            bcb.fix_count = 1;
            drop(bcb);
            debug_assert!(self.holders.count(thread, frame).is_none());
            self.holders.push(thread, frame, 1);
            return Ok(());
        }

        if request == FixMode::Read
            && matches!(bcb.latch_mode, LatchMode::Read | LatchMode::Flush)
        {
            if !bcb.has_blocked_reader_writer() {
                if bcb.latch_mode == LatchMode::Flush && !bcb.waiters.is_empty() {
                    self.kick_blocked_victim(&mut bcb);
                }
                bcb.fix_count += 1;
                drop(bcb);
                self.holders.add_fix(thread, frame);
                return Ok(());
            }

            // Readers queue behind a blocked writer unless reentrant.
            if self.holders.count(thread, frame).is_some() {
                bcb.fix_count += 1;
                drop(bcb);
                self.holders.add_fix(thread, frame);
                return Ok(());
            }
            return self.reject_or_block(th, frame, bcb, request.into(), 1, condition);
        }

        let Some(held) = self.holders.count(thread, frame) else {
            return self.reject_or_block(th, frame, bcb, request.into(), 1, condition);
        };

        if bcb.latch_mode == LatchMode::Write {
            // Reentrant: only the holder can be here.
            debug_assert_eq!(bcb.fix_count, held);
            bcb.fix_count += 1;
            drop(bcb);
            self.holders.add_fix(thread, frame);
            return Ok(());
        }

        if bcb.latch_mode == LatchMode::Read {
            debug_assert_eq!(request, FixMode::Write);
            if bcb.fix_count == held {
                // Sole holder: upgrade in place.
                bcb.latch_mode = LatchMode::Write;
                bcb.fix_count += 1;
                drop(bcb);
                self.holders.add_fix(thread, frame);
                return Ok(());
            }

            if condition == FixCondition::Conditional {
                return self.reject_or_block(th, frame, bcb, request.into(), 1, condition);
            }

            // Shared with other readers: fold our fixes into the blocked
            // request and queue for the write grant.
            let transferred = self.holders.remove(thread, frame).unwrap_or(0);
            bcb.fix_count -= transferred;
            return self.reject_or_block(
                th,
                frame,
                bcb,
                request.into(),
                1 + transferred,
                condition,
            );
        }

        self.reject_or_block(th, frame, bcb, request.into(), 1, condition)
    }

    /// Conditional requests fail here; unconditional ones queue and sleep.
    fn reject_or_block(
        &self,
        th: &ThreadCtx,
        frame: usize,
        mut bcb: MutexGuard<'_, Bcb>,
        mode: RequestMode,
        fix_count: u32,
        condition: FixCondition,
    ) -> DbResult<()> {
        let thread = th.index();

        if condition == FixCondition::Conditional {
            let vpid = bcb.vpid;
            drop(bcb);
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);

            let err = self.timeout_error(thread, mode, vpid, false);
            if self.threads.wait_mode(thread).is_zero() {
                tracing::error!(%err, "conditional page latch rejected under no-wait");
            }
            return Err(err);
        }

        if bcb.latch_mode == LatchMode::Flush && !bcb.waiters.is_empty() {
            self.kick_blocked_victim(&mut bcb);
        }

        self.block_on_latch(th, frame, bcb, mode, fix_count)?;
        debug_assert!(self.holders.count(thread, frame).is_none());
        self.holders.push(thread, frame, fix_count);
        Ok(())
    }

    /// Queue the request on the frame and sleep until granted, interrupted,
    /// or timed out. Flush requests go to the head of the queue and sleep
    /// without a timeout; read/write requests sleep in timed slices.
    pub(crate) fn block_on_latch(
        &self,
        th: &ThreadCtx,
        frame: usize,
        mut bcb: MutexGuard<'_, Bcb>,
        mode: RequestMode,
        fix_count: u32,
    ) -> DbResult<()> {
        debug_assert!(!matches!(
            bcb.latch_mode,
            LatchMode::Victim | LatchMode::VictimInvalid
        ));

        let thread = th.index();
        let waiter = Waiter {
            thread,
            mode,
            fix_count,
        };
        if mode == RequestMode::Flush {
            bcb.waiters.push_front(waiter);
        } else {
            bcb.waiters.push_back(waiter);
        }

        match mode {
            RequestMode::Flush | RequestMode::Victim => {
                let slot = self.threads.slot(thread);
                let mut ws = slot.wait.lock();
                ws.request_mode = Some(mode);
                ws.resume = ResumeStatus::Suspended;
                drop(bcb);

                while ws.resume == ResumeStatus::Suspended {
                    slot.cond.wait(&mut ws);
                }
                let resumed = ws.resume == ResumeStatus::Resumed;
                let kicked = std::mem::take(&mut ws.victim_request_fail);
                ws.resume = ResumeStatus::Idle;
                ws.request_mode = None;
                drop(ws);

                if resumed {
                    if kicked && mode == RequestMode::Victim {
                        // The holder kicked our victim request off the
                        // queue; the frame is not ours to evict.
                        return Err(DbError::AllBuffersFixed);
                    }
                    Ok(())
                } else {
                    let mut bcb = self.frames[frame].bcb.lock();
                    bcb.waiters.retain(|w| w.thread != thread);
                    drop(bcb);
                    Err(DbError::Interrupted)
                }
            }
            RequestMode::Read | RequestMode::Write => self.timed_sleep(th, frame, bcb, mode),
        }
    }

    /// Timed sleep for a queued read/write request.
    ///
    /// There is no deadlock detection between page latches, so an
    /// ungranted request is eventually woken by timeout and treated as a
    /// deadlock victim. A transaction that is no longer active keeps
    /// waiting (it is already aborting); an infinite-wait transaction
    /// escalates to a unilateral abort indication.
    fn timed_sleep(
        &self,
        th: &ThreadCtx,
        frame: usize,
        bcb: MutexGuard<'_, Bcb>,
        mode: RequestMode,
    ) -> DbResult<()> {
        let thread = th.index();
        let vpid = bcb.vpid;

        let slot = self.threads.slot(thread);
        let mut ws = slot.wait.lock();
        ws.request_mode = Some(mode);
        drop(bcb);

        let wait_setting = self.threads.wait_mode(thread);
        let slice = match wait_setting {
            WaitMode::Msecs(ms) => Duration::from_millis(ms as u64),
            WaitMode::Zero | WaitMode::ForceZero => Duration::ZERO,
            WaitMode::Infinite => Duration::from_secs(LATCH_TIMEOUT_SECS),
        };

        loop {
            ws.resume = ResumeStatus::Suspended;
            let timed_out = slot.cond.wait_for(&mut ws, slice).timed_out();

            match ws.resume {
                ResumeStatus::Resumed => {
                    ws.resume = ResumeStatus::Idle;
                    ws.request_mode = None;
                    return Ok(());
                }
                ResumeStatus::Interrupted => {
                    ws.request_mode = None;
                    ws.resume = ResumeStatus::Idle;
                    drop(ws);
                    self.remove_waiter(frame, thread);
                    return Err(DbError::Interrupted);
                }
                ResumeStatus::Suspended if timed_out => {
                    if !self.threads.is_active(thread) {
                        // Already aborting; do not abort twice.
                        continue;
                    }
                    let saved = ws.request_mode.take().unwrap_or(mode);
                    ws.resume = ResumeStatus::Idle;
                    drop(ws);
                    self.remove_waiter(frame, thread);
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);

                    let unilateral = wait_setting == WaitMode::Infinite;
                    let err = self.timeout_error(thread, saved, vpid, unilateral);
                    tracing::error!(%err, "page latch wait expired");
                    return Err(err);
                }
                _ => continue,
            }
        }
    }

    fn timeout_error(
        &self,
        thread: usize,
        mode: RequestMode,
        vpid: Vpid,
        unilateral_abort: bool,
    ) -> DbError {
        DbError::PageTimeout {
            tran: self.threads.tran_id(thread),
            client: self.threads.client_info(thread),
            mode: match mode {
                RequestMode::Write => "WRITE",
                _ => "READ",
            },
            vpid,
            unilateral_abort,
        }
    }

    /// Remove a timed-out or interrupted waiter from the frame queue. If it
    /// sat at the head in front of compatible readers, grant them now.
    fn remove_waiter(&self, frame: usize, thread: usize) {
        let mut bcb = self.frames[frame].bcb.lock();
        let Some(pos) = bcb.waiters.iter().position(|w| w.thread == thread) else {
            // A waker raced us and granted the request; the grant already
            // updated the frame, nothing to undo.
            return;
        };
        let at_head = pos == 0;
        bcb.waiters.remove(pos);

        if at_head && bcb.latch_mode == LatchMode::Read {
            while let Some(&front) = bcb.waiters.front() {
                if front.mode != RequestMode::Read {
                    break;
                }
                if !self.try_grant_front(&mut bcb) {
                    break;
                }
            }
        }
    }

    /// The wakeup rule, run when the latch drops to none with a non-empty
    /// queue: grant the head; keep granting while the head stays a
    /// compatible reader. Consumes the BCB guard.
    pub(crate) fn grant_waiters(&self, _frame: usize, mut bcb: MutexGuard<'_, Bcb>) {
        debug_assert!(!matches!(
            bcb.latch_mode,
            LatchMode::Victim | LatchMode::VictimInvalid
        ));

        while let Some(&front) = bcb.waiters.front() {
            match front.mode {
                RequestMode::Victim => {
                    // Blocked victim requests are only satisfied through
                    // the victim path; kick this one loose.
                    self.kick_blocked_victim(&mut bcb);
                    continue;
                }
                RequestMode::Flush => {
                    // Flush waiters are woken by the flush itself; one left
                    // here means the flush already happened at unfix.
                    bcb.waiters.pop_front();
                    self.threads.slot(front.thread).wake(ResumeStatus::Resumed);
                    continue;
                }
                RequestMode::Read | RequestMode::Write => {
                    let grantable = bcb.latch_mode == LatchMode::None
                        || (bcb.latch_mode == LatchMode::Read
                            && front.mode == RequestMode::Read);
                    if !grantable || !self.try_grant_front(&mut bcb) {
                        break;
                    }
                }
            }
        }
    }

    /// Grant the queue head if its request is still pending; pop it either
    /// way. Returns false when the head could not be consumed.
    fn try_grant_front(&self, bcb: &mut Bcb) -> bool {
        let Some(&front) = bcb.waiters.front() else {
            return false;
        };
        let slot = self.threads.slot(front.thread);
        let mut ws = slot.wait.lock();

        if ws.request_mode != Some(front.mode) {
            // Timed out; drop the stale entry and keep going.
            drop(ws);
            bcb.waiters.pop_front();
            return true;
        }

        bcb.latch_mode = front.mode.as_latch();
        bcb.fix_count += front.fix_count;
        bcb.waiters.pop_front();

        ws.resume = ResumeStatus::Resumed;
        slot.cond.notify_one();
        true
    }

    /// Surgically remove one blocked victim request and fail it.
    pub(crate) fn kick_blocked_victim(&self, bcb: &mut Bcb) {
        let Some(pos) = bcb
            .waiters
            .iter()
            .position(|w| w.mode == RequestMode::Victim)
        else {
            return;
        };
        let kicked = bcb.waiters.remove(pos).expect("victim waiter present");
        let slot = self.threads.slot(kicked.thread);
        let mut ws = slot.wait.lock();
        ws.victim_request_fail = true;
        if ws.resume == ResumeStatus::Suspended {
            ws.resume = ResumeStatus::Resumed;
            slot.cond.notify_one();
        }
    }

    /// Unfix bookkeeping on the latch side. The caller already released its
    /// holder record; the BCB guard is consumed.
    pub(crate) fn unlatch_on_unfix<'a>(
        &'a self,
        frame: usize,
        mut bcb: MutexGuard<'a, Bcb>,
    ) -> DbResult<()> {
        if bcb.fix_count == 0 {
            tracing::error!(vpid = %bcb.vpid, "unfix of a page with zero fix count");
            debug_assert!(false);
        } else {
            bcb.fix_count -= 1;
        }

        if bcb.fix_count == 0 {
            if !matches!(bcb.latch_mode, LatchMode::Flush | LatchMode::Victim) {
                bcb.latch_mode = LatchMode::None;
            }
            // Hot frames stay put; promoting them again would only churn
            // the list.
            if !bcb.has_blocked_reader_writer() && self.frames[frame].zone.get() != Zone::Lru1 {
                self.promote_to_top(frame, &mut bcb);
            }
        }

        if bcb.async_flush_request {
            bcb.latch_mode = LatchMode::Flush;
            bcb = self.flush_page_with_wal(frame, bcb)?;
            if bcb.fix_count == 0 {
                bcb.latch_mode = LatchMode::None;
            } else {
                bcb.latch_mode = LatchMode::Read;
            }
        }

        if bcb.latch_mode == LatchMode::None && !bcb.waiters.is_empty() {
            self.grant_waiters(frame, bcb);
        }
        Ok(())
    }
}
