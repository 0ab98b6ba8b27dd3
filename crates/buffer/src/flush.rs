//! Flush paths: the WAL-respecting single-frame primitive, caller-facing
//! flushes, volume-wide sweeps, checkpoint flushing, and the victim
//! candidate flusher the background daemon runs.

use crate::BufferPool;
use crate::bcb::{Bcb, FixCondition, FixMode, LatchMode, PageFetch, RequestMode, Zone};
use crate::threads::{ResumeStatus, ThreadCtx};
use common::{DbError, DbResult, Lsa, PageType, VolId, Vpid};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// One entry of the flusher's scratch candidate list.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VictimCandidate {
    pub frame: usize,
    pub vpid: Vpid,
    pub oldest_unflush_lsa: Lsa,
}

/// Scratch state owned by whichever thread runs a flusher round.
pub(crate) struct FlushState {
    pub last_flushed_list_idx: usize,
    pub candidates: Vec<VictimCandidate>,
}

impl BufferPool {
    /// Write one frame's image to disk under the WAL rule.
    ///
    /// The image is snapshotted and the dirty state cleared while the BCB
    /// mutex is held; the log barrier and the disk write then run without
    /// it, bracketed by `avoid_victim`. On write failure the dirty state is
    /// restored atomically. Queued flush waiters at the queue head are
    /// woken once the write is out.
    pub(crate) fn flush_page_with_wal<'a>(
        &'a self,
        frame: usize,
        mut bcb: MutexGuard<'a, Bcb>,
    ) -> DbResult<MutexGuard<'a, Bcb>> {
        debug_assert!(matches!(
            bcb.latch_mode,
            LatchMode::None | LatchMode::Flush | LatchMode::Read | LatchMode::Write
        ));

        bcb.avoid_victim = true;
        bcb.async_flush_request = false;

        let snapshot = self.frames[frame].page.read().clone();
        let vpid = bcb.vpid;
        let oldest = bcb.oldest_unflush_lsa;
        bcb.dirty = false;
        bcb.oldest_unflush_lsa = Lsa::NULL;
        drop(bcb);

        let result = snapshot
            .lsa()
            .and_then(|lsa| self.wal.flush_up_to(lsa))
            .and_then(|()| self.disk.write_page(vpid, &snapshot));

        let mut bcb = self.frames[frame].bcb.lock();
        bcb.avoid_victim = false;
        if let Err(err) = result {
            bcb.dirty = true;
            bcb.oldest_unflush_lsa = oldest;
            drop(bcb);
            return Err(err);
        }
        self.stats.iowrites.fetch_add(1, Ordering::Relaxed);

        while let Some(&front) = bcb.waiters.front() {
            if front.mode != RequestMode::Flush {
                break;
            }
            bcb.waiters.pop_front();
            self.threads.slot(front.thread).wake(ResumeStatus::Resumed);
        }
        Ok(bcb)
    }

    /// Flush a frame found dirty by a sweep, coping with whatever latch it
    /// is under: idle and read-latched frames are flushed in place, a
    /// write-latched frame held by this thread is flushed directly, and a
    /// foreign writer gets `async_flush_request` (optionally waiting for
    /// the flush when `synchronous`). Consumes the guard.
    pub(crate) fn flush_bcb(
        &self,
        th: &ThreadCtx,
        frame: usize,
        mut bcb: MutexGuard<'_, Bcb>,
        synchronous: bool,
    ) -> DbResult<()> {
        debug_assert!(!matches!(
            bcb.latch_mode,
            LatchMode::Victim | LatchMode::VictimInvalid
        ));

        match bcb.latch_mode {
            LatchMode::Invalid | LatchMode::FlushInvalid | LatchMode::VictimInvalid => Ok(()),
            LatchMode::None | LatchMode::Read => {
                bcb.latch_mode = LatchMode::Flush;
                let mut bcb = self.flush_page_with_wal(frame, bcb)?;

                if bcb.fix_count > 0 {
                    // Readers still hold the page.
                    bcb.latch_mode = LatchMode::Read;
                    return Ok(());
                }

                if bcb.latch_mode == LatchMode::FlushInvalid {
                    // Invalidation arrived while the image was in flight.
                    if bcb.waiters.is_empty() {
                        if self.unlink_from_hash(frame, &mut bcb) {
                            self.move_to_invalid_list(frame, bcb);
                        }
                        return Ok(());
                    }
                    // Someone queued meanwhile: drop the invalid intent and
                    // resume as an ordinary frame.
                    bcb.latch_mode = LatchMode::None;
                    self.grant_waiters(frame, bcb);
                    return Ok(());
                }

                bcb.latch_mode = LatchMode::None;
                if !bcb.waiters.is_empty() {
                    self.grant_waiters(frame, bcb);
                }
                Ok(())
            }
            LatchMode::Write => {
                if self.holders.count(th.index(), frame).is_some() {
                    // Flushing our own write-latched page is allowed.
                    let _bcb = self.flush_page_with_wal(frame, bcb)?;
                    return Ok(());
                }
                bcb.async_flush_request = true;
                if synchronous {
                    self.block_on_latch(th, frame, bcb, RequestMode::Flush, 0)
                } else {
                    Ok(())
                }
            }
            LatchMode::Flush => {
                if synchronous {
                    self.block_on_latch(th, frame, bcb, RequestMode::Flush, 0)
                } else {
                    Ok(())
                }
            }
            LatchMode::Victim => Ok(()),
        }
    }

    /// Flush the fixed page if dirty. Callers hold a write latch.
    pub fn flush(&self, th: &ThreadCtx, page: &crate::PageRef) -> DbResult<()> {
        debug_assert!(self.holders.count(th.index(), page.frame()).is_some());
        let bcb = self.frames[page.frame()].bcb.lock();
        debug_assert!(!bcb.vpid.is_null());
        if bcb.dirty {
            self.flush_page_with_wal(page.frame(), bcb)?;
        }
        Ok(())
    }

    /// Flush the fixed page if dirty, then unfix it.
    pub fn flush_and_unfix(&self, th: &ThreadCtx, page: crate::PageRef) -> DbResult<()> {
        self.flush(th, &page)?;
        self.unfix(th, page);
        Ok(())
    }

    /// WAL-respecting flush of a fixed page; same as `flush` in this
    /// implementation and kept for call sites that spell the WAL rule out.
    pub fn flush_with_wal(&self, th: &ThreadCtx, page: &crate::PageRef) -> DbResult<()> {
        self.flush(th, page)
    }

    fn flush_all_helper(
        &self,
        th: &ThreadCtx,
        volid: Option<VolId>,
        unfixed_only: bool,
        reset_lsa: bool,
    ) -> DbResult<()> {
        for frame in 0..self.frames.len() {
            let bcb = self.frames[frame].bcb.lock();
            if !bcb.dirty
                || (unfixed_only && bcb.fix_count > 0)
                || volid.is_some_and(|v| v != bcb.vpid.volid)
            {
                continue;
            }
            if reset_lsa {
                self.frames[frame].page.write().set_lsa(Lsa::NULL)?;
            }
            self.flush_bcb(th, frame, bcb, true)?;
        }
        Ok(())
    }

    /// Flush every dirty page, optionally restricted to one volume.
    pub fn flush_all(&self, th: &ThreadCtx, volid: Option<VolId>) -> DbResult<()> {
        self.flush_all_helper(th, volid, false, false)
    }

    /// Flush every dirty page that is not currently fixed.
    pub fn flush_all_unfixed(&self, th: &ThreadCtx, volid: Option<VolId>) -> DbResult<()> {
        self.flush_all_helper(th, volid, true, false)
    }

    /// Flush every unfixed dirty page after resetting its page LSA to the
    /// initialized-permanent sentinel. Backup coordination only.
    pub fn flush_all_unfixed_and_reset_lsa(
        &self,
        th: &ThreadCtx,
        volid: Option<VolId>,
    ) -> DbResult<()> {
        self.flush_all_helper(th, volid, true, true)
    }

    /// Checkpoint flush: barrier the log up to `flush_upto_lsa`, flush
    /// every frame whose oldest unflushed LSA is at or before it, and
    /// return the smallest oldest-unflush LSA left behind (null when
    /// nothing dirty remains below the ceiling).
    ///
    /// Frames held in write mode are re-fixed for read and flushed through
    /// the ordinary path. A frame dirtied before `prev_chkpt_redo_lsa` is a
    /// bookkeeping bug: it is reported and skipped.
    pub fn flush_checkpoint(
        &self,
        th: &ThreadCtx,
        flush_upto_lsa: Lsa,
        prev_chkpt_redo_lsa: Option<Lsa>,
    ) -> DbResult<Lsa> {
        self.wal.flush_up_to(flush_upto_lsa)?;
        let mut smallest_lsa = Lsa::NULL;
        let pace = Duration::from_millis(self.cfg.checkpoint_flush_pace_msecs);

        for frame in 0..self.frames.len() {
            if self.is_shutdown() {
                return Err(DbError::Interrupted);
            }

            let mut bcb = self.frames[frame].bcb.lock();
            let oldest = bcb.oldest_unflush_lsa;
            if !bcb.dirty {
                continue;
            }
            if !oldest.is_null() && oldest > flush_upto_lsa {
                // Above the ceiling: left dirty, but it bounds the next
                // checkpoint's redo start.
                if smallest_lsa.is_null() || oldest < smallest_lsa {
                    smallest_lsa = oldest;
                }
                continue;
            }

            if let Some(prev_redo) = prev_chkpt_redo_lsa
                && !prev_redo.is_null()
                && !oldest.is_null()
                && oldest < prev_redo
            {
                tracing::error!(
                    vpid = %bcb.vpid, %oldest, %prev_redo,
                    "page dirtied before the previous checkpoint redo point"
                );
                debug_assert!(false, "oldest unflush LSA precedes checkpoint redo");
                continue;
            }

            let flushed_inline = if !bcb.avoid_victim
                && matches!(
                    bcb.latch_mode,
                    LatchMode::None | LatchMode::Read | LatchMode::Flush
                ) {
                match self.flush_page_with_wal(frame, bcb) {
                    Ok(guard) => {
                        bcb = guard;
                        true
                    }
                    Err(_) => {
                        bcb = self.frames[frame].bcb.lock();
                        false
                    }
                }
            } else {
                false
            };

            if flushed_inline {
                drop(bcb);
                if !pace.is_zero() {
                    std::thread::sleep(pace);
                }
                continue;
            }

            if oldest.is_null() {
                // The page skipped logging; nothing to order against.
                continue;
            }

            // Write latched by someone else: pin the frame against reuse,
            // then take a read latch of our own and flush through it.
            bcb.avoid_victim = true;
            let vpid = bcb.vpid;
            drop(bcb);

            let fixed = self.fix(
                th,
                vpid,
                PageFetch::Old,
                FixMode::Read,
                FixCondition::Unconditional,
                PageType::Unknown,
            );
            match fixed {
                Ok(page) => {
                    let flushed = self.flush_with_wal(th, &page);
                    let mut bcb = self.frames[frame].bcb.lock();
                    if flushed.is_err()
                        && !bcb.oldest_unflush_lsa.is_null()
                        && (smallest_lsa.is_null() || bcb.oldest_unflush_lsa < smallest_lsa)
                    {
                        smallest_lsa = bcb.oldest_unflush_lsa;
                    }
                    bcb.avoid_victim = false;
                    drop(bcb);
                    self.unfix(th, page);
                }
                Err(_) => {
                    let mut bcb = self.frames[frame].bcb.lock();
                    if !bcb.oldest_unflush_lsa.is_null()
                        && (smallest_lsa.is_null() || bcb.oldest_unflush_lsa < smallest_lsa)
                    {
                        smallest_lsa = bcb.oldest_unflush_lsa;
                    }
                    bcb.avoid_victim = false;
                }
            }
        }

        Ok(smallest_lsa)
    }

    /// One round of the background victim-candidate flusher.
    ///
    /// Scans `max(1, per-list capacity * flush_ratio)` frames up from the
    /// bottom of each LRU list, collects unfixed dirty frames not already
    /// being flushed, sorts them by (volume, page) to batch IO against each
    /// volume, and flushes them in two passes: the first skips pages whose
    /// LSA is not durably logged yet, the second forces the barrier. The
    /// flusher cleans frames but never evicts them.
    pub fn flush_victim_candidates(&self, th: &ThreadCtx, flush_ratio: f32) -> DbResult<usize> {
        tracing::info!("victim candidate flush started");

        let mut state = self.flush_state.lock();
        let num_lists = self.num_lru_lists;
        let start_idx = (state.last_flushed_list_idx + 1) % num_lists;
        let check_count = ((self.per_list_capacity as f32 * flush_ratio) as usize).max(1);

        state.candidates.clear();
        let mut lru_idx = start_idx;
        loop {
            let list = self.lru[lru_idx].lock();
            let cold_len = list.cold.len();
            for scanned in 0..cold_len.min(check_count) {
                let frame = list.cold[cold_len - 1 - scanned];
                let Some(bcb) = self.frames[frame].bcb.try_lock() else {
                    continue;
                };
                if bcb.fix_count == 0 && bcb.dirty && bcb.latch_mode != LatchMode::Flush {
                    state.candidates.push(VictimCandidate {
                        frame,
                        vpid: bcb.vpid,
                        oldest_unflush_lsa: bcb.oldest_unflush_lsa,
                    });
                }
            }
            drop(list);

            // Advance even when nothing was collected, so the next round
            // starts from the following list.
            state.last_flushed_list_idx = lru_idx;
            lru_idx = (lru_idx + 1) % num_lists;
            if lru_idx == start_idx {
                break;
            }
        }

        if state.candidates.is_empty() {
            tracing::info!(flushed = 0, "victim candidate flush finished");
            return Ok(0);
        }

        state
            .candidates
            .sort_by_key(|c| (c.vpid.volid, c.vpid.pageid));

        let mut flushed = 0usize;
        let mut pass = 1;
        while flushed == 0 && pass <= 2 {
            for i in 0..state.candidates.len() {
                let cand = state.candidates[i];
                let bcb = self.frames[cand.frame].bcb.lock();
                if bcb.vpid != cand.vpid
                    || !bcb.dirty
                    || self.frames[cand.frame].zone.get() != Zone::Lru2
                    || bcb.latch_mode != LatchMode::None
                    || bcb.oldest_unflush_lsa != cand.oldest_unflush_lsa
                    || bcb.avoid_victim
                {
                    continue;
                }

                if pass == 1 {
                    let page_lsa = self.frames[cand.frame].page.read().lsa()?;
                    if self.wal.need_wal(page_lsa) {
                        // Not durably logged yet; leave it for the forced
                        // pass so this round does not stall on the log.
                        continue;
                    }
                }

                match self.flush_page_with_wal(cand.frame, bcb) {
                    Ok(_bcb) => flushed += 1,
                    Err(err) => {
                        tracing::info!(flushed, "victim candidate flush finished");
                        return Err(err);
                    }
                }
            }
            pass += 1;
        }

        tracing::info!(flushed, "victim candidate flush finished");
        Ok(flushed)
    }
}
