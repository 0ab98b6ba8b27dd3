//! Frame allocation: the invalid list, victim sweeps over LRU bottoms, and
//! victimization of a chosen frame.

use crate::BufferPool;
use crate::bcb::{Bcb, LatchMode, Zone};
use crate::threads::ThreadCtx;
use common::{DbError, DbResult, PageId, Vpid};
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Retries of the inner invalid-list/LRU probe before moving to the next
/// list.
const ALLOC_SLEEP_MAX: usize = 1;

/// Full sweeps over every LRU list before giving up with an error.
const ALLOC_MAX_CYCLES: usize = 64;

impl BufferPool {
    /// Allocate a free frame for `vpid`, evicting a cold page if needed.
    /// On success the frame is unhashed, in the void zone, and returned
    /// with its BCB mutex held.
    pub(crate) fn allocate_bcb(
        &self,
        th: &ThreadCtx,
        vpid: Vpid,
    ) -> DbResult<(usize, MutexGuard<'_, Bcb>)> {
        let mut check_count = (self.per_list_capacity as f32 * self.cfg.buffer_flush_ratio)
            .max(1.0) as usize;
        check_count = check_count.max(self.min_victim_candidates());

        for cycle in 0..ALLOC_MAX_CYCLES {
            let mut probe = vpid;
            for _ in 0..self.num_lru_lists {
                for _ in 0..ALLOC_SLEEP_MAX {
                    if let Some(found) = self.take_from_invalid_list() {
                        return Ok(found);
                    }
                    if let Some(found) = self.victim_from_lru(th, probe, check_count)? {
                        return Ok(found);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                probe.pageid = PageId(probe.pageid.0.wrapping_add(1));
            }

            self.poll_interrupt(th)?;
            if self.is_shutdown() {
                return Err(DbError::Interrupted);
            }
            tracing::warn!(
                check_count,
                cycle,
                "no victim found: all scanned buffers dirty or fixed"
            );
            check_count = self.per_list_capacity.saturating_sub(self.hot_threshold).max(1);
        }

        Err(DbError::AllBuffersFixed)
    }

    fn min_victim_candidates(&self) -> usize {
        (self.per_list_capacity / 10).max(1)
    }

    /// Pop the top of the invalid list.
    pub(crate) fn take_from_invalid_list(&self) -> Option<(usize, MutexGuard<'_, Bcb>)> {
        let frame = {
            let mut invalid = self.invalid.lock();
            invalid.pop()?
        };
        let bcb = self.frames[frame].bcb.lock();
        self.frames[frame].zone.set(Zone::Void);
        Some((frame, bcb))
    }

    /// Push a frame onto the invalid list, consuming its guard.
    pub(crate) fn move_to_invalid_list(&self, frame: usize, mut bcb: MutexGuard<'_, Bcb>) {
        bcb.vpid = Vpid::NULL;
        bcb.latch_mode = LatchMode::Invalid;
        self.frames[frame].zone.set(Zone::Invalid);
        let mut invalid = self.invalid.lock();
        invalid.push(frame);
        drop(bcb);
    }

    /// Sweep up to `check_count` frames from the bottom of the LRU list
    /// chosen by `probe`, victimize the first reusable one, and hand it
    /// back locked. A dirty bottom wakes the background flusher, or flushes
    /// inline during recovery redo when no flusher runs.
    fn victim_from_lru(
        &self,
        th: &ThreadCtx,
        probe: Vpid,
        check_count: usize,
    ) -> DbResult<Option<(usize, MutexGuard<'_, Bcb>)>> {
        let idx = self.lru_index(probe);

        let mut found = None;
        let mut bottom_dirty = false;
        {
            let mut list = self.lru[idx].lock();
            let cold_len = list.cold.len();
            for scanned in 0..cold_len.min(check_count) {
                let pos = cold_len - 1 - scanned;
                let frame = list.cold[pos];
                let Some(bcb) = self.frames[frame].bcb.try_lock() else {
                    continue;
                };
                if bcb.dirty
                    || bcb.avoid_victim
                    || bcb.fix_count != 0
                    || bcb.latch_mode != LatchMode::None
                    || bcb.has_blocked_reader_writer_victim()
                {
                    continue;
                }
                list.cold.remove(pos);
                self.frames[frame].zone.set(Zone::Void);
                found = Some((frame, bcb));
                break;
            }

            if let Some(&bottom) = list.cold.back()
                && let Some(bcb) = self.frames[bottom].bcb.try_lock()
            {
                bottom_dirty = bcb.dirty;
            }
        }

        if bottom_dirty {
            if self.wal.is_recovery_redo() {
                self.flush_victim_candidates(th, self.cfg.buffer_flush_ratio)?;
            } else {
                self.wake_flusher();
            }
        }

        let Some((frame, mut bcb)) = found else {
            return Ok(None);
        };

        // Victimize: the conditions above still hold since the mutex was
        // never released. The hash unlink re-checks avoid_victim under the
        // bucket mutex all the same.
        bcb.latch_mode = LatchMode::Victim;
        if !self.unlink_from_hash(frame, &mut bcb) {
            bcb.latch_mode = LatchMode::None;
            self.relocate_bottom(frame, &bcb);
            drop(bcb);
            return Ok(None);
        }
        self.stats.victims.fetch_add(1, Ordering::Relaxed);
        Ok(Some((frame, bcb)))
    }
}
