//! Two-zone LRU lists.
//!
//! Each list is split into a hot zone (LRU-1) and a cold zone (LRU-2). The
//! front of the hot deque is the list top, its back is the middle pointer,
//! and the back of the cold deque is the bottom that victim sweeps start
//! from. Pages map to a list by `pageid mod num_lists`, so one access
//! pattern stays clustered on one list.

use std::collections::VecDeque;

pub(crate) struct LruList {
    /// LRU-1: top..=middle.
    pub hot: VecDeque<usize>,
    /// LRU-2: everything colder, back is the bottom.
    pub cold: VecDeque<usize>,
}

impl LruList {
    pub(crate) fn new() -> Self {
        Self {
            hot: VecDeque::new(),
            cold: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn hot_count(&self) -> usize {
        self.hot.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, frame: usize) -> bool {
        self.hot.contains(&frame) || self.cold.contains(&frame)
    }

    /// Unlink the frame from whichever zone holds it. Returns false if the
    /// frame was not on this list.
    pub(crate) fn remove(&mut self, frame: usize) -> bool {
        if let Some(pos) = self.hot.iter().position(|&f| f == frame) {
            self.hot.remove(pos);
            return true;
        }
        if let Some(pos) = self.cold.iter().position(|&f| f == frame) {
            self.cold.remove(pos);
            return true;
        }
        false
    }

    /// Put the frame at the top of the hot zone; the caller demotes any
    /// overflow afterwards.
    pub(crate) fn push_top(&mut self, frame: usize) {
        self.hot.push_front(frame);
    }

    /// Put the frame at the bottom of the cold zone.
    pub(crate) fn push_bottom(&mut self, frame: usize) {
        self.cold.push_back(frame);
    }

    /// Move hot-zone overflow past the middle pointer into the cold zone.
    /// Returns the demoted frames so the caller can update their zone tags.
    pub(crate) fn demote_overflow(&mut self, hot_threshold: usize) -> Vec<usize> {
        let mut demoted = Vec::new();
        while self.hot.len() > hot_threshold {
            let Some(frame) = self.hot.pop_back() else {
                break;
            };
            self.cold.push_front(frame);
            demoted.push(frame);
        }
        demoted
    }
}

use crate::BufferPool;
use crate::bcb::{Bcb, Zone};
use common::Vpid;

impl BufferPool {
    /// LRU list a page belongs to. The probe page id used during victim
    /// sweeps may walk past the real id, hence the modular arithmetic on a
    /// widened value.
    pub(crate) fn lru_index(&self, vpid: Vpid) -> usize {
        (vpid.pageid.0 as i64).rem_euclid(self.num_lru_lists as i64) as usize
    }

    /// Move the frame to the top of its LRU list, promoting it into the
    /// hot zone and demoting any overflow past the middle pointer. The
    /// caller holds the BCB mutex.
    pub(crate) fn promote_to_top(&self, frame: usize, bcb: &mut Bcb) {
        debug_assert!(self.frames[frame].zone.get() != Zone::Lru1);

        let idx = self.lru_index(bcb.vpid);
        let mut list = self.lru[idx].lock();
        if self.frames[frame].zone.get() == Zone::Lru2 {
            list.remove(frame);
        }
        list.push_top(frame);
        self.frames[frame].zone.set(Zone::Lru1);

        for demoted in list.demote_overflow(self.hot_threshold) {
            self.frames[demoted].zone.set(Zone::Lru2);
        }
    }

    /// Put the frame back at the bottom of its list (a failed victim
    /// candidate re-enters where it was taken from).
    pub(crate) fn relocate_bottom(&self, frame: usize, bcb: &Bcb) {
        let idx = self.lru_index(bcb.vpid);
        let mut list = self.lru[idx].lock();
        list.push_bottom(frame);
        self.frames[frame].zone.set(Zone::Lru2);
    }

    /// Unlink the frame from its LRU list. The caller holds the BCB mutex.
    pub(crate) fn remove_from_lru(&self, frame: usize, bcb: &Bcb) {
        let idx = self.lru_index(bcb.vpid);
        let mut list = self.lru[idx].lock();
        if list.remove(frame) {
            self.frames[frame].zone.set(Zone::Void);
        }
    }
}
