//! Per-thread tables of held frames.
//!
//! Each thread owns a list of `(frame, fix_count)` records; the sum of a
//! frame's holder counts across all threads equals the frame's fix count.
//! The table is the single source of truth for reentrant latching and for
//! unfix-all at request termination. Lists are short, so a linear scan is
//! fine.

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Holder {
    pub frame: usize,
    pub fix_count: u32,
}

pub(crate) struct HolderTable {
    lists: Box<[Mutex<Vec<Holder>>]>,
}

impl HolderTable {
    pub(crate) fn new(max_threads: usize) -> Self {
        Self {
            lists: (0..max_threads.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Fix count this thread holds on the frame, if any.
    pub(crate) fn count(&self, thread: usize, frame: usize) -> Option<u32> {
        self.lists[thread]
            .lock()
            .iter()
            .find(|h| h.frame == frame)
            .map(|h| h.fix_count)
    }

    /// Record one more fix, creating the holder record if needed.
    pub(crate) fn add_fix(&self, thread: usize, frame: usize) {
        let mut list = self.lists[thread].lock();
        match list.iter_mut().find(|h| h.frame == frame) {
            Some(holder) => holder.fix_count += 1,
            None => list.push(Holder {
                frame,
                fix_count: 1,
            }),
        }
    }

    /// Record a fresh holder with the given count (used when a blocked
    /// request was granted with a folded-in fix count).
    pub(crate) fn push(&self, thread: usize, frame: usize, fix_count: u32) {
        debug_assert!(self.count(thread, frame).is_none());
        self.lists[thread].lock().push(Holder { frame, fix_count });
    }

    /// Drop one fix; the record disappears when its count reaches zero.
    /// Returns false if the thread held no fix on the frame.
    pub(crate) fn release_fix(&self, thread: usize, frame: usize) -> bool {
        let mut list = self.lists[thread].lock();
        let Some(pos) = list.iter().position(|h| h.frame == frame) else {
            return false;
        };
        list[pos].fix_count -= 1;
        if list[pos].fix_count == 0 {
            list.swap_remove(pos);
        }
        true
    }

    /// Remove the whole holder record, returning its count (write-upgrade
    /// transfer).
    pub(crate) fn remove(&self, thread: usize, frame: usize) -> Option<u32> {
        let mut list = self.lists[thread].lock();
        let pos = list.iter().position(|h| h.frame == frame)?;
        Some(list.swap_remove(pos).fix_count)
    }

    /// First held frame of the thread, if any.
    pub(crate) fn first(&self, thread: usize) -> Option<Holder> {
        self.lists[thread].lock().first().copied()
    }

    #[cfg(test)]
    pub(crate) fn held(&self, thread: usize) -> Vec<Holder> {
        self.lists[thread].lock().clone()
    }

    /// Sum of the frame's holder counts across all threads.
    #[cfg(test)]
    pub(crate) fn total_fix_count(&self, frame: usize) -> u32 {
        self.lists
            .iter()
            .map(|list| {
                list.lock()
                    .iter()
                    .filter(|h| h.frame == frame)
                    .map(|h| h.fix_count)
                    .sum::<u32>()
            })
            .sum()
    }
}
