//! Hash index over resident pages, plus the buffer-lock chains that
//! serialize concurrent read-ins of the same page.
//!
//! Each bucket's mutex protects both its frame chain and its buffer-lock
//! chain. The chain stores `(vpid, frame)` pairs: a frame's vpid only
//! changes at unlink time, which holds the bucket mutex, so the pairs are
//! trustworthy while the bucket is locked. The bucket mutex is never held
//! across a blocking BCB acquisition: candidates are try-locked, and a
//! contended BCB is acquired only after the bucket mutex is dropped, with
//! the vpid re-verified afterwards. That discipline is what makes it safe
//! for `unlink` to take the bucket mutex while the BCB mutex is held.

use crate::BufferPool;
use crate::bcb::Bcb;
use crate::threads::{ResumeStatus, ThreadCtx};
use common::Vpid;
use parking_lot::{Mutex, MutexGuard};

/// Buckets per frame; chains stay short.
const BUCKETS_PER_FRAME: usize = 8;

/// One in-flight disk read-in: the holder thread reads the page while
/// waiters sleep until it is published into the hash.
pub(crate) struct BufLock {
    pub vpid: Vpid,
    pub owner: usize,
    pub waiters: Vec<usize>,
}

#[derive(Default)]
pub(crate) struct Bucket {
    /// `(vpid, frame)` pairs, most recently published first.
    pub chain: Vec<(Vpid, usize)>,
    pub locks: Vec<BufLock>,
}

pub(crate) struct HashTable {
    buckets: Box<[Mutex<Bucket>]>,
}

impl HashTable {
    pub(crate) fn new(num_frames: usize) -> Self {
        let size = (num_frames * BUCKETS_PER_FRAME).next_power_of_two().max(8);
        Self {
            buckets: (0..size).map(|_| Mutex::new(Bucket::default())).collect(),
        }
    }

    pub(crate) fn bucket_of(&self, vpid: Vpid) -> usize {
        let key = ((vpid.volid.0 as u64) << 32) ^ (vpid.pageid.0 as u32 as u64);
        (key.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 17) as usize & (self.buckets.len() - 1)
    }

    pub(crate) fn bucket(&self, index: usize) -> &Mutex<Bucket> {
        &self.buckets[index]
    }
}

/// Outcome of a hash probe.
pub(crate) enum HashLookup<'a> {
    /// Frame found; its BCB mutex is held and the vpid verified.
    Hit(usize, MutexGuard<'a, Bcb>),
    /// Not resident; the bucket mutex is still held for `lock_page`.
    Miss(MutexGuard<'a, Bucket>),
}

/// Outcome of `lock_page`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageLock {
    /// This thread owns the read-in and must publish then unlock.
    Holder,
    /// Another thread was reading the page in; retry the fix from the top.
    Waiter,
}

impl BufferPool {
    /// Find the frame holding `vpid`, if resident.
    pub(crate) fn search_hash(&self, vpid: Vpid) -> HashLookup<'_> {
        let bidx = self.hash.bucket_of(vpid);
        loop {
            let bucket = self.hash.bucket(bidx).lock();
            let Some(&(_, frame)) = bucket.chain.iter().find(|(v, _)| *v == vpid) else {
                return HashLookup::Miss(bucket);
            };

            if let Some(bcb) = self.frames[frame].bcb.try_lock() {
                debug_assert_eq!(bcb.vpid, vpid);
                return HashLookup::Hit(frame, bcb);
            }

            // Contended BCB: drop the bucket mutex before blocking on it,
            // then re-verify the frame was not repurposed meanwhile.
            drop(bucket);
            let bcb = self.frames[frame].bcb.lock();
            if bcb.vpid == vpid {
                return HashLookup::Hit(frame, bcb);
            }
        }
    }

    /// Serialize a read-in of `vpid`. The caller holds the bucket mutex
    /// (inherited from a `search_hash` miss); it is released before return.
    pub(crate) fn lock_page(
        &self,
        th: &ThreadCtx,
        mut bucket: MutexGuard<'_, Bucket>,
        vpid: Vpid,
    ) -> PageLock {
        if let Some(lock) = bucket.locks.iter_mut().find(|l| l.vpid == vpid) {
            lock.waiters.push(th.index());

            let slot = self.threads.slot(th.index());
            let mut ws = slot.wait.lock();
            ws.resume = ResumeStatus::Suspended;
            drop(bucket);
            while ws.resume == ResumeStatus::Suspended {
                slot.cond.wait(&mut ws);
            }
            let resumed = ws.resume == ResumeStatus::Resumed;
            ws.resume = ResumeStatus::Idle;
            drop(ws);

            if !resumed {
                // Interrupted before the holder published: de-link from the
                // waiter queue so the eventual wakeup pass skips us.
                let bidx = self.hash.bucket_of(vpid);
                let mut bucket = self.hash.bucket(bidx).lock();
                if let Some(lock) = bucket.locks.iter_mut().find(|l| l.vpid == vpid) {
                    lock.waiters.retain(|&t| t != th.index());
                }
            }
            return PageLock::Waiter;
        }

        bucket.locks.push(BufLock {
            vpid,
            owner: th.index(),
            waiters: Vec::new(),
        });
        PageLock::Holder
    }

    /// Drop the buffer lock on `vpid` and wake every thread that piled up
    /// behind the read-in.
    pub(crate) fn unlock_page(&self, vpid: Vpid) {
        let bidx = self.hash.bucket_of(vpid);
        let mut bucket = self.hash.bucket(bidx).lock();
        let Some(pos) = bucket.locks.iter().position(|l| l.vpid == vpid) else {
            return;
        };
        let lock = bucket.locks.swap_remove(pos);
        drop(bucket);

        for waiter in lock.waiters {
            self.threads.slot(waiter).wake(ResumeStatus::Resumed);
        }
    }

    /// Publish a freshly read frame into the hash and release the buffer
    /// lock in one bucket critical section. The caller must not hold the
    /// frame's BCB mutex.
    pub(crate) fn publish_and_unlock(&self, vpid: Vpid, frame: usize) {
        let bidx = self.hash.bucket_of(vpid);
        let mut bucket = self.hash.bucket(bidx).lock();
        bucket.chain.insert(0, (vpid, frame));

        let waiters = bucket
            .locks
            .iter()
            .position(|l| l.vpid == vpid)
            .map(|pos| bucket.locks.swap_remove(pos).waiters);
        drop(bucket);

        for waiter in waiters.into_iter().flatten() {
            self.threads.slot(waiter).wake(ResumeStatus::Resumed);
        }
    }

    /// Remove the frame from its bucket chain and clear its vpid. The
    /// caller holds the BCB mutex; fails if a flusher raised `avoid_victim`
    /// after the frame was chosen.
    pub(crate) fn unlink_from_hash(&self, frame: usize, bcb: &mut Bcb) -> bool {
        let bidx = self.hash.bucket_of(bcb.vpid);
        let mut bucket = self.hash.bucket(bidx).lock();
        if bcb.avoid_victim {
            return false;
        }
        let Some(pos) = bucket.chain.iter().position(|&(_, f)| f == frame) else {
            debug_assert!(false, "frame {frame} missing from its hash chain");
            return false;
        };
        bucket.chain.remove(pos);
        drop(bucket);
        bcb.vpid = Vpid::NULL;
        true
    }
}
