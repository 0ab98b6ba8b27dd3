//! The fix/unfix pipelines, invalidation paths, dirty/LSA bookkeeping, and
//! page-type stamping.

use crate::BufferPool;
use crate::bcb::{FixCondition, FixMode, LatchMode, PageFetch, Zone};
use crate::hash::{HashLookup, PageLock};
use crate::threads::ThreadCtx;
use crate::{PageRef, VALIDATION_FETCH};
use common::{DbError, DbResult, Lsa, PageId, PageType, VolId, Vpid};
use std::sync::atomic::Ordering;
use storage::PageValidity;

/// Byte the page body is filled with when a debug build scrambles an
/// invalidated frame.
const SCRAMBLE_BYTE: u8 = 0x77;

impl BufferPool {
    /// Fix a page in the pool, reading it from disk on a miss, and return a
    /// latched reference to it.
    ///
    /// New pages are served straight from a free frame without disk IO and
    /// must be requested write/unconditional. A conditional request under a
    /// no-wait transaction setting is what an unconditional request
    /// degrades to; an ungrantable conditional request fails with a
    /// timeout-class error and touches nothing.
    ///
    /// # Errors
    ///
    /// `Interrupted`, `PageTimeout`, `BadPageId`, `AllBuffersFixed`, and IO
    /// errors from the read-in path.
    pub fn fix(
        &self,
        th: &ThreadCtx,
        vpid: Vpid,
        fetch: PageFetch,
        mode: FixMode,
        condition: FixCondition,
        ptype: PageType,
    ) -> DbResult<PageRef> {
        if fetch == PageFetch::New
            && (mode != FixMode::Write || condition != FixCondition::Unconditional)
        {
            return Err(DbError::InvariantViolation(format!(
                "new page {vpid} must be fixed write/unconditional"
            )));
        }

        if self.cfg.debug_page_validation_level >= VALIDATION_FETCH
            && fetch == PageFetch::Old
            && self.disk.is_page_valid(vpid) != PageValidity::Valid
        {
            return Err(DbError::BadPageId(vpid));
        }

        if vpid.pageid.0 < 0 {
            tracing::error!(
                %vpid,
                volume = self.disk.volume_label(vpid.volid).unwrap_or_default(),
                "fix of a negative page id"
            );
            return Err(DbError::BadPageId(vpid));
        }

        let mut condition = condition;
        if condition == FixCondition::Unconditional
            && self.threads.wait_mode(th.index()).is_zero()
        {
            condition = FixCondition::Conditional;
        }

        let (frame, bcb, buf_lock_acquired) = loop {
            self.poll_interrupt(th)?;

            match self.search_hash(vpid) {
                HashLookup::Hit(frame, bcb) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    if fetch == PageFetch::New {
                        // An invalidated page may linger in the buffer and
                        // be handed out again as new.
                        debug_assert!(bcb.oldest_unflush_lsa.is_null() || bcb.dirty);
                    }
                    break (frame, bcb, false);
                }
                HashLookup::Miss(bucket) => match self.lock_page(th, bucket, vpid) {
                    PageLock::Waiter => continue,
                    PageLock::Holder => {
                        let (frame, mut bcb) = match self.allocate_bcb(th, vpid) {
                            Ok(found) => found,
                            Err(err) => {
                                self.unlock_page(vpid);
                                return Err(err);
                            }
                        };

                        bcb.vpid = vpid;
                        bcb.dirty = false;
                        bcb.latch_mode = LatchMode::None;
                        bcb.async_flush_request = false;
                        bcb.oldest_unflush_lsa = Lsa::NULL;

                        if let Err(err) =
                            self.initialize_frame_image(frame, &mut bcb, vpid, fetch)
                        {
                            // The frame may hold a torn image; recycle it
                            // and let waiters retry from the top.
                            self.move_to_invalid_list(frame, bcb);
                            self.unlock_page(vpid);
                            return Err(err);
                        }

                        break (frame, bcb, true);
                    }
                },
            }
        };

        // Page-type pass: stamp new or untyped pages, verify the rest.
        if let Err(err) = self.apply_page_type(frame, vpid, fetch, ptype) {
            drop(bcb);
            if buf_lock_acquired {
                let bcb = self.frames[frame].bcb.lock();
                self.move_to_invalid_list(frame, bcb);
                self.unlock_page(vpid);
            }
            return Err(err);
        }

        if let Err(err) = self.latch_on_fix(th, frame, bcb, mode, buf_lock_acquired, condition) {
            if buf_lock_acquired {
                let bcb = self.frames[frame].bcb.lock();
                self.move_to_invalid_list(frame, bcb);
                self.unlock_page(vpid);
            }
            return Err(err);
        }

        if buf_lock_acquired {
            self.publish_and_unlock(vpid, frame);
        }

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(PageRef::new(frame, vpid))
    }

    /// Load or initialize the image of a freshly allocated frame. The
    /// caller holds the BCB mutex; the frame is not hashed yet, so the
    /// image lock is uncontended.
    fn initialize_frame_image(
        &self,
        frame: usize,
        bcb: &mut crate::bcb::Bcb,
        vpid: Vpid,
        fetch: PageFetch,
    ) -> DbResult<()> {
        let mut page = self.frames[frame].page.write();
        if fetch == PageFetch::Old {
            *page = self.disk.read_page(vpid)?;
            self.stats.ioreads.fetch_add(1, Ordering::Relaxed);

            // Temporary-volume pages are pinned to the temporary LSA
            // sentinel as soon as they come in.
            if self.is_temporary_volume(vpid.volid) && !page.lsa()?.is_init_temp() {
                page.set_lsa(Lsa::INIT_TEMP)?;
                bcb.dirty = true;
                self.stats.dirties.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            page.init_reserved()?;
            if self.is_temporary_volume(vpid.volid) {
                page.set_lsa(Lsa::INIT_TEMP)?;
            }
        }
        Ok(())
    }

    fn apply_page_type(
        &self,
        frame: usize,
        vpid: Vpid,
        fetch: PageFetch,
        ptype: PageType,
    ) -> DbResult<()> {
        if fetch == PageFetch::New {
            return self.stamp_page_type(frame, vpid, ptype);
        }
        let stored = self.page_type_of(frame, vpid)?;
        if stored == PageType::Unknown {
            self.stamp_page_type(frame, vpid, ptype)?;
        } else if !ptype.is_compatible(stored) && !self.wal.is_recovery_redo() {
            tracing::error!(
                %vpid, expected = ?ptype, stored = ?stored,
                "fixed page has an unexpected type"
            );
            debug_assert!(false, "page type mismatch on fix");
        }
        Ok(())
    }

    /// Fix a brand-new page: always write mode, unconditional.
    pub fn fix_new(&self, th: &ThreadCtx, vpid: Vpid, ptype: PageType) -> DbResult<PageRef> {
        self.fix(
            th,
            vpid,
            PageFetch::New,
            FixMode::Write,
            FixCondition::Unconditional,
            ptype,
        )
    }

    /// Fix with retries on timeout-class failures.
    pub fn fix_with_retry(
        &self,
        th: &ThreadCtx,
        vpid: Vpid,
        fetch: PageFetch,
        mode: FixMode,
        ptype: PageType,
        retry_count: u32,
    ) -> DbResult<PageRef> {
        let mut last = None;
        for _ in 0..retry_count.max(1) {
            match self.fix(th, vpid, fetch, mode, FixCondition::Unconditional, ptype) {
                Ok(page) => return Ok(page),
                Err(err) if err.is_timeout() => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.expect("at least one attempt"))
    }

    /// Release one fix on the page. The frame becomes replaceable once its
    /// fix count drops to zero.
    pub fn unfix(&self, th: &ThreadCtx, page: PageRef) {
        self.unfix_frame(th, page.frame());
    }

    pub(crate) fn unfix_frame(&self, th: &ThreadCtx, frame: usize) {
        if !self.holders.release_fix(th.index(), frame) {
            tracing::error!(frame, "unfix by a thread holding no fix on the frame");
            debug_assert!(false, "unfix without holder record");
            return;
        }

        let bcb = self.frames[frame].bcb.lock();

        #[cfg(debug_assertions)]
        {
            let lsa = self.frames[frame].page.read().lsa().unwrap_or(Lsa::NULL);
            let well_formed = bcb.dirty == !bcb.oldest_unflush_lsa.is_null();
            if !well_formed
                && !lsa.is_init_temp()
                && !self.wal.is_recovery_redo()
                && self.holders.count(th.index(), frame).is_none()
                && !bcb.avoid_victim
            {
                tracing::debug!(vpid = %bcb.vpid, dirty = bcb.dirty, "dirty flag and oldest unflushed LSA disagree at unfix");
            }
        }

        if let Err(err) = self.unlatch_on_unfix(frame, bcb) {
            tracing::error!(%err, "deferred flush at unfix failed");
        }
    }

    /// Unfix everything the thread still holds. Pages held at request end
    /// are a caller bug; they are reported and released.
    pub fn unfix_all(&self, th: &ThreadCtx) {
        while let Some(holder) = self.holders.first(th.index()) {
            tracing::warn!(
                frame = holder.frame,
                fix_count = holder.fix_count,
                "page still fixed at request termination"
            );
            debug_assert!(false, "fixed pages leaked at request termination");
            for _ in 0..holder.fix_count {
                self.unfix_frame(th, holder.frame);
            }
        }
    }

    /// Invalidate the fixed page, detaching it from the pool so its frame
    /// can be reused immediately. With more than one fix outstanding this
    /// is just an unfix. Dirty pages are flushed first; the page image is
    /// durable even though the buffer forgets it.
    pub fn invalidate(&self, th: &ThreadCtx, page: PageRef) -> DbResult<()> {
        let frame = page.frame();
        let mut bcb = self.frames[frame].bcb.lock();

        if bcb.fix_count > 1 {
            if !self.holders.release_fix(th.index(), frame) {
                debug_assert!(false, "invalidate without holder record");
            }
            return self.unlatch_on_unfix(frame, bcb);
        }

        if bcb.dirty {
            bcb = self.flush_page_with_wal(frame, bcb)?;
        }

        let saved_vpid = bcb.vpid;
        if !self.holders.release_fix(th.index(), frame) {
            debug_assert!(false, "invalidate without holder record");
        }
        self.unlatch_on_unfix(frame, bcb)?;

        // Re-check under the mutex: the frame may have been re-fixed or
        // claimed by a flusher while unlatched.
        let mut bcb = self.frames[frame].bcb.lock();
        if bcb.vpid.is_null()
            || bcb.vpid != saved_vpid
            || bcb.fix_count > 0
            || bcb.avoid_victim
        {
            return Ok(());
        }

        if cfg!(debug_assertions) && self.cfg.debug_page_validation_level > 0 {
            self.frames[frame].page.write().body_mut().fill(SCRAMBLE_BYTE);
        }

        match bcb.latch_mode {
            LatchMode::Invalid | LatchMode::FlushInvalid | LatchMode::VictimInvalid => Ok(()),
            _ => {
                bcb.dirty = false;
                bcb.oldest_unflush_lsa = Lsa::NULL;
                if self.frames[frame].zone.get() != Zone::Void {
                    self.remove_from_lru(frame, &bcb);
                }
                match bcb.latch_mode {
                    LatchMode::None => {
                        if self.unlink_from_hash(frame, &mut bcb) {
                            self.move_to_invalid_list(frame, bcb);
                        }
                        Ok(())
                    }
                    LatchMode::Flush => {
                        bcb.latch_mode = LatchMode::FlushInvalid;
                        Ok(())
                    }
                    _ => {
                        bcb.latch_mode = LatchMode::VictimInvalid;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Invalidate every unfixed page, optionally restricted to one volume.
    /// Dirty pages are flushed first. Callers are expected to have quiesced
    /// writers for the target volume.
    pub fn invalidate_all(&self, th: &ThreadCtx, volid: Option<VolId>) -> DbResult<()> {
        for frame in 0..self.frames.len() {
            let mut bcb = self.frames[frame].bcb.lock();
            if bcb.vpid.is_null()
                || volid.is_some_and(|v| v != bcb.vpid.volid)
                || bcb.fix_count > 0
            {
                continue;
            }

            if bcb.dirty {
                let saved_vpid = bcb.vpid;
                self.flush_bcb(th, frame, bcb, true)?;

                bcb = self.frames[frame].bcb.lock();
                if bcb.vpid.is_null()
                    || bcb.vpid != saved_vpid
                    || volid.is_some_and(|v| v != bcb.vpid.volid)
                    || bcb.fix_count > 0
                    || bcb.avoid_victim
                {
                    continue;
                }
            }

            match bcb.latch_mode {
                LatchMode::Invalid | LatchMode::FlushInvalid | LatchMode::VictimInvalid => {}
                LatchMode::None => {
                    bcb.dirty = false;
                    bcb.oldest_unflush_lsa = Lsa::NULL;
                    if self.frames[frame].zone.get() != Zone::Void {
                        self.remove_from_lru(frame, &bcb);
                    }
                    if self.unlink_from_hash(frame, &mut bcb) {
                        self.move_to_invalid_list(frame, bcb);
                    }
                }
                LatchMode::Flush => {
                    bcb.dirty = false;
                    bcb.oldest_unflush_lsa = Lsa::NULL;
                    if self.frames[frame].zone.get() != Zone::Void {
                        self.remove_from_lru(frame, &bcb);
                    }
                    bcb.latch_mode = LatchMode::FlushInvalid;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Best-effort invalidation of a temporary list file's pages. Fixed
    /// pages are skipped without error; the sweep stops early at the last
    /// page of the in-buffer chain when the chain is followable.
    pub fn invalidate_temporary_file(
        &self,
        volid: VolId,
        first_pageid: PageId,
        npages: usize,
    ) {
        for i in 0..npages {
            let vpid = Vpid::new(volid, PageId(first_pageid.0 + i as i32));
            let HashLookup::Hit(frame, mut bcb) = self.search_hash(vpid) else {
                continue;
            };

            if bcb.fix_count > 0 {
                continue;
            }
            debug_assert_eq!(bcb.vpid, vpid);

            // List files chain pages through the first body word; a null
            // link marks the last page.
            let page = self.frames[frame].page.read();
            let next_link = i32::from_le_bytes(page.body()[..4].try_into().unwrap());
            drop(page);
            let is_last = next_link == PageId::NULL.0;

            bcb.dirty = false;
            bcb.oldest_unflush_lsa = Lsa::NULL;
            drop(bcb);

            if is_last {
                break;
            }
        }
    }

    /// Mark the fixed page modified. The oldest-unflush LSA is recorded
    /// when the page LSA is advanced, not here.
    pub fn set_dirty(&self, th: &ThreadCtx, page: &PageRef) {
        debug_assert!(self.holders.count(th.index(), page.frame()).is_some());
        let mut bcb = self.frames[page.frame()].bcb.lock();
        debug_assert!(!bcb.vpid.is_null());
        if !bcb.dirty {
            bcb.dirty = true;
            self.stats.dirties.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark modified and unfix in one step.
    pub fn set_dirty_and_unfix(&self, th: &ThreadCtx, page: PageRef) {
        self.set_dirty(th, &page);
        self.unfix(th, page);
    }

    /// The page LSA stamped in the reserved header.
    pub fn lsa(&self, page: &PageRef) -> DbResult<Lsa> {
        self.frames[page.frame()].page.read().lsa()
    }

    /// Advance the page LSA. Refused for pages already pinned to the
    /// temporary sentinel and for auxiliary volumes; pages of temporary
    /// volumes are re-pinned to the sentinel instead. The first transition
    /// away from a clean page records the oldest-unflush LSA, and an LSA
    /// behind the checkpoint redo point is a bookkeeping bug.
    pub fn set_lsa(&self, th: &ThreadCtx, page: &PageRef, lsa: Lsa) -> DbResult<Option<Lsa>> {
        let frame = page.frame();
        let mut bcb = self.frames[frame].bcb.lock();
        let mut image = self.frames[frame].page.write();

        if image.lsa()?.is_init_temp() || bcb.vpid.volid.is_auxiliary() {
            return Ok(None);
        }

        if self.is_temporary_volume(bcb.vpid.volid) {
            image.set_lsa(Lsa::INIT_TEMP)?;
            if self.threads.is_active(th.index()) {
                return Ok(None);
            }
        }

        image.set_lsa(lsa)?;

        if bcb.oldest_unflush_lsa.is_null() {
            let redo = self.wal.checkpoint_redo_lsa();
            if !redo.is_null() && lsa < redo {
                tracing::error!(
                    vpid = %bcb.vpid, %lsa, %redo,
                    "page LSA set behind the checkpoint redo point"
                );
                debug_assert!(false, "LSA precedes checkpoint redo");
            }
            bcb.oldest_unflush_lsa = lsa;
        }
        Ok(Some(lsa))
    }

    /// Pin the page to the temporary LSA sentinel and mark it dirty; such
    /// pages are never logged or recovered.
    pub fn set_lsa_as_temporary(&self, th: &ThreadCtx, page: &PageRef) -> DbResult<()> {
        debug_assert!(self.holders.count(th.index(), page.frame()).is_some());
        let frame = page.frame();
        let mut bcb = self.frames[frame].bcb.lock();
        self.frames[frame].page.write().set_lsa(Lsa::INIT_TEMP)?;
        if !bcb.dirty {
            bcb.dirty = true;
            self.stats.dirties.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Identity of the fixed page.
    pub fn vpid(&self, page: &PageRef) -> Vpid {
        page.vpid()
    }

    /// The page type stamped in the reserved header.
    pub fn page_type(&self, page: &PageRef) -> DbResult<PageType> {
        self.page_type_of(page.frame(), page.vpid())
    }

    fn page_type_of(&self, frame: usize, vpid: Vpid) -> DbResult<PageType> {
        self.check_page_identity(frame, vpid)?;
        self.frames[frame].page.read().ptype()
    }

    /// Stamp the page type; on a never-initialized header the page identity
    /// is stamped first and the LSA cleared.
    pub fn set_page_type(&self, page: &PageRef, ptype: PageType) -> DbResult<()> {
        self.stamp_page_type(page.frame(), page.vpid(), ptype)
    }

    pub(crate) fn stamp_page_type(
        &self,
        frame: usize,
        vpid: Vpid,
        ptype: PageType,
    ) -> DbResult<()> {
        let mut image = self.frames[frame].page.write();
        let identity = image.identity()?;
        if identity.is_null() && identity.volid.is_null() {
            debug_assert!(image.lsa()?.is_null() || image.lsa()?.is_init_temp());
            let lsa = image.lsa()?;
            image.init_reserved()?;
            image.set_lsa(lsa)?;
            image.set_identity(vpid)?;
        } else {
            debug_assert_eq!(identity, vpid);
        }
        image.set_ptype(ptype)
    }

    /// Whether the stored page type satisfies `expected`: exact match,
    /// family match, or `Unknown`. Always true during recovery redo, which
    /// legitimately observes transient types.
    pub fn check_page_type(&self, page: &PageRef, expected: PageType) -> DbResult<bool> {
        if self.wal.is_recovery_redo() {
            return Ok(true);
        }
        let stored = self.page_type(page)?;
        Ok(expected.is_compatible(stored))
    }

    /// Enforce the reserved-identity invariant: a page with a real LSA must
    /// carry its own identity in the header.
    fn check_page_identity(&self, frame: usize, vpid: Vpid) -> DbResult<()> {
        let image = self.frames[frame].page.read();
        if image.lsa()?.is_null() {
            return Ok(());
        }
        let identity = image.identity()?;
        if identity != vpid {
            let msg =
                format!("page {vpid} carries identity {identity} in its reserved header");
            tracing::error!("{msg}");
            debug_assert!(false, "{msg}");
            return Err(DbError::InvariantViolation(msg));
        }
        Ok(())
    }

    /// Copy part of a page body into a fresh buffer. When the page is not
    /// resident and `do_fetch` is false the image is read directly from
    /// disk without populating the pool.
    pub fn copy_to_area(
        &self,
        th: &ThreadCtx,
        vpid: Vpid,
        start_offset: usize,
        length: usize,
        do_fetch: bool,
    ) -> DbResult<Vec<u8>> {
        self.poll_interrupt(th)?;
        self.check_area_bounds(start_offset, length)?;

        let resident = match self.search_hash(vpid) {
            HashLookup::Hit(_, bcb) => {
                drop(bcb);
                true
            }
            HashLookup::Miss(bucket) => {
                drop(bucket);
                false
            }
        };

        if resident || do_fetch {
            let page = self.fix(
                th,
                vpid,
                PageFetch::Old,
                FixMode::Read,
                FixCondition::Unconditional,
                PageType::Unknown,
            )?;
            let image = self.page(&page);
            let area = image.body()[start_offset..start_offset + length].to_vec();
            drop(image);
            self.unfix(th, page);
            Ok(area)
        } else {
            let image = self.disk.read_page(vpid)?;
            Ok(image.body()[start_offset..start_offset + length].to_vec())
        }
    }

    /// Overwrite part of a page body from a buffer. The page is fixed as
    /// new (no read-in) and its LSA left alone, so the write skips logging.
    pub fn copy_from_area(
        &self,
        th: &ThreadCtx,
        vpid: Vpid,
        start_offset: usize,
        area: &[u8],
    ) -> DbResult<()> {
        self.poll_interrupt(th)?;
        self.check_area_bounds(start_offset, area.len())?;

        let page = self.fix(
            th,
            vpid,
            PageFetch::New,
            FixMode::Write,
            FixCondition::Unconditional,
            PageType::Area,
        )?;
        {
            let mut image = self.page_mut(&page);
            image.body_mut()[start_offset..start_offset + area.len()].copy_from_slice(area);
        }
        self.set_dirty_and_unfix(th, page);
        Ok(())
    }

    fn check_area_bounds(&self, start_offset: usize, length: usize) -> DbResult<()> {
        let body_len = self.cfg.page_size - storage::RESERVED_BYTES;
        if start_offset + length > body_len {
            return Err(DbError::Storage(format!(
                "area copy beyond page boundary: offset {start_offset} length {length}"
            )));
        }
        Ok(())
    }

    /// Remember a permanent volume as holding temporary data; its pages are
    /// pinned to the temporary LSA sentinel from now on.
    pub fn register_permanent_volume_as_temporary(&self, volid: VolId) {
        let mut info = self.vol_info.lock();
        if !info.temp_vols.contains(&volid) {
            info.temp_vols.push(volid);
        }
    }

    /// Refresh the cached highest permanent volume id; anything above it is
    /// a temporary volume.
    pub fn refresh_max_permanent_volume_id(&self, volid: VolId) {
        self.vol_info.lock().last_perm = volid;
    }

    pub(crate) fn is_temporary_volume(&self, volid: VolId) -> bool {
        let info = self.vol_info.lock();
        volid > info.last_perm || info.temp_vols.contains(&volid)
    }
}
