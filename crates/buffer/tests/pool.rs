//! End-to-end buffer pool scenarios: miss/hit, eviction, WAL ordering,
//! latch fairness, timeouts, and checkpoint flushing.

use buffer::{FixCondition, FixMode, PageFetch};
use common::{ClientInfo, DbError, Lsa, PageType, TranId, VolId, WaitMode};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use testsupport::prelude::*;

#[test]
fn miss_then_hit_serves_the_second_fix_from_memory() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let target = vpid(0, 10);

    let page = h.pool.fix_new(&th, target, PageType::Heap).unwrap();
    {
        let image = h.pool.page(&page);
        assert_eq!(image.identity().unwrap(), target);
        assert!(image.lsa().unwrap().is_null());
        assert_eq!(image.ptype().unwrap(), PageType::Heap);
    }
    h.pool.unfix(&th, page);

    let reads_before = h.pool.stats().ioreads;
    let page = h
        .pool
        .fix(
            &th,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before, "hit must not touch disk");
    assert_eq!(h.pool.vpid(&page), target);
    h.pool.unfix(&th, page);
}

#[test]
fn eviction_reads_the_new_page_and_drops_the_victim() {
    let h = PoolHarness::new(2);
    let th = h.thread();

    // Two resident clean pages, durably on disk so eviction loses nothing.
    for pageid in [1, 2] {
        let page = h.pool.fix_new(&th, vpid(0, pageid), PageType::Heap).unwrap();
        h.pool.page_mut(&page).body_mut()[0] = pageid as u8;
        h.pool.set_dirty(&th, &page);
        h.pool.flush_and_unfix(&th, page).unwrap();
    }

    let reads_before = h.pool.stats().ioreads;
    let page = h
        .pool
        .fix(
            &th,
            vpid(0, 5),
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Unknown,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before + 1);
    assert_eq!(h.pool.stats().victims, 1);
    h.pool.unfix(&th, page);

    // The evicted page comes back from disk intact.
    let page = h
        .pool
        .fix(
            &th,
            vpid(0, 1),
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.page(&page).body()[0], 1);
    h.pool.unfix(&th, page);
}

#[test]
fn background_flush_respects_the_wal_rule_and_keeps_the_page_hashed() {
    let h = PoolHarness::new(2);
    let th = h.thread();
    let target = vpid(0, 7);

    let page = h.pool.fix_new(&th, target, PageType::Heap).unwrap();
    h.pool.page_mut(&page).body_mut()[0] = 0x5A;
    h.pool.set_dirty(&th, &page);
    let lsa = h.mint_lsa(target).unwrap();
    h.pool.set_lsa(&th, &page, lsa).unwrap();
    h.pool.unfix(&th, page);

    // Demote the dirty page out of the hot zone so the flusher sees it.
    let filler = h.pool.fix_new(&th, vpid(0, 8), PageType::Heap).unwrap();
    h.pool.unfix(&th, filler);

    assert!(h.wal.need_wal(lsa), "page LSA must not be durable yet");
    let flushed = h.pool.flush_victim_candidates(&th, 1.0).unwrap();
    assert_eq!(flushed, 1);

    // The barrier ran before the write: the log is durable past the LSA.
    assert!(!h.wal.need_wal(lsa));
    assert_eq!(h.disk.read_page(target).unwrap().body()[0], 0x5A);

    // The flusher cleans but never evicts: the page is still a hit.
    let reads_before = h.pool.stats().ioreads;
    let page = h
        .pool
        .fix(
            &th,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before);
    h.pool.unfix(&th, page);
}

#[test]
fn writer_is_granted_before_readers_that_queued_behind_it() {
    let h = PoolHarness::new(4);
    let th_main = h.thread();
    let t1 = h.thread();
    let t2 = h.thread();
    let t3 = h.thread();
    let t4 = h.thread();
    let target = vpid(0, 1);

    let page = h.pool.fix_new(&th_main, target, PageType::Heap).unwrap();
    h.pool.unfix(&th_main, page);

    let read = |th: &buffer::ThreadCtx| {
        h.pool.fix(
            th,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
    };

    // T1 and T2 hold read latches.
    let p1 = read(&t1).unwrap();
    let p2 = read(&t2).unwrap();

    let writer_granted = Arc::new(AtomicBool::new(false));
    let reader_granted = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        let (writer_release_tx, writer_release_rx) = mpsc::channel::<()>();

        let pool = Arc::clone(&h.pool);
        let writer_flag = Arc::clone(&writer_granted);
        scope.spawn(move || {
            let page = pool
                .fix(
                    &t3,
                    target,
                    PageFetch::Old,
                    FixMode::Write,
                    FixCondition::Unconditional,
                    PageType::Heap,
                )
                .unwrap();
            writer_flag.store(true, Ordering::Release);
            writer_release_rx.recv().unwrap();
            pool.unfix(&t3, page);
        });

        // Let the writer queue first, then send a reader after it.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!writer_granted.load(Ordering::Acquire));

        let pool = Arc::clone(&h.pool);
        let reader_flag = Arc::clone(&reader_granted);
        scope.spawn(move || {
            let page = pool
                .fix(
                    &t4,
                    target,
                    PageFetch::Old,
                    FixMode::Read,
                    FixCondition::Unconditional,
                    PageType::Heap,
                )
                .unwrap();
            reader_flag.store(true, Ordering::Release);
            pool.unfix(&t4, page);
        });

        std::thread::sleep(Duration::from_millis(100));
        // A waiter exists, so the late reader must queue, not jump in.
        assert!(!reader_granted.load(Ordering::Acquire));

        // Dropping both read latches grants the writer, not the reader.
        h.pool.unfix(&t1, p1);
        h.pool.unfix(&t2, p2);
        while !writer_granted.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(!reader_granted.load(Ordering::Acquire));

        // Writer done: the queued reader finally gets through.
        writer_release_tx.send(()).unwrap();
        while !reader_granted.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
}

#[test]
fn conditional_fix_under_no_wait_times_out_with_attribution() {
    let h = PoolHarness::new(4);
    let holder = h.thread();
    let blocked = h.thread();
    let target = vpid(0, 2);

    h.pool.threads().set_tran(
        &blocked,
        buffer::TranBinding {
            tran: TranId(7),
            wait_mode: WaitMode::Zero,
            active: true,
            client: ClientInfo {
                program: "rsql".into(),
                user: "dba".into(),
                host: "client-1".into(),
                pid: 4242,
            },
        },
    );

    let page = h.pool.fix_new(&holder, target, PageType::Heap).unwrap();

    let err = h
        .pool
        .fix(
            &blocked,
            target,
            PageFetch::Old,
            FixMode::Write,
            FixCondition::Conditional,
            PageType::Heap,
        )
        .unwrap_err();

    match err {
        DbError::PageTimeout {
            tran,
            client,
            mode,
            vpid: v,
            unilateral_abort,
        } => {
            assert_eq!(tran, TranId(7));
            assert_eq!(client.user, "dba");
            assert_eq!(client.host, "client-1");
            assert_eq!(client.pid, 4242);
            assert_eq!(mode, "WRITE");
            assert_eq!(v, target);
            assert!(!unilateral_abort);
        }
        other => panic!("expected page timeout, got {other:?}"),
    }

    // An unconditional request degrades to conditional under no-wait.
    let err = h
        .pool
        .fix(
            &blocked,
            target,
            PageFetch::Old,
            FixMode::Write,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap_err();
    assert!(err.is_timeout());

    h.pool.unfix(&holder, page);
}

#[test]
fn checkpoint_flushes_up_to_the_ceiling_and_reports_the_rest() {
    let h = PoolHarness::new(8);
    let th = h.thread();

    for (pageid, offset) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
        let page = h.pool.fix_new(&th, vpid(0, pageid), PageType::Heap).unwrap();
        h.pool.set_dirty(&th, &page);
        h.pool.set_lsa(&th, &page, Lsa::new(0, offset)).unwrap();
        h.pool.unfix(&th, page);
    }

    let writes_before = h.pool.stats().iowrites;
    let smallest = h
        .pool
        .flush_checkpoint(&th, Lsa::new(0, 25), Some(Lsa::new(0, 5)))
        .unwrap();

    assert_eq!(smallest, Lsa::new(0, 30));
    assert_eq!(h.pool.stats().iowrites, writes_before + 2);

    // A second checkpoint with a high ceiling drains the rest.
    let smallest = h
        .pool
        .flush_checkpoint(&th, Lsa::new(0, 100), Some(Lsa::new(0, 25)))
        .unwrap();
    assert!(smallest.is_null());
    assert_eq!(h.pool.stats().iowrites, writes_before + 4);
}

#[test]
fn checkpoint_flushes_write_latched_pages_through_a_read_refix() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let writer = h.thread();
    let target = vpid(0, 3);

    let held = h.pool.fix_new(&writer, target, PageType::Heap).unwrap();
    h.pool.set_dirty(&writer, &held);
    h.pool.set_lsa(&writer, &held, Lsa::new(0, 12)).unwrap();

    // The frame is write latched, so the checkpoint thread re-fixes for
    // read; that blocks until the writer lets go. Release it shortly.
    let pool = Arc::clone(&h.pool);
    let join = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        pool.unfix(&writer, held);
    });

    let smallest = h
        .pool
        .flush_checkpoint(&th, Lsa::new(0, 50), None)
        .unwrap();
    join.join().unwrap();

    assert!(smallest.is_null());
    assert_eq!(h.disk.read_page(target).unwrap().lsa().unwrap(), Lsa::new(0, 12));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "oldest unflush LSA precedes checkpoint redo")]
fn checkpoint_rejects_pages_dirtied_before_the_previous_redo_point() {
    let h = PoolHarness::new(4);
    let th = h.thread();

    let page = h.pool.fix_new(&th, vpid(0, 1), PageType::Heap).unwrap();
    h.pool.set_dirty(&th, &page);
    h.pool.set_lsa(&th, &page, Lsa::new(0, 3)).unwrap();
    h.pool.unfix(&th, page);

    let _ = h
        .pool
        .flush_checkpoint(&th, Lsa::new(0, 25), Some(Lsa::new(0, 5)));
}

#[test]
fn same_thread_read_fixes_never_block() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let target = vpid(0, 4);

    let page = h.pool.fix_new(&th, target, PageType::Heap).unwrap();
    h.pool.unfix(&th, page);

    let read = || {
        h.pool.fix(
            &th,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Conditional,
            PageType::Heap,
        )
    };
    let first = read().unwrap();
    let second = read().unwrap();
    h.pool.unfix(&th, first);
    h.pool.unfix(&th, second);
}

#[test]
fn write_upgrade_is_granted_only_to_the_sole_holder() {
    let h = PoolHarness::new(4);
    let a = h.thread();
    let b = h.thread();
    let target = vpid(0, 5);

    let page = h.pool.fix_new(&a, target, PageType::Heap).unwrap();
    h.pool.unfix(&a, page);

    let read = |th: &buffer::ThreadCtx| {
        h.pool.fix(
            th,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
    };
    let upgrade = |th: &buffer::ThreadCtx| {
        h.pool.fix(
            th,
            target,
            PageFetch::Old,
            FixMode::Write,
            FixCondition::Conditional,
            PageType::Heap,
        )
    };

    // Sole holder: the upgrade succeeds in place.
    let r_a = read(&a).unwrap();
    let w_a = upgrade(&a).unwrap();
    h.pool.unfix(&a, w_a);
    h.pool.unfix(&a, r_a);

    // Shared with another reader: the conditional upgrade is refused.
    let r_a = read(&a).unwrap();
    let r_b = read(&b).unwrap();
    let err = upgrade(&a).unwrap_err();
    assert!(err.is_timeout());
    h.pool.unfix(&a, r_a);
    h.pool.unfix(&b, r_b);
}

#[test]
fn readers_and_writers_exclude_each_other_across_threads() {
    let h = PoolHarness::new(4);
    let a = h.thread();
    let b = h.thread();
    let target = vpid(0, 6);

    let page = h.pool.fix_new(&a, target, PageType::Heap).unwrap();
    h.pool.unfix(&a, page);

    let r_a = h
        .pool
        .fix(
            &a,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    let err = h
        .pool
        .fix(
            &b,
            target,
            PageFetch::Old,
            FixMode::Write,
            FixCondition::Conditional,
            PageType::Heap,
        )
        .unwrap_err();
    assert!(err.is_timeout());
    h.pool.unfix(&a, r_a);
}

#[test]
fn blocked_reader_is_woken_by_an_interrupt() {
    let h = PoolHarness::new(4);
    let holder = h.thread();
    let blocked = h.thread();
    let blocked_index = blocked.index();
    let target = vpid(0, 8);

    let held = h.pool.fix_new(&holder, target, PageType::Heap).unwrap();

    std::thread::scope(|scope| {
        let pool = Arc::clone(&h.pool);
        let join = scope.spawn(move || {
            pool.fix(
                &blocked,
                target,
                PageFetch::Old,
                FixMode::Read,
                FixCondition::Unconditional,
                PageType::Heap,
            )
        });

        std::thread::sleep(Duration::from_millis(100));
        h.pool.threads().interrupt(blocked_index);

        let err = join.join().unwrap().unwrap_err();
        assert!(matches!(err, DbError::Interrupted));
    });

    h.pool.unfix(&holder, held);
}

#[test]
fn fix_with_retry_retries_timeouts_until_the_latch_frees_up() {
    let h = PoolHarness::new(4);
    let holder = h.thread();
    let retrier = h.thread();
    h.pool
        .threads()
        .set_wait_mode(&retrier, WaitMode::Msecs(30));
    let target = vpid(0, 9);

    let held = h.pool.fix_new(&holder, target, PageType::Heap).unwrap();

    std::thread::scope(|scope| {
        let pool = Arc::clone(&h.pool);
        let join = scope.spawn(move || {
            pool.fix_with_retry(&retrier, target, PageFetch::Old, FixMode::Write, PageType::Heap, 10)
                .map(|page| pool.unfix(&retrier, page))
        });

        std::thread::sleep(Duration::from_millis(120));
        h.pool.unfix(&holder, held);
        join.join().unwrap().unwrap();
    });
}

#[test]
fn invalidate_flushes_and_frees_the_frame() {
    let h = PoolHarness::new(2);
    let th = h.thread();
    let target = vpid(0, 11);

    let page = h.pool.fix_new(&th, target, PageType::Heap).unwrap();
    h.pool.page_mut(&page).body_mut()[0] = 0x3C;
    h.pool.set_dirty(&th, &page);
    h.pool.set_lsa(&th, &page, Lsa::new(0, 44)).unwrap();

    let writes_before = h.pool.stats().iowrites;
    h.pool.invalidate(&th, page).unwrap();
    assert_eq!(h.pool.stats().iowrites, writes_before + 1);
    assert_eq!(h.disk.read_page(target).unwrap().body()[0], 0x3C);

    // The page must come back from disk, not from the pool.
    let reads_before = h.pool.stats().ioreads;
    let page = h
        .pool
        .fix(
            &th,
            target,
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before + 1);
    h.pool.unfix(&th, page);
}

#[test]
fn invalidate_with_extra_fixes_only_unfixes() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let target = vpid(0, 12);

    let first = h.pool.fix_new(&th, target, PageType::Heap).unwrap();
    let second = h
        .pool
        .fix(
            &th,
            target,
            PageFetch::Old,
            FixMode::Write,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();

    h.pool.invalidate(&th, second).unwrap();

    // Still resident and still fixed once.
    let reads_before = h.pool.stats().ioreads;
    let again = h
        .pool
        .fix(
            &th,
            target,
            PageFetch::Old,
            FixMode::Write,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before);
    h.pool.unfix(&th, again);
    h.pool.unfix(&th, first);
}

#[test]
fn invalidate_all_sweeps_a_volume() {
    let h = PoolHarness::new(8);
    let th = h.thread();
    h.add_volume(VolId(1), 32);

    for pageid in 1..=3 {
        let page = h.pool.fix_new(&th, vpid(0, pageid), PageType::Heap).unwrap();
        h.pool.set_dirty(&th, &page);
        h.pool.set_lsa(&th, &page, Lsa::new(0, pageid)).unwrap();
        h.pool.unfix(&th, page);
    }
    let other = h.pool.fix_new(&th, vpid(1, 1), PageType::Heap).unwrap();
    h.pool.unfix(&th, other);

    h.pool.invalidate_all(&th, Some(VolId(0))).unwrap();

    // Volume 0 pages were flushed out and forgotten; volume 1 survived.
    let reads_before = h.pool.stats().ioreads;
    let page = h
        .pool
        .fix(
            &th,
            vpid(0, 1),
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before + 1);
    h.pool.unfix(&th, page);

    let page = h
        .pool
        .fix(
            &th,
            vpid(1, 1),
            PageFetch::Old,
            FixMode::Read,
            FixCondition::Unconditional,
            PageType::Heap,
        )
        .unwrap();
    assert_eq!(h.pool.stats().ioreads, reads_before + 1);
    h.pool.unfix(&th, page);
}

#[test]
fn flush_all_unfixed_writes_every_dirty_page() {
    let h = PoolHarness::new(8);
    let th = h.thread();

    for pageid in 1..=3 {
        let page = h.pool.fix_new(&th, vpid(0, pageid), PageType::Heap).unwrap();
        h.pool.set_dirty(&th, &page);
        h.pool.set_lsa(&th, &page, Lsa::new(0, pageid)).unwrap();
        h.pool.unfix(&th, page);
    }
    let held = h.pool.fix_new(&th, vpid(0, 4), PageType::Heap).unwrap();
    h.pool.set_dirty(&th, &held);

    let writes_before = h.pool.stats().iowrites;
    h.pool.flush_all_unfixed(&th, Some(VolId(0))).unwrap();
    assert_eq!(h.pool.stats().iowrites, writes_before + 3);

    h.pool.unfix(&th, held);
}

#[test]
fn copy_areas_round_trip_through_the_pool() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let target = vpid(0, 13);
    let payload = [7u8, 6, 5, 4, 3];

    h.pool.copy_from_area(&th, target, 16, &payload).unwrap();
    let back = h.pool.copy_to_area(&th, target, 16, payload.len(), true).unwrap();
    assert_eq!(back, payload);

    // Out-of-bounds copies are rejected.
    let err = h
        .pool
        .copy_to_area(&th, target, TEST_PAGE_SIZE, 8, true)
        .unwrap_err();
    assert!(matches!(err, DbError::Storage(_)));
}

#[test]
fn copy_to_area_without_fetch_leaves_the_pool_cold() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let target = vpid(0, 14);
    let payload = [9u8; 12];

    h.pool.copy_from_area(&th, target, 0, &payload).unwrap();
    h.pool.flush_all(&th, Some(VolId(0))).unwrap();
    h.pool.invalidate_all(&th, Some(VolId(0))).unwrap();

    let fetches_before = h.pool.stats().fetches;
    let back = h.pool.copy_to_area(&th, target, 0, payload.len(), false).unwrap();
    assert_eq!(back, payload);
    assert_eq!(
        h.pool.stats().fetches,
        fetches_before,
        "direct disk copy must not populate the pool"
    );
}

#[test]
fn page_type_checks_accept_families_and_recovery() {
    let h = PoolHarness::new(4);
    let th = h.thread();

    let page = h.pool.fix_new(&th, vpid(0, 15), PageType::HeapHeader).unwrap();
    assert!(h.pool.check_page_type(&page, PageType::Heap).unwrap());
    assert!(h.pool.check_page_type(&page, PageType::Unknown).unwrap());
    assert!(!h.pool.check_page_type(&page, PageType::Btree).unwrap());

    h.wal.set_recovery_redo(true);
    assert!(h.pool.check_page_type(&page, PageType::Btree).unwrap());
    h.wal.set_recovery_redo(false);

    h.pool.unfix(&th, page);
}

#[test]
fn background_flusher_daemon_cleans_cold_dirty_pages() {
    let config = common::Config::builder()
        .page_size(TEST_PAGE_SIZE)
        .page_buffer_size(TEST_PAGE_SIZE * 4)
        .num_lru_lists(1)
        .flush_interval_msecs(25)
        .build();
    let h = PoolHarness::with_config(config);
    let th = h.thread();

    h.pool.start_flusher().unwrap();

    let target = vpid(0, 16);
    let page = h.pool.fix_new(&th, target, PageType::Heap).unwrap();
    h.pool.set_dirty(&th, &page);
    let lsa = h.mint_lsa(target).unwrap();
    h.pool.set_lsa(&th, &page, lsa).unwrap();
    h.pool.unfix(&th, page);

    // Push it past the middle pointer so a flusher round can see it.
    for pageid in 17..=19 {
        let filler = h.pool.fix_new(&th, vpid(0, pageid), PageType::Heap).unwrap();
        h.pool.unfix(&th, filler);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while h.pool.stats().iowrites == 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "daemon never flushed the dirty page"
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    h.pool.shutdown();
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "fixed pages leaked at request termination")]
fn unfix_all_reports_leaked_fixes() {
    let h = PoolHarness::new(4);
    let th = h.thread();
    let _leaked = h.pool.fix_new(&th, vpid(0, 17), PageType::Heap).unwrap();
    h.pool.unfix_all(&th);
}
