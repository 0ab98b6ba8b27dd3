use super::*;
use common::{Lsa, PageId, VolId, Vpid};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn update(vol: i16, page: i32) -> WalRecord {
    WalRecord::PageUpdate {
        vpid: Vpid::new(VolId(vol), PageId(page)),
        payload: vec![1, 2, 3],
    }
}

#[test]
fn append_assigns_monotonic_lsas() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();

    let a = wal.append(&update(1, 1)).unwrap();
    let b = wal.append(&update(1, 2)).unwrap();
    let c = wal.append(&update(1, 3)).unwrap();
    assert_eq!(a, Lsa::new(0, 0));
    assert!(a < b);
    assert!(b < c);
    assert!(wal.append_lsa() > c);
}

#[test]
fn barrier_advances_the_durable_point() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();

    let lsa = wal.append(&update(1, 7)).unwrap();
    assert!(wal.need_wal(lsa));

    wal.flush_up_to(lsa).unwrap();
    assert!(!wal.need_wal(lsa));
    assert!(wal.flushed_lsa() > lsa);
}

#[test]
fn sentinel_lsas_never_need_a_barrier() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();
    wal.append(&update(1, 1)).unwrap();

    assert!(!wal.need_wal(Lsa::NULL));
    assert!(!wal.need_wal(Lsa::INIT_TEMP));
    // A barrier for a sentinel is a no-op and must not fail.
    wal.flush_up_to(Lsa::NULL).unwrap();
    wal.flush_up_to(Lsa::INIT_TEMP).unwrap();
    assert_eq!(wal.flushed_lsa(), Lsa::NULL);
}

#[test]
fn barrier_below_durable_point_is_a_no_op() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();

    let a = wal.append(&update(1, 1)).unwrap();
    wal.sync().unwrap();
    let durable = wal.flushed_lsa();

    wal.append(&update(1, 2)).unwrap();
    wal.flush_up_to(a).unwrap();
    // Nothing newer was forced: the durable point did not move.
    assert_eq!(wal.flushed_lsa(), durable);
}

#[test]
fn replay_returns_records_with_their_lsas() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.wal");
    let wal = Wal::open(&path).unwrap();

    let r1 = update(1, 10);
    let r2 = WalRecord::Checkpoint {
        redo_lsa: Lsa::new(0, 0),
    };
    let lsa1 = wal.append(&r1).unwrap();
    let lsa2 = wal.append(&r2).unwrap();
    wal.sync().unwrap();

    let records = Wal::replay(&path).unwrap();
    assert_eq!(records, vec![(lsa1, r1), (lsa2, r2)]);
}

#[test]
fn checkpoint_redo_lsa_cell() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();

    assert!(wal.checkpoint_redo_lsa().is_null());
    wal.set_checkpoint_redo_lsa(Lsa::new(5, 64));
    assert_eq!(wal.checkpoint_redo_lsa(), Lsa::new(5, 64));
}

#[test]
fn recovery_redo_flag() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();

    assert!(!wal.is_recovery_redo());
    wal.set_recovery_redo(true);
    assert!(wal.is_recovery_redo());
    wal.set_recovery_redo(false);
    assert!(!wal.is_recovery_redo());
}

#[test]
fn lsa_crosses_log_page_boundary() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path().join("test.wal")).unwrap();

    // Append enough bulk records to cross at least one log page.
    let bulk = WalRecord::PageUpdate {
        vpid: Vpid::new(VolId(1), PageId(1)),
        payload: vec![0u8; 900],
    };
    let mut last = Lsa::NULL;
    for _ in 0..6 {
        last = wal.append(&bulk).unwrap();
    }
    assert!(last.pageid >= 1, "expected LSA past the first log page");
}
