use super::*;
use common::{DbError, Lsa, PageId, PageType, VolId, Vpid};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

const PAGE: usize = 1024;

#[test]
fn fresh_page_has_null_reserved_header() {
    let page = IoPage::new(PAGE);
    let header = page.reserved().unwrap();
    assert_eq!(header.lsa, Lsa::NULL);
    assert_eq!(header.volid, VolId::NULL.0);
    assert_eq!(header.pageid, PageId::NULL.0);
    assert_eq!(header.ptype, PageType::Unknown as u8);
    assert!(page.identity().unwrap().is_null());
}

#[test]
fn reserved_header_round_trips_through_bytes() {
    let mut page = IoPage::new(PAGE);
    let vpid = Vpid::new(VolId(3), PageId(42));
    page.set_identity(vpid).unwrap();
    page.set_lsa(Lsa::new(7, 128)).unwrap();
    page.set_ptype(PageType::Heap).unwrap();

    let reparsed = IoPage::from_bytes(page.as_bytes().to_vec().into_boxed_slice());
    assert_eq!(reparsed.identity().unwrap(), vpid);
    assert_eq!(reparsed.lsa().unwrap(), Lsa::new(7, 128));
    assert_eq!(reparsed.ptype().unwrap(), PageType::Heap);
}

#[test]
fn body_excludes_reserved_header() {
    let mut page = IoPage::new(PAGE);
    assert_eq!(page.body().len(), PAGE - RESERVED_BYTES);
    page.body_mut()[0] = 0xAB;
    // The header is untouched by body writes.
    assert_eq!(page.reserved().unwrap(), PageReserved::default());
    assert_eq!(page.as_bytes()[RESERVED_BYTES], 0xAB);
}

#[test]
fn format_read_write_round_trip() {
    let dir = tempdir().unwrap();
    let disk = DiskManager::new(dir.path(), PAGE);
    let vol = VolId(1);
    disk.format_volume(vol, 4).unwrap();

    let vpid = Vpid::new(vol, PageId(2));
    let mut page = disk.read_page(vpid).unwrap();
    assert!(page.lsa().unwrap().is_null());

    page.set_identity(vpid).unwrap();
    page.body_mut()[..4].copy_from_slice(&[9, 8, 7, 6]);
    disk.write_page(vpid, &page).unwrap();

    let back = disk.read_page(vpid).unwrap();
    assert_eq!(back.identity().unwrap(), vpid);
    assert_eq!(&back.body()[..4], &[9, 8, 7, 6]);
}

#[test]
fn page_validity_probes() {
    let dir = tempdir().unwrap();
    let disk = DiskManager::new(dir.path(), PAGE);
    disk.format_volume(VolId(1), 2).unwrap();

    let valid = Vpid::new(VolId(1), PageId(1));
    let beyond = Vpid::new(VolId(1), PageId(2));
    let unknown_vol = Vpid::new(VolId(9), PageId(0));

    assert_eq!(disk.is_page_valid(valid), PageValidity::Valid);
    assert_eq!(disk.is_page_valid(beyond), PageValidity::Invalid);
    assert_eq!(disk.is_page_valid(unknown_vol), PageValidity::Error);
    assert_eq!(disk.is_page_valid(Vpid::NULL), PageValidity::Invalid);
}

#[test]
fn open_volume_recovers_page_count() {
    let dir = tempdir().unwrap();
    let disk = DiskManager::new(dir.path(), PAGE);
    disk.format_volume(VolId(1), 3).unwrap();
    let path = dir.path().join("vol00001");

    let disk2 = DiskManager::new(dir.path(), PAGE);
    disk2.open_volume(VolId(1), &path).unwrap();
    assert_eq!(disk2.npages(VolId(1)), Some(3));
    assert!(disk2.volume_label(VolId(1)).unwrap().contains("vol00001"));
}

#[test]
fn reads_outside_the_volume_fail() {
    let dir = tempdir().unwrap();
    let disk = DiskManager::new(dir.path(), PAGE);
    disk.format_volume(VolId(1), 1).unwrap();

    let err = disk.read_page(Vpid::new(VolId(1), PageId(5))).unwrap_err();
    assert!(matches!(err, DbError::Storage(_)));
    let err = disk.read_page(Vpid::new(VolId(7), PageId(0))).unwrap_err();
    assert!(matches!(err, DbError::Storage(_)));
}
