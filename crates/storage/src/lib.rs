//! Disk layer: the on-disk page image and volume file IO.
//!
//! Every page carries a fixed reserved header (page LSA, page identity,
//! page type, flags) followed by the user payload. The buffer pool promises
//! to preserve the header and stamp identity and type through the accessors
//! here; everything past `RESERVED_BYTES` belongs to the page's owner.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_into_slice};
use common::{DbError, DbResult, Lsa, PageId, PageType, VolId, Vpid};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Bytes at the head of every page image occupied by the reserved header.
pub const RESERVED_BYTES: usize = 20;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// Reserved header stamped at the head of every disk page.
///
/// Invariant: whenever `lsa` is not null, `(volid, pageid)` name the page
/// the image belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageReserved {
    pub lsa: Lsa,
    pub pageid: i32,
    pub volid: i16,
    pub ptype: u8,
    pub pflag: u8,
}

impl Default for PageReserved {
    fn default() -> Self {
        Self {
            lsa: Lsa::NULL,
            pageid: PageId::NULL.0,
            volid: VolId::NULL.0,
            ptype: PageType::Unknown as u8,
            pflag: 0,
        }
    }
}

/// In-memory image of one disk page: reserved header plus body.
#[derive(Clone, Debug)]
pub struct IoPage {
    data: Box<[u8]>,
}

impl IoPage {
    /// Create a zeroed page image with an initialized (null) reserved
    /// header.
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > RESERVED_BYTES, "page size too small");
        let mut page = Self {
            data: vec![0u8; page_size].into_boxed_slice(),
        };
        page.write_reserved(&PageReserved::default())
            .expect("initialize reserved header");
        page
    }

    pub fn from_bytes(data: Box<[u8]>) -> Self {
        assert!(data.len() > RESERVED_BYTES, "page size too small");
        Self { data }
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn reserved(&self) -> DbResult<PageReserved> {
        let (header, read) = decode_from_slice(&self.data[..RESERVED_BYTES], bincode_config())
            .map_err(|e| DbError::Storage(format!("read reserved header failed: {e}")))?;
        debug_assert_eq!(read, RESERVED_BYTES);
        Ok(header)
    }

    pub fn write_reserved(&mut self, header: &PageReserved) -> DbResult<()> {
        let written = encode_into_slice(
            header,
            &mut self.data[..RESERVED_BYTES],
            bincode_config(),
        )
        .map_err(|e| DbError::Storage(format!("write reserved header failed: {e}")))?;
        debug_assert_eq!(written, RESERVED_BYTES);
        Ok(())
    }

    /// Reset the reserved header to its initialized state: null identity,
    /// null LSA, unknown type, cleared flags.
    pub fn init_reserved(&mut self) -> DbResult<()> {
        self.write_reserved(&PageReserved::default())
    }

    pub fn lsa(&self) -> DbResult<Lsa> {
        Ok(self.reserved()?.lsa)
    }

    pub fn set_lsa(&mut self, lsa: Lsa) -> DbResult<()> {
        let mut header = self.reserved()?;
        header.lsa = lsa;
        self.write_reserved(&header)
    }

    /// The identity recorded in the header, or `Vpid::NULL` when the header
    /// has never been stamped.
    pub fn identity(&self) -> DbResult<Vpid> {
        let header = self.reserved()?;
        Ok(Vpid::new(VolId(header.volid), PageId(header.pageid)))
    }

    pub fn set_identity(&mut self, vpid: Vpid) -> DbResult<()> {
        let mut header = self.reserved()?;
        header.volid = vpid.volid.0;
        header.pageid = vpid.pageid.0;
        self.write_reserved(&header)
    }

    pub fn ptype(&self) -> DbResult<PageType> {
        let header = self.reserved()?;
        PageType::from_u8(header.ptype)
            .ok_or_else(|| DbError::Storage(format!("unknown page type tag {}", header.ptype)))
    }

    pub fn set_ptype(&mut self, ptype: PageType) -> DbResult<()> {
        let mut header = self.reserved()?;
        header.ptype = ptype as u8;
        self.write_reserved(&header)
    }

    /// User payload past the reserved header.
    pub fn body(&self) -> &[u8] {
        &self.data[RESERVED_BYTES..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[RESERVED_BYTES..]
    }
}

/// Outcome of a page validity probe against the disk layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageValidity {
    Valid,
    Invalid,
    Error,
}

struct Volume {
    file: Mutex<File>,
    path: PathBuf,
    npages: usize,
}

/// Registry of open volume files with fixed-size page IO.
///
/// Page `p` of a volume lives at byte offset `p * page_size` of its file.
/// All operations are safe to call from any thread.
pub struct DiskManager {
    data_dir: PathBuf,
    page_size: usize,
    volumes: RwLock<HashMap<VolId, Volume>>,
}

impl DiskManager {
    pub fn new(data_dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            page_size,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn volume_path(&self, volid: VolId) -> PathBuf {
        self.data_dir.join(format!("vol{:05}", volid.0))
    }

    /// Create (or recreate) a volume file of `npages` initialized pages and
    /// register it.
    pub fn format_volume(&self, volid: VolId, npages: usize) -> DbResult<()> {
        if volid.is_null() {
            return Err(DbError::Storage(format!("cannot format volume {}", volid.0)));
        }
        let path = self.volume_path(volid);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| DbError::Storage(format!("create volume file failed: {e}")))?;

        let blank = IoPage::new(self.page_size);
        for _ in 0..npages {
            file.write_all(blank.as_bytes())
                .map_err(|e| DbError::Storage(format!("format volume failed: {e}")))?;
        }
        file.sync_all()
            .map_err(|e| DbError::Storage(format!("sync volume failed: {e}")))?;

        self.volumes.write().insert(
            volid,
            Volume {
                file: Mutex::new(file),
                path,
                npages,
            },
        );
        Ok(())
    }

    /// Open an existing volume file and register it.
    pub fn open_volume(&self, volid: VolId, path: &Path) -> DbResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DbError::Storage(format!("open volume file failed: {e}")))?;
        let len = file
            .metadata()
            .map_err(|e| DbError::Storage(format!("stat volume file failed: {e}")))?
            .len() as usize;
        self.volumes.write().insert(
            volid,
            Volume {
                file: Mutex::new(file),
                path: path.to_path_buf(),
                npages: len / self.page_size,
            },
        );
        Ok(())
    }

    pub fn volume_label(&self, volid: VolId) -> Option<String> {
        self.volumes
            .read()
            .get(&volid)
            .map(|v| v.path.display().to_string())
    }

    pub fn npages(&self, volid: VolId) -> Option<usize> {
        self.volumes.read().get(&volid).map(|v| v.npages)
    }

    pub fn is_page_valid(&self, vpid: Vpid) -> PageValidity {
        if vpid.is_null() {
            return PageValidity::Invalid;
        }
        let volumes = self.volumes.read();
        match volumes.get(&vpid.volid) {
            None => PageValidity::Error,
            Some(vol) if (vpid.pageid.0 as usize) < vol.npages => PageValidity::Valid,
            Some(_) => PageValidity::Invalid,
        }
    }

    pub fn read_page(&self, vpid: Vpid) -> DbResult<IoPage> {
        let volumes = self.volumes.read();
        let vol = volumes
            .get(&vpid.volid)
            .ok_or_else(|| DbError::Storage(format!("unknown volume {}", vpid.volid.0)))?;

        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        let mut file = vol.file.lock();
        file.seek(SeekFrom::Start(vpid.pageid.0 as u64 * self.page_size as u64))
            .map_err(|e| DbError::Storage(format!("seek page {vpid} failed: {e}")))?;
        file.read_exact(&mut buf)
            .map_err(|e| DbError::Storage(format!("read page {vpid} failed: {e}")))?;
        Ok(IoPage::from_bytes(buf))
    }

    pub fn write_page(&self, vpid: Vpid, page: &IoPage) -> DbResult<()> {
        debug_assert_eq!(page.page_size(), self.page_size);
        let volumes = self.volumes.read();
        let vol = volumes
            .get(&vpid.volid)
            .ok_or_else(|| DbError::Storage(format!("unknown volume {}", vpid.volid.0)))?;

        let mut file = vol.file.lock();
        file.seek(SeekFrom::Start(vpid.pageid.0 as u64 * self.page_size as u64))
            .map_err(|e| DbError::Storage(format!("seek page {vpid} failed: {e}")))?;
        file.write_all(page.as_bytes())
            .map_err(|e| DbError::Storage(format!("write page {vpid} failed: {e}")))?;
        file.flush()
            .map_err(|e| DbError::Storage(format!("flush page {vpid} failed: {e}")))?;
        Ok(())
    }
}
