//! Write-ahead log addressed by log sequence address (LSA).
//!
//! Every record appended here is assigned the LSA of its first byte, where
//! an LSA is (log page, offset within page) over a stream of fixed-size log
//! pages. The buffer pool consumes four things from this crate:
//!
//! - the WAL barrier `flush_up_to`, which must return only once the log is
//!   durable through the given LSA,
//! - `need_wal`, which answers whether a page LSA is past the durable point,
//! - the current checkpoint redo LSA,
//! - the recovery-redo phase flag.
//!
//! Records are length-prefixed (4-byte LE) bincode frames, so the log can be
//! iterated forward safely and truncated at the first torn frame.

#[cfg(test)]
mod tests;

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{DbError, DbResult, Lsa, Vpid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Default size of one logical log page.
pub const LOG_PAGE_SIZE: usize = 4096;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// A change recorded in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A redo-logged update against a data page.
    PageUpdate { vpid: Vpid, payload: Vec<u8> },
    /// Checkpoint marker carrying the redo start point.
    Checkpoint { redo_lsa: Lsa },
}

struct Appender {
    file: File,
    /// Byte position the next record will be appended at.
    append_pos: u64,
    /// Everything at or before this LSA is durable on disk.
    flushed_lsa: Lsa,
}

/// Append-only write-ahead log manager.
pub struct Wal {
    log_page_size: u64,
    inner: Mutex<Appender>,
    checkpoint_redo: Mutex<Lsa>,
    recovery_redo: AtomicBool,
}

impl Wal {
    /// Open or create the log file at `path`.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(|e| DbError::Wal(format!("open log file failed: {e}")))?;
        let append_pos = file
            .metadata()
            .map_err(|e| DbError::Wal(format!("stat log file failed: {e}")))?
            .len();

        Ok(Self {
            log_page_size: LOG_PAGE_SIZE as u64,
            inner: Mutex::new(Appender {
                file,
                append_pos,
                flushed_lsa: Lsa::NULL,
            }),
            checkpoint_redo: Mutex::new(Lsa::NULL),
            recovery_redo: AtomicBool::new(false),
        })
    }

    fn lsa_of(&self, pos: u64) -> Lsa {
        Lsa::new(
            (pos / self.log_page_size) as i64,
            (pos % self.log_page_size) as i32,
        )
    }

    /// Append a record and return the LSA assigned to it. The record is
    /// written to the OS but not yet durable; durability comes from
    /// `flush_up_to` or `sync`.
    pub fn append(&self, rec: &WalRecord) -> DbResult<Lsa> {
        let bytes = encode_to_vec(rec, bincode_config())
            .map_err(|e| DbError::Wal(format!("serialize record failed: {e}")))?;

        let mut inner = self.inner.lock();
        let lsa = self.lsa_of(inner.append_pos);

        let len = bytes.len() as u32;
        inner
            .file
            .write_all(&len.to_le_bytes())
            .map_err(|e| DbError::Wal(format!("write length prefix failed: {e}")))?;
        inner
            .file
            .write_all(&bytes)
            .map_err(|e| DbError::Wal(format!("write record failed: {e}")))?;
        inner.append_pos += 4 + bytes.len() as u64;
        Ok(lsa)
    }

    /// The WAL barrier: block until the log is durable up to and including
    /// `lsa`. Null and temporary-init LSAs need no barrier.
    pub fn flush_up_to(&self, lsa: Lsa) -> DbResult<()> {
        if lsa.is_null() || lsa.is_init_temp() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if lsa <= inner.flushed_lsa {
            return Ok(());
        }
        inner
            .file
            .sync_all()
            .map_err(|e| DbError::Wal(format!("sync log failed: {e}")))?;
        inner.flushed_lsa = self.lsa_of(inner.append_pos);
        Ok(())
    }

    /// Force everything appended so far to disk.
    pub fn sync(&self) -> DbResult<()> {
        let mut inner = self.inner.lock();
        inner
            .file
            .sync_all()
            .map_err(|e| DbError::Wal(format!("sync log failed: {e}")))?;
        inner.flushed_lsa = self.lsa_of(inner.append_pos);
        Ok(())
    }

    /// Whether writing a page stamped with `lsa` would still require a WAL
    /// barrier first.
    pub fn need_wal(&self, lsa: Lsa) -> bool {
        if lsa.is_null() || lsa.is_init_temp() {
            return false;
        }
        lsa > self.inner.lock().flushed_lsa
    }

    /// The LSA the log is durable through.
    pub fn flushed_lsa(&self) -> Lsa {
        self.inner.lock().flushed_lsa
    }

    /// The LSA the next append will be assigned.
    pub fn append_lsa(&self) -> Lsa {
        let inner = self.inner.lock();
        self.lsa_of(inner.append_pos)
    }

    pub fn checkpoint_redo_lsa(&self) -> Lsa {
        *self.checkpoint_redo.lock()
    }

    pub fn set_checkpoint_redo_lsa(&self, lsa: Lsa) {
        *self.checkpoint_redo.lock() = lsa;
    }

    /// Whether the system is in the redo phase of crash recovery. Page-type
    /// checks are lenient and victim flushing turns inline while this is
    /// set.
    pub fn is_recovery_redo(&self) -> bool {
        self.recovery_redo.load(Ordering::Acquire)
    }

    pub fn set_recovery_redo(&self, on: bool) {
        self.recovery_redo.store(on, Ordering::Release);
    }

    /// Read all records back from a log file, stopping at EOF or the first
    /// torn frame.
    pub fn replay(path: impl AsRef<Path>) -> DbResult<Vec<(Lsa, WalRecord)>> {
        let mut file = File::open(path.as_ref())
            .map_err(|e| DbError::Wal(format!("open log for replay failed: {e}")))?;

        let mut records = Vec::new();
        let mut pos = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(DbError::Wal(format!("read length prefix failed: {e}"))),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut buf = vec![0u8; len];
            match file.read_exact(&mut buf) {
                Ok(()) => {}
                // Torn tail record: everything before it is still good.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(DbError::Wal(format!("read record failed: {e}"))),
            }

            let (rec, _) = decode_from_slice(&buf, bincode_config())
                .map_err(|e| DbError::Wal(format!("deserialize record failed: {e}")))?;
            let lsa = Lsa::new(
                (pos / LOG_PAGE_SIZE as u64) as i64,
                (pos % LOG_PAGE_SIZE as u64) as i32,
            );
            records.push((lsa, rec));
            pos += 4 + len as u64;
        }
        Ok(records)
    }
}
