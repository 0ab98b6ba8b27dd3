//! Background page-flush daemon.
//!
//! One dedicated thread runs `flush_victim_candidates` whenever victim
//! pressure wakes it, or after the configured interval elapses. The daemon
//! only cleans frames; eviction stays with the threads that need a frame.

use crate::BufferPool;
use common::{DbError, DbResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct FlusherShared {
    wake: Mutex<bool>,
    cond: Condvar,
    stop: AtomicBool,
}

pub(crate) struct FlusherHandle {
    shared: Arc<FlusherShared>,
    join: Option<JoinHandle<()>>,
}

impl BufferPool {
    /// Spawn the page-flush daemon. Idempotent.
    pub fn start_flusher(self: &Arc<Self>) -> DbResult<()> {
        let mut handle = self.flusher.lock();
        if handle.is_some() {
            return Ok(());
        }

        let shared = Arc::new(FlusherShared {
            wake: Mutex::new(false),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let daemon_shared = Arc::clone(&shared);
        let pool = Arc::downgrade(self);
        let interval = Duration::from_millis(self.cfg.flush_interval_msecs.max(1));
        let ratio = self.cfg.buffer_flush_ratio;

        let join = std::thread::Builder::new()
            .name("page-flush".into())
            .spawn(move || {
                let th = {
                    let Some(pool) = pool.upgrade() else {
                        return;
                    };
                    match pool.threads().register() {
                        Ok(th) => th,
                        Err(err) => {
                            tracing::error!(%err, "page-flush daemon has no thread slot");
                            return;
                        }
                    }
                };

                loop {
                    {
                        let mut wake = daemon_shared.wake.lock();
                        if !*wake {
                            daemon_shared.cond.wait_for(&mut wake, interval);
                        }
                        *wake = false;
                    }
                    if daemon_shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    if let Err(err) = pool.flush_victim_candidates(&th, ratio) {
                        tracing::error!(%err, "background victim flush failed");
                    }
                }
            })
            .map_err(DbError::Io)?;

        *handle = Some(FlusherHandle {
            shared,
            join: Some(join),
        });
        Ok(())
    }

    /// Nudge the daemon out of its interval sleep.
    pub(crate) fn wake_flusher(&self) {
        if let Some(handle) = self.flusher.lock().as_ref() {
            let mut wake = handle.shared.wake.lock();
            *wake = true;
            handle.shared.cond.notify_one();
        }
    }

    /// Stop the daemon and wait for it to exit. Idempotent; also run on
    /// drop.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        let handle = self.flusher.lock().take();
        if let Some(mut handle) = handle {
            handle.shared.stop.store(true, Ordering::Release);
            {
                let mut wake = handle.shared.wake.lock();
                *wake = true;
                handle.shared.cond.notify_one();
            }
            if let Some(join) = handle.join.take() {
                // The daemon itself can end up dropping the last pool
                // reference; it must not join its own thread.
                if join.thread().id() != std::thread::current().id() {
                    let _ = join.join();
                }
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }
}
