use std::sync::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::reqlist::EntryStatus;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    NotFinished,
    Ok,
    Error,
    Canceled,
}

fn join(statuses: &[EntryStatus]) -> RequestStatus {
    if statuses.iter().any(|s| *s == EntryStatus::Error) {
        RequestStatus::Error
    } else if statuses.iter().all(|s| *s == EntryStatus::Ok) {
        RequestStatus::Ok
    } else if statuses.iter().any(|s| *s == EntryStatus::Canceled) {
        RequestStatus::Canceled
    } else {
        RequestStatus::NotFinished
    }
}

/// Per-request state: one entry per reqlist fragment, plus the condvar
/// waiters block on. Owned jointly by the `DmaRequest` handle and (while
/// posted) by whichever ring slots back its not-yet-terminal entries.
pub struct RequestInner {
    pub(crate) id: u64,
    pub(crate) lens: Vec<u64>,
    statuses: Mutex<Vec<EntryStatus>>,
    cv: Condvar,
}

impl RequestInner {
    pub(crate) fn new(id: u64, statuses: Vec<EntryStatus>, lens: Vec<u64>) -> Self {
        Self { id, lens, statuses: Mutex::new(statuses), cv: Condvar::new() }
    }

    pub(crate) fn len_of(&self, idx: usize) -> u64 {
        self.lens[idx]
    }

    pub(crate) fn set_entry_status_if_posted(&self, idx: usize, status: EntryStatus) {
        let mut g = self.statuses.lock().unwrap();
        if g[idx] == EntryStatus::Posted {
            g[idx] = status;
        }
        drop(g);
        self.cv.notify_all();
    }

    pub(crate) fn cancel_entry(&self, idx: usize) {
        self.set_entry_status_if_posted(idx, EntryStatus::Canceled);
    }

    pub(crate) fn cancel_all_posted(&self) {
        let mut g = self.statuses.lock().unwrap();
        for s in g.iter_mut() {
            if *s == EntryStatus::Posted {
                *s = EntryStatus::Canceled;
            }
        }
        drop(g);
        self.cv.notify_all();
    }

    pub fn join_status(&self) -> RequestStatus {
        join(&self.statuses.lock().unwrap())
    }

    pub(crate) fn wait(&self, should_stop: &AtomicBool) -> RequestStatus {
        let mut g = self.statuses.lock().unwrap();
        loop {
            let status = join(&g);
            if status != RequestStatus::NotFinished || should_stop.load(Ordering::SeqCst) {
                return status;
            }
            g = self.cv.wait(g).unwrap();
        }
    }

    pub(crate) fn timedwait(
        &self,
        timeout: Duration,
        should_stop: &AtomicBool,
    ) -> Result<RequestStatus, Error> {
        let mut g = self.statuses.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let status = join(&g);
            if status != RequestStatus::NotFinished || should_stop.load(Ordering::SeqCst) {
                return Ok(status);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                // timed out: status is left untouched so a later `wait` is legal
                return Err(Error::TimedOut);
            }
            let (guard, timeout_result) = self.cv.wait_timeout(g, deadline - now).unwrap();
            g = guard;
            if timeout_result.timed_out() && join(&g) == RequestStatus::NotFinished {
                return Err(Error::TimedOut);
            }
        }
    }
}

/// User-visible handle returned by `DmaEngine::post`.
pub struct DmaRequest {
    pub(crate) inner: Arc<RequestInner>,
    pub(crate) engine: Arc<crate::engine::EngineInner>,
}

impl DmaRequest {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns current status without blocking.
    pub fn test(&self) -> RequestStatus {
        self.inner.join_status()
    }

    /// Blocks until the request reaches a terminal status or the engine is
    /// shutting down.
    pub fn wait(&self) -> RequestStatus {
        self.inner.wait(&self.engine.should_stop)
    }

    /// Blocks with a bound; `Err(Error::TimedOut)` leaves status untouched.
    pub fn timedwait(&self, timeout: Duration) -> Result<RequestStatus, Error> {
        self.inner.timedwait(timeout, &self.engine.should_stop)
    }

    /// Releases the request's slot in the engine's bookkeeping table.
    pub fn free(self) {
        self.engine.forget(self.inner.id);
    }
}
