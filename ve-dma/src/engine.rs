use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};

use crate::addr::Endpoint;
use crate::driver::DescriptorRingDriver;
use crate::reqlist::{self, EntryStatus, PageTranslator};
use crate::request::{DmaRequest, RequestInner};
use crate::Error;

/// Fixed-size hardware descriptor ring length.
pub const N_DESC: usize = 32;

/// How long the interrupt-helper thread blocks between polls of the
/// simulated completion signal. A real driver would instead block on the
/// character device's interrupt wait ioctl.
const HELPER_POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy)]
struct Slot {
    request_id: u64,
    entry_idx: usize,
}

struct EngineState {
    slots: Vec<Option<Slot>>,
    waiting: VecDeque<(u64, usize)>,
    desc_used_begin: usize,
    desc_num_used: usize,
    requests: HashMap<u64, Arc<RequestInner>>,
}

impl EngineState {
    fn free_slot_count(&self) -> usize {
        N_DESC - self.desc_num_used
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub desc_num_used: usize,
    pub waiting: usize,
    pub requests: usize,
}

pub(crate) struct EngineInner {
    driver: Arc<dyn DescriptorRingDriver>,
    state: Mutex<EngineState>,
    wake: Condvar,
    pub(crate) should_stop: AtomicBool,
    next_request_id: AtomicU64,
    helper: Mutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    pub(crate) fn forget(&self, id: u64) {
        self.state.lock().unwrap().requests.remove(&id);
    }
}

/// Owns one descriptor ring for one VE node.
#[derive(Clone)]
pub struct DmaEngine {
    inner: Arc<EngineInner>,
}

impl DmaEngine {
    /// Maps the control-register window (via `driver`), halting and
    /// clearing it if it wasn't already halted, then snapshots the read
    /// pointer and spawns the interrupt-helper thread.
    pub fn open(driver: Arc<dyn DescriptorRingDriver>) -> Result<Self, Error> {
        if driver.run_state() != crate::driver::EngineRunState::Halt {
            driver.halt();
            for slot in 0..N_DESC {
                driver.clear(slot);
            }
        }
        let desc_used_begin = driver.read_readptr();

        let inner = Arc::new(EngineInner {
            driver,
            state: Mutex::new(EngineState {
                slots: vec![None; N_DESC],
                waiting: VecDeque::new(),
                desc_used_begin,
                desc_num_used: 0,
                requests: HashMap::new(),
            }),
            wake: Condvar::new(),
            should_stop: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            helper: Mutex::new(None),
        });

        let helper_inner = inner.clone();
        let handle = std::thread::spawn(move || interrupt_helper_loop(helper_inner));
        *inner.helper.lock().unwrap() = Some(handle);

        Ok(DmaEngine { inner })
    }

    pub fn stats(&self) -> EngineStats {
        let st = self.inner.state.lock().unwrap();
        EngineStats {
            desc_num_used: st.desc_num_used,
            waiting: st.waiting.len(),
            requests: st.requests.len(),
        }
    }

    /// Splits `(src, dst, len)` into reqlist entries and posts as many as
    /// fit into free ring slots, queuing the remainder.
    pub fn post(
        &self,
        src: Endpoint,
        dst: Endpoint,
        len: u64,
        translator: &dyn PageTranslator,
    ) -> Result<DmaRequest, Error> {
        let entries = reqlist::split_transfer(src, dst, len, translator)?;
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);

        let statuses: Vec<EntryStatus> = entries.iter().map(|e| e.status).collect();
        let lens: Vec<u64> = entries.iter().map(|e| e.len).collect();
        let inner = Arc::new(RequestInner::new(id, statuses, lens));

        let mut st = self.inner.state.lock().unwrap();
        let mut posted_new = false;
        for (idx, entry) in entries.iter().enumerate() {
            if entry.status == EntryStatus::Error {
                continue; // translation failed before posting; already terminal
            }
            if st.free_slot_count() > 0 {
                let slot_idx = (st.desc_used_begin + st.desc_num_used) % N_DESC;
                self.inner.driver.post(slot_idx, entry.len, false);
                st.slots[slot_idx] = Some(Slot { request_id: id, entry_idx: idx });
                st.desc_num_used += 1;
                posted_new = true;
            } else {
                st.waiting.push_back((id, idx));
            }
        }
        st.requests.insert(id, inner.clone());
        drop(st);

        if posted_new {
            self.inner.driver.commit_order();
            self.inner.driver.start();
        }
        self.inner.wake.notify_all();

        Ok(DmaRequest { inner, engine: self.inner.clone() })
    }

    /// Cancels every not-yet-terminal entry of `req`. Entries still queued
    /// (never posted to a ring slot) are dropped from the waiting list;
    /// entries already in flight are marked canceled in place so the
    /// helper thread's next harvest frees their slot without overwriting
    /// the canceled status.
    pub fn terminate(&self, req: &DmaRequest) -> Result<(), Error> {
        self.inner.driver.halt();
        let mut st = self.inner.state.lock().unwrap();
        req.inner.cancel_all_posted();
        st.waiting.retain(|(rid, _)| *rid != req.inner.id);
        let still_in_use = st.desc_num_used > 0;
        drop(st);
        if still_in_use {
            self.inner.driver.start();
        }
        self.inner.wake.notify_all();
        Ok(())
    }

    /// Cancels every in-flight and waiting entry across every request,
    /// clears the descriptor table, and leaves the engine halted.
    pub fn terminate_all(&self) {
        self.inner.driver.halt();
        let mut st = self.inner.state.lock().unwrap();
        for (slot_idx, slot) in st.slots.iter_mut().enumerate() {
            if let Some(Slot { request_id, entry_idx }) = slot.take() {
                if let Some(req) = st.requests.get(&request_id) {
                    req.cancel_entry(entry_idx);
                }
                self.inner.driver.clear(slot_idx);
            }
        }
        let waiting = std::mem::take(&mut st.waiting);
        for (rid, eidx) in waiting {
            if let Some(req) = st.requests.get(&rid) {
                req.cancel_entry(eidx);
            }
        }
        st.desc_num_used = 0;
        st.desc_used_begin = self.inner.driver.read_readptr();
        drop(st);
        self.inner.wake.notify_all();
    }

    /// Requires no descriptors in flight, then stops and joins the helper
    /// thread.
    pub fn close(&self) -> Result<(), Error> {
        {
            let st = self.inner.state.lock().unwrap();
            if st.desc_num_used != 0 {
                return Err(Error::Busy);
            }
        }
        self.inner.should_stop.store(true, Ordering::SeqCst);
        self.inner.driver.halt();
        self.inner.wake.notify_all();
        if let Some(handle) = self.inner.helper.lock().unwrap().take() {
            handle.join().map_err(|_| Error::Io(std::io::Error::other("helper thread panicked")))?;
        }
        Ok(())
    }
}

fn interrupt_helper_loop(inner: Arc<EngineInner>) {
    loop {
        {
            let st = inner.state.lock().unwrap();
            if inner.should_stop.load(Ordering::SeqCst) {
                return;
            }
            let _ = inner.wake.wait_timeout(st, HELPER_POLL_INTERVAL).unwrap();
        }
        if inner.should_stop.load(Ordering::SeqCst) {
            return;
        }
        harvest_completions(&inner);
    }
}

fn harvest_completions(inner: &Arc<EngineInner>) {
    let mut st = inner.state.lock().unwrap();
    let new_rp = inner.driver.read_readptr();

    while st.desc_used_begin != new_rp && st.desc_num_used > 0 {
        let slot_idx = st.desc_used_begin;
        let slot = st.slots[slot_idx].take();
        st.desc_used_begin = (st.desc_used_begin + 1) % N_DESC;
        st.desc_num_used -= 1;
        if let Some(Slot { request_id, entry_idx }) = slot {
            let status = inner.driver.read_status(slot_idx);
            if let Some(req) = st.requests.get(&request_id).cloned() {
                trace!("reaping slot {slot_idx} req={request_id} entry={entry_idx} status={status:?}");
                req.set_entry_status_if_posted(entry_idx, status);
            }
        }
        inner.driver.clear(slot_idx);
    }

    let mut posted_new = false;
    while st.free_slot_count() > 0 {
        let Some((rid, eidx)) = st.waiting.pop_front() else { break };
        let Some(req) = st.requests.get(&rid).cloned() else { continue };
        let len = req.len_of(eidx);
        let slot_idx = (st.desc_used_begin + st.desc_num_used) % N_DESC;
        inner.driver.post(slot_idx, len, false);
        st.slots[slot_idx] = Some(Slot { request_id: rid, entry_idx: eidx });
        st.desc_num_used += 1;
        posted_new = true;
    }
    drop(st);

    if posted_new {
        inner.driver.commit_order();
        inner.driver.start();
    }
    debug!("harvest complete, readptr now {new_rp}");
}
