//! Memory-mapped control-register shim for the DMA descriptor ring.
//!
//! The real hardware driver character device and its MMIO window are
//! outside this crate's reach in this environment; `DescriptorRingDriver`
//! is the seam a production build would implement against
//! `/dev/veslotN`'s mmap'd BAR. `SimDriver` is the stand-in used by the
//! default wiring and by tests; it reproduces the ring's FIFO completion
//! behavior without real interrupts.

use std::sync::Mutex;

use crate::reqlist::EntryStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRunState {
    Halt,
    Running,
}

pub trait DescriptorRingDriver: Send + Sync {
    fn halt(&self);
    fn start(&self);
    fn run_state(&self) -> EngineRunState;
    /// Clear (zero) one descriptor slot.
    fn clear(&self, slot: usize);
    /// Publish a descriptor for `slot` covering `len` bytes; marks the slot
    /// occupied on the simulated ring.
    fn post(&self, slot: usize, len: u64, should_error: bool);
    /// Read the hardware read pointer (ring index of the next slot the
    /// device will touch).
    fn read_readptr(&self) -> usize;
    /// Per-slot completion status, valid once `read_readptr` has advanced
    /// past that slot.
    fn read_status(&self, slot: usize) -> EntryStatus;
    /// `veos_commit_rdawr_order`: a write-order barrier issued after every
    /// MMIO write that publishes new work.
    fn commit_order(&self) {}
}

struct SimState {
    run: EngineRunState,
    readptr: usize,
    slots: Vec<Option<(u64, bool)>>, // (len, should_error)
}

/// A driver stand-in that completes every posted descriptor the instant
/// the helper thread asks for the read pointer, in ring order, emulating
/// the FIFO visibility the real hardware gives through its interrupt.
pub struct SimDriver {
    state: Mutex<SimState>,
    n_desc: usize,
}

impl SimDriver {
    pub fn new(n_desc: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                run: EngineRunState::Halt,
                readptr: 0,
                slots: vec![None; n_desc],
            }),
            n_desc,
        }
    }
}

impl DescriptorRingDriver for SimDriver {
    fn halt(&self) {
        self.state.lock().unwrap().run = EngineRunState::Halt;
    }

    fn start(&self) {
        self.state.lock().unwrap().run = EngineRunState::Running;
    }

    fn run_state(&self) -> EngineRunState {
        self.state.lock().unwrap().run
    }

    fn clear(&self, slot: usize) {
        self.state.lock().unwrap().slots[slot] = None;
    }

    fn post(&self, slot: usize, len: u64, should_error: bool) {
        self.state.lock().unwrap().slots[slot] = Some((len, should_error));
    }

    fn read_readptr(&self) -> usize {
        let mut st = self.state.lock().unwrap();
        if st.run == EngineRunState::Running {
            // advance past every currently-occupied slot: a completed transfer
            let n = self.n_desc;
            let mut rp = st.readptr;
            let mut advanced = false;
            for _ in 0..n {
                if st.slots[rp].is_some() {
                    rp = (rp + 1) % n;
                    advanced = true;
                } else if advanced {
                    break;
                } else {
                    break;
                }
            }
            st.readptr = rp;
        }
        st.readptr
    }

    fn read_status(&self, slot: usize) -> EntryStatus {
        let st = self.state.lock().unwrap();
        match st.slots[slot] {
            Some((_, true)) => EntryStatus::Error,
            Some((_, false)) => EntryStatus::Ok,
            None => EntryStatus::Ok,
        }
    }
}
