//! Signal numbers, sets and the per-task/per-group signal data model.

use std::collections::VecDeque;

pub const NSIG: usize = 64;
pub const SIGRTMIN: u32 = 34;

pub const SIGINT: u32 = 2;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGTERM: u32 = 15;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;

pub const SYNCHRONOUS_MASK: u64 =
    bit(SIGSEGV) | bit(SIGBUS) | bit(SIGILL) | bit(SIGFPE) | bit(SIGTRAP);

pub const STOP_CLASS_MASK: u64 = bit(SIGTSTP) | bit(SIGTTIN) | bit(SIGTTOU);

pub const NEVER_BLOCKABLE_MASK: u64 = bit(SIGKILL) | bit(SIGSTOP);

pub const fn bit(signum: u32) -> u64 {
    1u64 << (signum - 1)
}

pub fn is_synchronous(signum: u32) -> bool {
    bit(signum) & SYNCHRONOUS_MASK != 0
}

pub fn is_stop_class(signum: u32) -> bool {
    bit(signum) & STOP_CLASS_MASK != 0
}

/// Sentinel used by the caller to request a kernel-origin signal (no real
/// siginfo payload is available), mirroring `SEND_SIG_PRIV`.
pub const SEND_SIG_PRIV: i32 = -1;

pub const SI_KERNEL: i32 = 0x80;
pub const SI_USER: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Ignore,
    Stop,
    Term,
    Core,
}

pub fn default_action(signum: u32) -> DefaultAction {
    match signum {
        s if s == SIGCONT => DefaultAction::Ignore,
        s if is_stop_class(s) || s == SIGSTOP => DefaultAction::Stop,
        s if s == SIGSEGV || s == SIGBUS || s == SIGILL || s == SIGFPE || s == SIGTRAP => {
            DefaultAction::Core
        }
        _ => DefaultAction::Term,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: u32,
    pub code: i32,
    pub pid: i32,
    pub uid: u32,
    pub si_addr: u64,
}

impl SigInfo {
    pub fn privileged(signo: u32) -> Self {
        Self { signo, code: SI_KERNEL, pid: 0, uid: 0, si_addr: 0 }
    }
}

/// `{signo, siginfo payload, flag}`: `from_exception` marks whether this
/// record originated from a hardware exception, which attaches the
/// faulting instruction address as `si_addr` and later (on fatal
/// sigreturn) forces termination with the original signal.
#[derive(Debug, Clone, Copy)]
pub struct QueuedSignal {
    pub info: SigInfo,
    pub from_exception: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SigAction {
    pub handler: Handler,
    pub flags: SaFlags,
    pub mask: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Default,
    Ignore,
    Address(u64),
}

impl Default for Handler {
    fn default() -> Self {
        Handler::Default
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaFlags {
    pub onstack: bool,
    pub restart: bool,
    pub nodefer: bool,
    pub resethand: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AltStack {
    pub sp: u64,
    pub size: u64,
    pub disabled: bool,
    pub onstack: bool,
}

pub const VE_MINSIGSTKSZ: u64 = 0x2000;

impl AltStack {
    pub fn is_valid(&self) -> bool {
        !self.disabled && self.size >= VE_MINSIGSTKSZ
    }

    pub fn contains(&self, sp: u64) -> bool {
        sp >= self.sp && sp < self.sp + self.size
    }
}

/// Per-task signal bookkeeping, logically guarded by the owning thread
/// group's `siglock` (see `SigHand`).
#[derive(Debug, Default)]
pub struct PerTaskSignalState {
    pub pending_bitset: u64,
    pub pending_queue: VecDeque<QueuedSignal>,
    pub blocked: u64,
    pub saved_mask: Option<u64>,
    pub altstack: AltStack,
    pub sigpending: bool,
}

impl PerTaskSignalState {
    pub fn recalc_sigpending(&mut self) {
        self.sigpending = (self.pending_bitset & !self.blocked) != 0;
    }

    /// At most one queued record per `signo < SIGRTMIN`; realtime signals
    /// always append a fresh record (caller already enforced the
    /// RLIMIT_SIGPENDING cap).
    pub fn enqueue(&mut self, q: QueuedSignal) {
        self.pending_bitset |= bit(q.info.signo);
        self.pending_queue.push_back(q);
        self.recalc_sigpending();
    }

    pub fn is_legacy_collapsed(&self, signum: u32) -> bool {
        signum < SIGRTMIN && (self.pending_bitset & bit(signum)) != 0
    }

    pub fn queued_count(&self, signum: u32) -> usize {
        self.pending_queue.iter().filter(|q| q.info.signo == signum).count()
    }

    /// Removes every queued record for `signum`, clearing its bitset bit
    /// if none remain.
    pub fn remove_signal(&mut self, signum: u32) {
        self.pending_queue.retain(|q| q.info.signo != signum);
        if self.queued_count(signum) == 0 {
            self.pending_bitset &= !bit(signum);
        }
        self.recalc_sigpending();
    }

    /// Removes every stop-class record (`SIGTSTP|SIGTTIN|SIGTTOU`).
    pub fn remove_stop_class(&mut self) {
        self.pending_queue.retain(|q| !is_stop_class(q.info.signo));
        self.pending_bitset &= !STOP_CLASS_MASK;
        self.recalc_sigpending();
    }

    /// Dequeues the next signal to deliver: a synchronous one first, else
    /// the lowest-numbered unblocked pending signal.
    pub fn dequeue_next(&mut self) -> Option<QueuedSignal> {
        let unblocked = self.pending_bitset & !self.blocked;
        if unblocked == 0 {
            return None;
        }
        let sync_unblocked = unblocked & SYNCHRONOUS_MASK;
        let pick_mask = if sync_unblocked != 0 { sync_unblocked } else { unblocked };
        let signum = (1..=NSIG as u32).find(|s| pick_mask & bit(*s) != 0)?;
        let idx = self.pending_queue.iter().position(|q| q.info.signo == signum)?;
        let q = self.pending_queue.remove(idx)?;
        if self.queued_count(signum) == 0 {
            self.pending_bitset &= !bit(signum);
        }
        self.recalc_sigpending();
        Some(q)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupFlag {
    Normal,
    CoreDump,
    Exit,
}

#[derive(Debug)]
pub struct SigHandGuarded {
    pub handlers: [SigAction; NSIG],
    pub group_flag: GroupFlag,
    pub rlimit_core: u64,
    pub rlimit_sigpending: u64,
    pub got_sigint: bool,
    pub per_task: std::collections::HashMap<i32, PerTaskSignalState>,
}

impl SigHandGuarded {
    pub fn new(rlimit_core: u64, rlimit_sigpending: u64) -> Self {
        Self {
            handlers: [SigAction::default(); NSIG],
            group_flag: GroupFlag::Normal,
            rlimit_core,
            rlimit_sigpending,
            got_sigint: false,
            per_task: std::collections::HashMap::new(),
        }
    }
}

/// Thread-group-shared signal-handler table and group state, matching the
/// reference's `sighand_struct`. `siglock` is modeled as the `Mutex`
/// wrapping `SigHandGuarded`; `del_lock` serializes teardown/coredump.
pub struct SigHand {
    pub siglock: std::sync::Mutex<SigHandGuarded>,
    pub del_lock: std::sync::Mutex<()>,
}

impl SigHand {
    pub fn new(rlimit_core: u64, rlimit_sigpending: u64) -> Self {
        Self {
            siglock: std::sync::Mutex::new(SigHandGuarded::new(rlimit_core, rlimit_sigpending)),
            del_lock: std::sync::Mutex::new(()),
        }
    }
}
