//! The process-wide task tree and the five thread-group actions.
//!
//! Rather than a singleton, the registry is an explicit structure handed
//! by reference to every subsystem that needs to enumerate or look up
//! tasks, per the "no hidden singletons" design note.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::signals::SigHand;
use crate::task::{BlockStatus, TaskState, VeTask};

/// `init_task_lock` + `ve_tasklist_lock` collapsed into one registry-level
/// lock: in this implementation both guard exactly the same map, so a
/// single `RwLock` gives the same read/write concurrency without an
/// artificial second lock that would never be taken independently.
pub struct Registry {
    /// `handling_request_lock`: read-held by request handlers, write-held
    /// by shutdown, so handlers and shutdown never race.
    pub handling_request_lock: RwLock<()>,
    tasks: RwLock<HashMap<i32, Arc<VeTask>>>,
    groups: RwLock<HashMap<i32, Arc<SigHand>>>,
    pub terminate_flag: std::sync::atomic::AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            handling_request_lock: RwLock::new(()),
            tasks: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            terminate_flag: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn sighand_for_group(&self, tgid: i32, rlimit_core: u64, rlimit_sigpending: u64) -> Arc<SigHand> {
        let mut g = self.groups.write().unwrap();
        g.entry(tgid).or_insert_with(|| Arc::new(SigHand::new(rlimit_core, rlimit_sigpending))).clone()
    }

    pub fn insert(&self, task: Arc<VeTask>) {
        self.tasks.write().unwrap().insert(task.pid, task);
    }

    pub fn remove(&self, pid: i32) -> Option<Arc<VeTask>> {
        self.tasks.write().unwrap().remove(&pid)
    }

    pub fn lookup(&self, pid: i32) -> Option<Arc<VeTask>> {
        self.tasks.read().unwrap().get(&pid).cloned()
    }

    /// Every task sharing `tgid`, leader first, in pid order.
    pub fn thread_group(&self, tgid: i32) -> Vec<Arc<VeTask>> {
        let mut v: Vec<_> =
            self.tasks.read().unwrap().values().filter(|t| t.tgid == tgid).cloned().collect();
        v.sort_by_key(|t| (t.pid != t.tgid, t.pid));
        v
    }

    pub fn all_pids(&self) -> Vec<i32> {
        self.tasks.read().unwrap().keys().copied().collect()
    }
}

/// Reports whether the host pseudo process backing a VE task is actually
/// stopped (`/proc/<pid>/status` state `T`). A real implementation reads
/// procfs; tests use an in-memory fake.
pub trait ProcStatusSource: Send + Sync {
    fn is_stopped(&self, pid: i32) -> bool;
}

pub struct RealProcStatusSource;

impl ProcStatusSource for RealProcStatusSource {
    fn is_stopped(&self, pid: i32) -> bool {
        let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
            return false;
        };
        status.lines().any(|l| l.starts_with("State:") && l.contains('T'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    /// `SIGCONTINUE`: drop stop-class records, run each thread unless
    /// vfork-in-progress or MONC pending.
    Continue,
    /// `SIGSTOPPING`: unconditionally stop every thread.
    SigStopping,
    /// `STOPPROC`: stop every thread, but first confirm via
    /// `ProcStatusSource` that the host pseudo process is actually
    /// stopped; if not, leave the task alone and abort the group walk.
    StopProc,
    /// `CLEANTHREAD`: like `SigStopping` but skips the caller's own task
    /// (used from the core-dump worker thread).
    CleanThread,
}

/// Applies one of the five group actions described in the spec, walking
/// the thread group leader-first.
pub fn apply_group_action(
    registry: &Registry,
    tgid: i32,
    action: GroupAction,
    caller_pid: Option<i32>,
    proc_status: &dyn ProcStatusSource,
) {
    let members = registry.thread_group(tgid);
    let Some(leader) = members.first() else { return };
    let mut sh = leader.sighand.siglock.lock().unwrap();

    match action {
        GroupAction::Continue => {
            for t in &members {
                if let Some(sig) = sh.per_task.get_mut(&t.pid) {
                    sig.remove_stop_class();
                }
                t.with_inner(|inner| {
                    if !inner.vfork_in_progress && inner.block_status != BlockStatus::Monc {
                        inner.state = TaskState::Running;
                    }
                });
            }
        }
        GroupAction::SigStopping => {
            for t in &members {
                t.set_state(TaskState::Stop);
            }
        }
        GroupAction::StopProc => {
            for t in &members {
                if !proc_status.is_stopped(t.pid) {
                    break;
                }
                t.set_state(TaskState::Stop);
            }
        }
        GroupAction::CleanThread => {
            for t in &members {
                if Some(t.pid) == caller_pid {
                    continue;
                }
                t.set_state(TaskState::Stop);
            }
        }
    }
    drop(sh);
}

/// `SIGMASKING`: removes every queued record of `signum` from every
/// thread's pending queue.
pub fn mask_signal_in_group(registry: &Registry, tgid: i32, signum: u32) {
    let members = registry.thread_group(tgid);
    let Some(leader) = members.first() else { return };
    let mut sh = leader.sighand.siglock.lock().unwrap();
    for t in &members {
        if let Some(sig) = sh.per_task.get_mut(&t.pid) {
            sig.remove_signal(signum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProcStatus(std::collections::HashMap<i32, bool>);
    impl ProcStatusSource for FakeProcStatus {
        fn is_stopped(&self, pid: i32) -> bool {
            *self.0.get(&pid).unwrap_or(&false)
        }
    }

    fn make_group(reg: &Registry, tgid: i32, pids: &[i32]) {
        let sh = reg.sighand_for_group(tgid, 0, 64);
        for &pid in pids {
            reg.insert(VeTask::new(pid, tgid, 0, 0, sh.clone()));
        }
    }

    #[test]
    fn stop_proc_breaks_on_first_non_stopped() {
        let reg = Registry::new();
        make_group(&reg, 100, &[100, 101, 102]);
        let fake = FakeProcStatus(HashMap::from([(100, true), (101, false), (102, true)]));
        apply_group_action(&reg, 100, GroupAction::StopProc, None, &fake);
        assert_eq!(reg.lookup(100).unwrap().state(), TaskState::Stop);
        assert_eq!(reg.lookup(101).unwrap().state(), TaskState::Running);
        assert_eq!(reg.lookup(102).unwrap().state(), TaskState::Running);
    }

    #[test]
    fn clean_thread_skips_caller() {
        let reg = Registry::new();
        make_group(&reg, 200, &[200, 201]);
        apply_group_action(&reg, 200, GroupAction::CleanThread, Some(201), &RealProcStatusSource);
        assert_eq!(reg.lookup(200).unwrap().state(), TaskState::Stop);
        assert_eq!(reg.lookup(201).unwrap().state(), TaskState::Running);
    }
}
