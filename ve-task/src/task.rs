use std::sync::{Arc, Mutex};

use crate::registers::RegisterImage;
use crate::signals::SigHand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Wait,
    Stop,
    Zombie,
}

/// Whether the task is mid an uninterruptible (MONC) system call, per the
/// glossary: a VE-side condition marking an in-progress syscall that must
/// not be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    NotBlocked,
    Blocked,
    Monc,
}

/// The `ve_task_lock`-guarded part of a task: everything that isn't
/// shared signal/handler state.
#[derive(Debug)]
pub struct TaskInner {
    pub registers: RegisterImage,
    pub state: TaskState,
    pub vfork_in_progress: bool,
    pub block_status: BlockStatus,
    /// Set while delivering a synchronous signal, so the restart-syscall
    /// rules in the delivery pipeline know which register to rewrite.
    pub syncsignal: Option<u32>,
    pub rusage_offset: u64,
    /// Exit code recorded for the task, set explicitly by the normal exit
    /// path or defaulted to `SIGKILL` by the polling thread when the host
    /// pseudo process disappears without one.
    pub exit_code: Option<i32>,
}

impl Default for TaskInner {
    fn default() -> Self {
        Self {
            registers: RegisterImage::default(),
            state: TaskState::Running,
            vfork_in_progress: false,
            block_status: BlockStatus::NotBlocked,
            syncsignal: None,
            rusage_offset: 0,
            exit_code: None,
        }
    }
}

/// One VE task (Linux calls this a thread; the thread-group leader's pid
/// equals `tgid`). Shared between the scheduler, the signal pipeline, and
/// the stopping thread via `Arc`.
pub struct VeTask {
    pub pid: i32,
    pub tgid: i32,
    pub uid: u32,
    pub gid: u32,
    pub sighand: Arc<SigHand>,
    inner: Mutex<TaskInner>,
}

impl VeTask {
    pub fn new(pid: i32, tgid: i32, uid: u32, gid: u32, sighand: Arc<SigHand>) -> Arc<Self> {
        {
            let mut sh = sighand.siglock.lock().unwrap();
            sh.per_task.entry(pid).or_default();
        }
        Arc::new(Self { pid, tgid, uid, gid, sighand, inner: Mutex::new(TaskInner::default()) })
    }

    pub fn is_group_leader(&self) -> bool {
        self.pid == self.tgid
    }

    pub fn with_inner<R>(&self, f: impl FnOnce(&mut TaskInner) -> R) -> R {
        let mut g = self.inner.lock().unwrap();
        f(&mut g)
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    pub fn set_state(&self, s: TaskState) {
        self.inner.lock().unwrap().state = s;
    }

    pub fn registers(&self) -> RegisterImage {
        self.inner.lock().unwrap().registers
    }

    pub fn set_registers(&self, regs: RegisterImage) {
        self.inner.lock().unwrap().registers = regs;
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().unwrap().exit_code
    }

    /// Records `code` only if no exit code has been set yet.
    pub fn set_exit_code_if_unset(&self, code: i32) {
        let mut g = self.inner.lock().unwrap();
        if g.exit_code.is_none() {
            g.exit_code = Some(code);
        }
    }
}

impl std::fmt::Debug for VeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VeTask").field("pid", &self.pid).field("tgid", &self.tgid).finish()
    }
}
