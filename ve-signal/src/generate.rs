//! Signal generation: `send_ve_signal`, the Rust shape of the reference's
//! `psm_send_ve_signal`.

use ve_task::registry::Registry;
use ve_task::signals::{
    bit, is_stop_class, GroupFlag, QueuedSignal, SigInfo, SEND_SIG_PRIV, SIGCONT, SIGKILL,
    SIGRTMIN, SIGSTOP, SI_KERNEL,
};
use ve_task::task::TaskState;

use crate::error::Error;

/// What the caller should do once the siglock has been released, mirroring
/// the reference's post-release unblock/kick step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostRelease {
    /// Nothing further needed.
    None,
    /// Issue an unblock request so the target task can be scheduled (a
    /// synchronous signal was just queued).
    Unblock,
    /// Kick the per-core scheduler (the target is the currently running
    /// task and the signal is asynchronous).
    KickScheduler,
}

pub struct SendSignalRequest<'a> {
    pub signum: u32,
    pub siginfo: Option<SigInfo>,
    pub from_exception: bool,
    pub is_current_task: bool,
    pub _marker: std::marker::PhantomData<&'a ()>,
}

/// Sends `signum` to the task group leader identified by `tgid`, applying
/// every ordering/coalescing rule in one siglock critical section.
pub fn send_ve_signal(
    registry: &Registry,
    tgid: i32,
    target_pid: i32,
    req: SendSignalRequest,
) -> Result<PostRelease, Error> {
    if req.signum == 0 || req.signum as usize >= ve_task::signals::NSIG {
        return Err(Error::InvalidArgument);
    }

    let members = registry.thread_group(tgid);
    let Some(leader) = members.first().cloned() else { return Err(Error::NoSuchTask) };
    let target = registry.lookup(target_pid).ok_or(Error::NoSuchTask)?;

    let mut sh = leader.sighand.siglock.lock().unwrap();

    if matches!(sh.group_flag, GroupFlag::CoreDump) {
        if req.signum == ve_task::signals::SIGINT {
            sh.got_sigint = true;
        }
        return Ok(PostRelease::None);
    }

    if req.signum == SIGCONT {
        for t in &members {
            if let Some(sig) = sh.per_task.get_mut(&t.pid) {
                sig.remove_stop_class();
            }
            if t.state() == TaskState::Stop {
                t.set_state(TaskState::Running);
            }
        }
        return Ok(PostRelease::None);
    }

    if is_stop_class(req.signum) {
        if let Some(sig) = sh.per_task.get_mut(&target.pid) {
            sig.remove_signal(SIGCONT);
        }
    }

    let rlimit_sigpending = sh.rlimit_sigpending;
    let privileged_origin = req.siginfo.is_none() || req.siginfo.map(|i| i.code >= 0).unwrap_or(false);
    // §3/§4.3 cap the soft RLIMIT_SIGPENDING over the whole thread group's
    // queued realtime records, not per signo or per task. Computed before
    // taking the per-task entry's mutable borrow below.
    let group_realtime_queued: u64 = sh
        .per_task
        .values()
        .map(|s| s.pending_queue.iter().filter(|q| q.info.signo >= SIGRTMIN as u32).count() as u64)
        .sum();

    let sig_state = sh.per_task.entry(target.pid).or_default();

    if sig_state.is_legacy_collapsed(req.signum) {
        return Ok(PostRelease::None);
    }

    if req.signum >= SIGRTMIN as u32 && !privileged_origin && group_realtime_queued >= rlimit_sigpending {
        return Ok(PostRelease::None);
    }

    let mut info = req.siginfo.unwrap_or(SigInfo {
        signo: req.signum,
        code: SI_KERNEL,
        pid: 0,
        uid: 0,
        si_addr: 0,
    });
    info.signo = req.signum;
    if req.from_exception {
        info.si_addr = target.registers().ic;
    }

    sig_state.enqueue(QueuedSignal { info, from_exception: req.from_exception });
    drop(sh);

    let post_release = if ve_task::signals::is_synchronous(req.signum) {
        PostRelease::Unblock
    } else if req.is_current_task {
        PostRelease::KickScheduler
    } else {
        PostRelease::None
    };
    Ok(post_release)
}

/// Convenience for kernel-origin sends (`SEND_SIG_PRIV`).
pub fn privileged_siginfo(signum: u32) -> SigInfo {
    SigInfo { signo: signum, code: SI_KERNEL, pid: SEND_SIG_PRIV as i32, uid: 0, si_addr: 0 }
}

pub fn is_never_blockable(signum: u32) -> bool {
    bit(signum) & (bit(SIGKILL) | bit(SIGSTOP)) != 0
}
