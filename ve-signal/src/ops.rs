//! The pseudo-process-facing signal operations beyond generation/delivery:
//! `sigaction`, `sigprocmask`, `sigpending`, `sigsuspend`, `sigaltstack`,
//! and the `getcontext`/`setcontext` register-image transfer. These round
//! out the command set enumerated in the external-interface section —
//! `send_ve_signal`/`do_signal_ve` alone aren't a complete subsystem from
//! the pseudo process's point of view.

use std::sync::Arc;
use std::time::Duration;

use ve_task::registry::Registry;
use ve_task::signals::{Handler, SaFlags, SigAction, SIGKILL, SIGSTOP, NEVER_BLOCKABLE_MASK};
use ve_task::task::{TaskState, VeTask};

use crate::error::Error;

fn sighand_for<'a>(registry: &Registry, task: &'a VeTask) -> Result<Arc<ve_task::SigHand>, Error> {
    let members = registry.thread_group(task.tgid);
    if !members.iter().any(|t| t.pid == task.pid) {
        return Err(Error::NoSuchTask);
    }
    Ok(task.sighand.clone())
}

/// `sigaction(task, signum)`: installs `new` (if given) and always
/// returns the action that was in place beforehand. Rejects `SIGKILL`
/// and `SIGSTOP`, which can never be caught, blocked, or ignored.
pub fn sigaction(
    registry: &Registry,
    task: &VeTask,
    signum: u32,
    new: Option<SigAction>,
) -> Result<SigAction, Error> {
    if signum == 0 || signum as usize >= ve_task::signals::NSIG {
        return Err(Error::InvalidArgument);
    }
    if signum == SIGKILL || signum == SIGSTOP {
        return Err(Error::InvalidArgument);
    }
    let sighand = sighand_for(registry, task)?;
    let mut sh = sighand.siglock.lock().unwrap();
    let old = sh.handlers[signum as usize];
    if let Some(action) = new {
        sh.handlers[signum as usize] = action;
    }
    Ok(old)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum How {
    Block,
    Unblock,
    SetMask,
}

/// `sigprocmask(task, how, set)`: always excludes `SIGKILL`/`SIGSTOP`
/// from the resulting blocked mask, recomputes `sigpending`, and returns
/// the mask as it stood before the call.
pub fn sigprocmask(registry: &Registry, task: &VeTask, how: How, set: u64) -> Result<u64, Error> {
    let sighand = sighand_for(registry, task)?;
    let mut sh = sighand.siglock.lock().unwrap();
    let sig_state = sh.per_task.entry(task.pid).or_default();
    let old = sig_state.blocked;
    let requested = set & !NEVER_BLOCKABLE_MASK;
    sig_state.blocked = match how {
        How::Block => old | requested,
        How::Unblock => old & !requested,
        How::SetMask => requested,
    };
    sig_state.recalc_sigpending();
    Ok(old)
}

/// `sigpending(task)`: the signals that are both pending and currently
/// blocked — the same read-only snapshot `sigpending(2)` returns, since a
/// pending-but-unblocked signal would already have been delivered.
pub fn sigpending(registry: &Registry, task: &VeTask) -> Result<u64, Error> {
    let sighand = sighand_for(registry, task)?;
    let sh = sighand.siglock.lock().unwrap();
    let sig_state = sh.per_task.get(&task.pid).ok_or(Error::NoSuchTask)?;
    Ok(sig_state.pending_bitset & sig_state.blocked)
}

/// `sigsuspend(task, set)`: atomically replaces the blocked mask with
/// `set & !NEVER_BLOCKABLE_MASK`, saving the previous mask so the
/// delivery pipeline restores it once a signal has actually been
/// delivered (`mask_saved`/`saved_mask` in the data model), then marks
/// the task `WAIT`. The caller's scheduler is responsible for waking the
/// task once `sigpending` goes true and routing back through
/// `do_signal_ve`.
pub fn sigsuspend(registry: &Registry, task: &Arc<VeTask>, set: u64) -> Result<(), Error> {
    let sighand = sighand_for(registry, task)?;
    {
        let mut sh = sighand.siglock.lock().unwrap();
        let sig_state = sh.per_task.entry(task.pid).or_default();
        if sig_state.saved_mask.is_none() {
            sig_state.saved_mask = Some(sig_state.blocked);
        }
        sig_state.blocked = set & !NEVER_BLOCKABLE_MASK;
        sig_state.recalc_sigpending();
    }
    task.set_state(TaskState::Wait);
    Ok(())
}

/// Restores the mask saved by `sigsuspend` once delivery has run,
/// clearing `mask_saved`. Idempotent if no mask was saved — the saved-
/// mask restore happens whether or not a signal was actually delivered.
pub fn restore_saved_mask(registry: &Registry, task: &VeTask) -> Result<(), Error> {
    let sighand = sighand_for(registry, task)?;
    let mut sh = sighand.siglock.lock().unwrap();
    let sig_state = sh.per_task.entry(task.pid).or_default();
    if let Some(saved) = sig_state.saved_mask.take() {
        sig_state.blocked = saved;
        sig_state.recalc_sigpending();
    }
    Ok(())
}

/// `sigaltstack(task, new)`: installs (if given) and returns the
/// previous alternate-stack descriptor. Rejects an attempt to change the
/// stack while the task is currently executing on it.
pub fn sigaltstack(
    registry: &Registry,
    task: &VeTask,
    new: Option<ve_task::signals::AltStack>,
) -> Result<ve_task::signals::AltStack, Error> {
    let sighand = sighand_for(registry, task)?;
    let mut sh = sighand.siglock.lock().unwrap();
    let sig_state = sh.per_task.entry(task.pid).or_default();
    let old = sig_state.altstack;
    if let Some(requested) = new {
        if old.onstack {
            return Err(Error::InvalidArgument);
        }
        sig_state.altstack = requested;
    }
    Ok(old)
}

/// The full state `getcontext`/`setcontext` transfer as one unit: the
/// register image plus the blocked mask. Built on the same frame-shaped
/// serialization the signal frame uses, but without the
/// trampoline/siginfo fields those calls don't need.
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub registers: ve_task::registers::RegisterImage,
    pub blocked: u64,
}

pub fn getcontext(registry: &Registry, task: &VeTask) -> Result<Context, Error> {
    let sighand = sighand_for(registry, task)?;
    let sh = sighand.siglock.lock().unwrap();
    let blocked = sh.per_task.get(&task.pid).map(|s| s.blocked).unwrap_or(0);
    Ok(Context { registers: task.registers(), blocked })
}

pub fn setcontext(registry: &Registry, task: &VeTask, ctx: Context) -> Result<(), Error> {
    let sighand = sighand_for(registry, task)?;
    task.set_registers(ctx.registers);
    let mut sh = sighand.siglock.lock().unwrap();
    let sig_state = sh.per_task.entry(task.pid).or_default();
    sig_state.blocked = ctx.blocked;
    sig_state.recalc_sigpending();
    Ok(())
}

/// Default action table entry rejecting `SIGKILL`/`SIGSTOP`, for callers
/// building a `SigAction` to pass to `sigaction`.
pub fn default_handler_action() -> SigAction {
    SigAction { handler: Handler::Default, flags: SaFlags::default(), mask: 0 }
}

/// Blocks the calling thread until `poll_fn` observes the task is no
/// longer waiting, or `timeout` elapses — used by a synchronous
/// `sigsuspend` command handler that must not return to the pseudo
/// process until a signal has actually been delivered.
pub fn wait_for_wake(task: &VeTask, timeout: Duration, poll_fn: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if poll_fn() || task.state() != TaskState::Wait {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ve_task::signals::{SIGTERM, SIGTSTP};

    fn setup() -> (Registry, Arc<VeTask>) {
        let registry = Registry::new();
        let sh = registry.sighand_for_group(1, 0, 64);
        let task = VeTask::new(1, 1, 0, 0, sh);
        registry.insert(task.clone());
        (registry, task)
    }

    #[test]
    fn sigaction_rejects_sigkill_and_sigstop() {
        let (registry, task) = setup();
        assert!(matches!(
            sigaction(&registry, &task, SIGKILL, Some(default_handler_action())),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            sigaction(&registry, &task, SIGSTOP, Some(default_handler_action())),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn sigaction_installs_and_returns_old() {
        let (registry, task) = setup();
        let install = SigAction { handler: Handler::Address(0x4000), flags: SaFlags::default(), mask: 0 };
        let old = sigaction(&registry, &task, SIGTERM, Some(install)).unwrap();
        assert_eq!(old.handler, Handler::Default);
        let old2 = sigaction(&registry, &task, SIGTERM, None).unwrap();
        assert_eq!(old2.handler, Handler::Address(0x4000));
    }

    #[test]
    fn sigprocmask_block_unblock_is_identity() {
        let (registry, task) = setup();
        let mask = ve_task::signals::bit(SIGTERM);
        sigprocmask(&registry, &task, How::Block, mask).unwrap();
        let blocked_after_block = sigprocmask(&registry, &task, How::Unblock, mask).unwrap();
        assert_eq!(blocked_after_block, mask);
        let final_mask = {
            let sh = task.sighand.siglock.lock().unwrap();
            sh.per_task.get(&task.pid).unwrap().blocked
        };
        assert_eq!(final_mask, 0);
    }

    #[test]
    fn sigprocmask_never_blocks_sigkill_sigstop() {
        let (registry, task) = setup();
        let requested = ve_task::signals::bit(SIGKILL) | ve_task::signals::bit(SIGSTOP) | ve_task::signals::bit(SIGTERM);
        sigprocmask(&registry, &task, How::SetMask, requested).unwrap();
        let blocked = {
            let sh = task.sighand.siglock.lock().unwrap();
            sh.per_task.get(&task.pid).unwrap().blocked
        };
        assert_eq!(blocked, ve_task::signals::bit(SIGTERM));
    }

    #[test]
    fn sigsuspend_saves_mask_and_restore_brings_it_back() {
        let (registry, task) = setup();
        sigprocmask(&registry, &task, How::SetMask, ve_task::signals::bit(SIGTSTP)).unwrap();
        sigsuspend(&registry, &task, 0).unwrap();
        assert_eq!(task.state(), TaskState::Wait);
        let during = {
            let sh = task.sighand.siglock.lock().unwrap();
            sh.per_task.get(&task.pid).unwrap().blocked
        };
        assert_eq!(during, 0);
        restore_saved_mask(&registry, &task).unwrap();
        let after = {
            let sh = task.sighand.siglock.lock().unwrap();
            sh.per_task.get(&task.pid).unwrap().blocked
        };
        assert_eq!(after, ve_task::signals::bit(SIGTSTP));
    }

    #[test]
    fn sigaltstack_rejects_change_while_onstack() {
        let (registry, task) = setup();
        let stack = ve_task::signals::AltStack { sp: 0x1000, size: 0x2000, disabled: false, onstack: true };
        sigaltstack(&registry, &task, Some(stack)).unwrap();
        let err = sigaltstack(
            &registry,
            &task,
            Some(ve_task::signals::AltStack { sp: 0x5000, size: 0x2000, disabled: false, onstack: false }),
        );
        assert!(matches!(err, Err(Error::InvalidArgument)));
    }

    #[test]
    fn getcontext_setcontext_round_trip() {
        let (registry, task) = setup();
        let mut regs = ve_task::registers::RegisterImage::default();
        regs.ic = 0x42;
        task.set_registers(regs);
        sigprocmask(&registry, &task, How::SetMask, ve_task::signals::bit(SIGTERM)).unwrap();
        let ctx = getcontext(&registry, &task).unwrap();
        assert_eq!(ctx.registers.ic, 0x42);
        assert_eq!(ctx.blocked, ve_task::signals::bit(SIGTERM));

        let mut ctx2 = ctx;
        ctx2.registers.ic = 0x99;
        ctx2.blocked = 0;
        setcontext(&registry, &task, ctx2).unwrap();
        assert_eq!(task.registers().ic, 0x99);
        let blocked = {
            let sh = task.sighand.siglock.lock().unwrap();
            sh.per_task.get(&task.pid).unwrap().blocked
        };
        assert_eq!(blocked, 0);
    }
}
