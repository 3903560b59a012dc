//! Maps a decoded `Command` onto the corresponding ve-dma/ve-mem/ve-task/
//! ve-signal call and packages the result as a negated-errno `Reply`, per
//! the external-interface section's ack convention.

use std::sync::Arc;
use std::time::Duration;

use ve_proto::command::{Command, SigActionCmd, SigAltStackCmd, SigProcMaskCmd, SigSuspendCmd, SetContextCmd, SignalSendCmd, DmaRequestCmd};
use ve_proto::reply::Reply;
use ve_signal::deliver::{do_signal_ve, DeliveryOutcome, RestartState};
use ve_signal::generate::{send_ve_signal, PostRelease, SendSignalRequest};
use ve_signal::ops::{self, How};
use ve_task::registers::RegisterImage;
use ve_task::signals::{AltStack, Handler, SaFlags, SigAction, SigInfo, SEND_SIG_PRIV};
use ve_task::task::VeTask;

use crate::config::Config;
use crate::service::Service;

/// How long a blocking `sigsuspend` command waits for a signal to be
/// delivered before giving the caller back control. There is no real
/// per-core scheduler here to wake it earlier than that.
const SIGSUSPEND_TIMEOUT: Duration = Duration::from_secs(30);

pub fn dispatch(service: &Service, config: &Config, caller_pid: i32, command: Command) -> Reply {
    match command {
        Command::DmaRequest(cmd) => dma_request(service, cmd),
        Command::SignalSend(cmd) => signal_send(service, config, caller_pid, cmd),
        Command::SigAction(cmd) => sigaction(service, config, caller_pid, cmd),
        Command::SigProcMask(cmd) => sigprocmask(service, config, caller_pid, cmd),
        Command::SigPending => sigpending(service, config, caller_pid),
        Command::SigSuspend(cmd) => sigsuspend(service, config, caller_pid, cmd),
        Command::SigAltStack(cmd) => sigaltstack(service, config, caller_pid, cmd),
        Command::GetContext => getcontext(service, config, caller_pid),
        Command::SetContext(cmd) => setcontext(service, config, caller_pid, cmd),
    }
}

fn dma_request(service: &Service, cmd: DmaRequestCmd) -> Reply {
    let (Ok(src), Ok(dst)) = (cmd.src.to_endpoint(), cmd.dst.to_endpoint()) else {
        return Reply::err(libc::EINVAL);
    };
    match service.engine.post(src, dst, cmd.len, &*service.translator) {
        Ok(req) => match req.wait() {
            ve_dma::RequestStatus::Ok => Reply::ok(0),
            ve_dma::RequestStatus::Error => Reply::err(libc::EFAULT),
            ve_dma::RequestStatus::Canceled => Reply::err(libc::ECANCELED),
            ve_dma::RequestStatus::NotFinished => Reply::err(libc::EAGAIN),
        },
        Err(e) => Reply::err(e.to_errno()),
    }
}

fn signal_send(service: &Service, config: &Config, caller_pid: i32, cmd: SignalSendCmd) -> Reply {
    service.ensure_task(caller_pid, config);
    let Some(target) = service.registry.lookup(cmd.target_pid) else {
        return Reply::err(libc::ESRCH);
    };
    let siginfo = if cmd.send_pid == SEND_SIG_PRIV {
        None
    } else {
        Some(SigInfo { signo: cmd.signum, code: cmd.code, pid: cmd.send_pid, uid: cmd.send_uid, si_addr: 0 })
    };
    let req = SendSignalRequest {
        signum: cmd.signum,
        siginfo,
        from_exception: cmd.from_exception,
        is_current_task: cmd.target_pid == caller_pid,
        _marker: std::marker::PhantomData,
    };
    match send_ve_signal(&service.registry, target.tgid, cmd.target_pid, req) {
        Ok(post_release) => {
            if post_release == PostRelease::Unblock {
                deliver_pending(service, &target);
            }
            Reply::ok(0)
        }
        Err(e) => Reply::err(e.to_errno()),
    }
}

/// Runs signal delivery right away instead of waiting for a scheduler's
/// next entry into the task, since this service has no separate VE core
/// scheduler of its own to drive it later.
fn deliver_pending(service: &Service, task: &Arc<VeTask>) {
    let outcome = do_signal_ve(
        &service.registry,
        task,
        service.mem.as_ref(),
        &[],
        RestartState::None,
        service.proc_status.as_ref(),
    );
    match outcome {
        Ok(DeliveryOutcome::CoreDump { kill_signal }) => {
            log::info!("pid={} entering core dump (signal {kill_signal})", task.pid);
            spawn_coredump(service, task.clone());
        }
        Ok(outcome) => log::trace!("delivery outcome for pid={}: {outcome:?}", task.pid),
        Err(e) => log::warn!("signal delivery failed for pid={}: {e}", task.pid),
    }
}

/// Core-dump orchestration involves a helper fork/exec and an `SCM_RIGHTS`
/// round trip, so it runs off the connection-handling thread entirely.
fn spawn_coredump(service: &Service, task: Arc<VeTask>) {
    let registry = service.registry.clone();
    let proc_status = service.proc_status.clone();
    let helper_launcher = service.helper_launcher.clone();
    let elf_dumper = service.elf_dumper.clone();
    let core_dump_config = service.core_dump_config.clone();
    std::thread::spawn(move || {
        let rlimit_core = task.sighand.siglock.lock().unwrap().rlimit_core;
        if let Err(e) = ve_signal::coredump::run_coredump(
            &registry,
            &task,
            rlimit_core,
            &core_dump_config,
            proc_status.as_ref(),
            helper_launcher.as_ref(),
            elf_dumper.as_ref(),
        ) {
            log::warn!("coredump orchestration failed for pid={}: {e}", task.pid);
        }
    });
}

fn sigaction(service: &Service, config: &Config, caller_pid: i32, cmd: SigActionCmd) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    let new = cmd.install.then(|| SigAction {
        handler: match cmd.handler_kind {
            0 => Handler::Default,
            1 => Handler::Ignore,
            _ => Handler::Address(cmd.handler_addr),
        },
        flags: SaFlags {
            onstack: cmd.onstack,
            restart: cmd.restart,
            nodefer: cmd.nodefer,
            resethand: cmd.resethand,
        },
        mask: cmd.mask,
    });
    match ops::sigaction(&service.registry, &task, cmd.signum, new) {
        Ok(_old) => Reply::ok(0),
        Err(e) => Reply::err(e.to_errno()),
    }
}

fn sigprocmask(service: &Service, config: &Config, caller_pid: i32, cmd: SigProcMaskCmd) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    let how = match cmd.how {
        0 => How::Block,
        1 => How::Unblock,
        _ => How::SetMask,
    };
    match ops::sigprocmask(&service.registry, &task, how, cmd.mask) {
        // The old mask is handed back in the reply slot itself rather than
        // a separate out-param, since this wire only carries one int64.
        Ok(old) => Reply(old as i64),
        Err(e) => Reply::err(e.to_errno()),
    }
}

fn sigpending(service: &Service, config: &Config, caller_pid: i32) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    match ops::sigpending(&service.registry, &task) {
        Ok(mask) => Reply(mask as i64),
        Err(e) => Reply::err(e.to_errno()),
    }
}

fn sigsuspend(service: &Service, config: &Config, caller_pid: i32, cmd: SigSuspendCmd) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    if let Err(e) = ops::sigsuspend(&service.registry, &task, cmd.mask) {
        return Reply::err(e.to_errno());
    }
    ops::wait_for_wake(&task, SIGSUSPEND_TIMEOUT, || false);
    let _ = ops::restore_saved_mask(&service.registry, &task);
    // `sigsuspend(2)` never returns a success: either a signal was
    // delivered (EINTR) or the caller gave up waiting.
    Reply::err(libc::EINTR)
}

fn sigaltstack(service: &Service, config: &Config, caller_pid: i32, cmd: SigAltStackCmd) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    let new = cmd.install.then(|| AltStack {
        sp: cmd.sp,
        size: cmd.size,
        disabled: cmd.disabled,
        onstack: cmd.onstack,
    });
    match ops::sigaltstack(&service.registry, &task, new) {
        Ok(_old) => Reply::ok(0),
        Err(e) => Reply::err(e.to_errno()),
    }
}

fn getcontext(service: &Service, config: &Config, caller_pid: i32) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    match ops::getcontext(&service.registry, &task) {
        // The register image itself is consumed directly from the task by
        // the caller's own scheduling path; this command only confirms the
        // blocked mask is in sync before that read.
        Ok(_ctx) => Reply::ok(0),
        Err(e) => Reply::err(e.to_errno()),
    }
}

fn setcontext(service: &Service, config: &Config, caller_pid: i32, cmd: SetContextCmd) -> Reply {
    let task = service.ensure_task(caller_pid, config);
    let registers = RegisterImage { ic: cmd.ic, sr: cmd.sr };
    let ctx = ops::Context { registers, blocked: cmd.blocked };
    match ops::setcontext(&service.registry, &task, ctx) {
        Ok(()) => Reply::ok(0),
        Err(e) => Reply::err(e.to_errno()),
    }
}
