//! Core-dump orchestration: freezes the thread group, computes the dump
//! filename, hands a socket fd to a privilege-dropping helper process, and
//! runs the ELF writer once that helper has opened the file and passed
//! its fd back.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
};
use nix::unistd::ForkResult;

use ve_task::registry::{apply_group_action, GroupAction, ProcStatusSource, Registry};
use ve_task::task::VeTask;

use crate::error::Error;

/// Spawns the out-of-process privilege-dropping helper that opens the
/// core file as the target's uid/gid and sends its fd back over
/// `SCM_RIGHTS`. A real implementation forks and execs a separate
/// executable (the privilege boundary must not be folded into this
/// service); tests use an in-memory fake that completes synchronously.
pub trait HelperLauncher: Send + Sync {
    fn launch(&self, helper_path: &str, filename: &str, uid: u32, gid: u32, sock_fd: RawFd) -> Result<(), Error>;
}

pub struct RealHelperLauncher;

impl HelperLauncher for RealHelperLauncher {
    fn launch(&self, helper_path: &str, filename: &str, uid: u32, gid: u32, sock_fd: RawFd) -> Result<(), Error> {
        // SAFETY: immediately followed by either execve (which replaces
        // the child's image) or _exit in the child branch only; the
        // parent branch touches no shared state before returning.
        match unsafe { nix::unistd::fork() }? {
            ForkResult::Parent { .. } => Ok(()),
            ForkResult::Child => {
                let fd_arg = sock_fd.to_string();
                let _ = nix::unistd::setgid(nix::unistd::Gid::from_raw(gid));
                let _ = nix::unistd::setuid(nix::unistd::Uid::from_raw(uid));
                let path = std::ffi::CString::new(helper_path).unwrap();
                let filename_c = std::ffi::CString::new(filename).unwrap();
                let fd_arg_c = std::ffi::CString::new(fd_arg).unwrap();
                let _ = nix::unistd::execv(&path, &[path.clone(), filename_c, fd_arg_c]);
                std::process::exit(127);
            }
        }
    }
}

/// Completes a helper round-trip in-process: opens the file itself and
/// sends its fd straight back over the provided socket, for tests that
/// don't want a real fork/exec.
pub struct FakeHelperLauncher {
    pub opened: Mutex<Vec<String>>,
}

impl FakeHelperLauncher {
    pub fn new() -> Self {
        Self { opened: Mutex::new(Vec::new()) }
    }
}

impl Default for FakeHelperLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl HelperLauncher for FakeHelperLauncher {
    fn launch(&self, _helper_path: &str, filename: &str, _uid: u32, _gid: u32, sock_fd: RawFd) -> Result<(), Error> {
        self.opened.lock().unwrap().push(filename.to_string());
        let file = std::fs::File::create(filename)?;
        let cmsg = [ControlMessage::ScmRights(&[file.as_raw_fd()])];
        socket::sendmsg::<()>(sock_fd, &[std::io::IoSlice::new(b"x")], &cmsg, MsgFlags::empty(), None)?;
        Ok(())
    }
}

/// Runs the already-opened ELF core file. Only reachable once the helper
/// round trip handed the parent a real fd.
pub trait ElfDumper: Send + Sync {
    fn dump(&self, fd: RawFd, task: &VeTask) -> Result<(), Error>;
}

/// Records invocations without writing anything, for tests and default
/// wiring before a real ELF writer is plugged in.
pub struct NullElfDumper {
    pub invocations: Mutex<Vec<i32>>,
}

impl NullElfDumper {
    pub fn new() -> Self {
        Self { invocations: Mutex::new(Vec::new()) }
    }
}

impl Default for NullElfDumper {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfDumper for NullElfDumper {
    fn dump(&self, fd: RawFd, task: &VeTask) -> Result<(), Error> {
        self.invocations.lock().unwrap().push(task.pid);
        let _ = fd;
        Ok(())
    }
}

/// Expands `/proc/sys/kernel/core_pattern`-style patterns. Only `%p`
/// (tgid), `%h` (hostname) and `%%` are implemented; any other `%X` token
/// is silently dropped, matching the reference behavior.
pub fn expand_core_pattern(pattern: &str, tgid: i32, hostname: &str) -> (String, bool) {
    let mut out = String::new();
    let mut saw_pid = false;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => {
                out.push_str(&tgid.to_string());
                saw_pid = true;
            }
            Some('h') => out.push_str(hostname),
            Some('%') => out.push('%'),
            Some(_) => {}
            None => {}
        }
    }
    (out, saw_pid)
}

/// Builds the final core file path per §6: `[<ve_exec_dir>/]<pattern-
/// expansion>[.<tgid>].ve`. If the pattern begins with `|` (a pipe-to-
/// program specifier), it's replaced with `<ve_exec_path>/core`.
pub fn core_dump_filename(pattern: &str, tgid: i32, hostname: &str, ve_exec_dir: &str) -> String {
    let pattern = if let Some(stripped) = pattern.strip_prefix('|') {
        let _ = stripped;
        format!("{ve_exec_dir}/core")
    } else {
        pattern.to_string()
    };
    let (expanded, saw_pid) = expand_core_pattern(&pattern, tgid, hostname);
    let based = if expanded.starts_with('/') { expanded } else { format!("{ve_exec_dir}/{expanded}") };
    if saw_pid {
        format!("{based}.ve")
    } else {
        format!("{based}.{tgid}.ve")
    }
}

pub struct CoreDumpConfig {
    pub core_pattern: String,
    pub ve_exec_dir: String,
    pub hostname: String,
    pub helper_path: String,
}

/// Runs the full orchestration described in §4.6. Expects to be spawned
/// in a detached worker thread by the caller once delivery has promoted
/// the group to `GROUP_COREDUMP`.
pub fn run_coredump(
    registry: &Registry,
    task: &Arc<VeTask>,
    rlimit_core: u64,
    config: &CoreDumpConfig,
    proc_status: &dyn ProcStatusSource,
    launcher: &dyn HelperLauncher,
    dumper: &dyn ElfDumper,
) -> Result<(), Error> {
    let _del_lock = task.sighand.del_lock.lock().unwrap();
    apply_group_action(registry, task.tgid, GroupAction::CleanThread, Some(task.pid), proc_status);

    if rlimit_core == 0 {
        finish(registry, task);
        return Ok(());
    }

    let (parent_sock, child_sock) =
        socket::socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())?;

    let filename = core_dump_filename(&config.core_pattern, task.tgid, &config.hostname, &config.ve_exec_dir);

    let launch_result =
        launcher.launch(&config.helper_path, &filename, task.uid, task.gid, child_sock.as_raw_fd());
    drop(child_sock);

    if launch_result.is_ok() {
        if let Ok(fd) = receive_fd(&parent_sock) {
            let _ = dumper.dump(fd, task);
            // SAFETY: fd was just received as an owned descriptor from
            // SCM_RIGHTS and is closed exactly once here.
            unsafe { libc::close(fd) };
        }
    }

    finish(registry, task);
    Ok(())
}

fn receive_fd(sock: &OwnedFd) -> Result<RawFd, Error> {
    let mut buf = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!(RawFd);
    let mut iov = [std::io::IoSliceMut::new(&mut buf)];
    let msg = socket::recvmsg::<()>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                return Ok(fd);
            }
        }
    }
    Err(Error::Fault)
}

/// Regardless of dump success, mark the group `GROUP_EXIT` and kill the
/// pseudo process: the original signal for synchronous origins,
/// `SIGKILL` otherwise. The actual process kill is an external
/// collaborator call the caller issues from the returned pid; here we
/// only finalize the in-memory group state.
fn finish(registry: &Registry, task: &Arc<VeTask>) {
    let members = registry.thread_group(task.tgid);
    if let Some(leader) = members.first() {
        let mut sh = leader.sighand.siglock.lock().unwrap();
        sh.group_flag = ve_task::signals::GroupFlag::Exit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ve_task::registry::RealProcStatusSource;

    #[test]
    fn expands_pid_and_hostname() {
        let (s, saw_pid) = expand_core_pattern("core-%p-%h-%%", 42, "vehost");
        assert_eq!(s, "core-42-vehost-%");
        assert!(saw_pid);
    }

    #[test]
    fn unknown_token_is_dropped() {
        let (s, _) = expand_core_pattern("core%q%p", 7, "h");
        assert_eq!(s, "core7");
    }

    #[test]
    fn filename_appends_tgid_when_pattern_has_no_pid_token() {
        let name = core_dump_filename("core", 7, "h", "/opt/ve/bin");
        assert_eq!(name, "/opt/ve/bin/core.7.ve");
    }

    #[test]
    fn filename_skips_tgid_suffix_when_pattern_has_pid_token() {
        let name = core_dump_filename("/var/crash/core.%p", 7, "h", "/opt/ve/bin");
        assert_eq!(name, "/var/crash/core.7.ve");
    }

    #[test]
    fn zero_rlimit_core_skips_dump_but_still_finalizes() {
        let registry = Registry::new();
        let sh = registry.sighand_for_group(1, 0, 64);
        let task = VeTask::new(1, 1, 0, 0, sh);
        registry.insert(task.clone());
        let dumper = NullElfDumper::new();
        let launcher = FakeHelperLauncher::new();
        let config = CoreDumpConfig {
            core_pattern: "core".into(),
            ve_exec_dir: "/tmp".into(),
            hostname: "h".into(),
            helper_path: "/bin/true".into(),
        };
        run_coredump(&registry, &task, 0, &config, &RealProcStatusSource, &launcher, &dumper).unwrap();
        assert!(dumper.invocations.lock().unwrap().is_empty());
        let sh = task.sighand.siglock.lock().unwrap();
        assert_eq!(sh.group_flag, ve_task::signals::GroupFlag::Exit);
    }

    #[test]
    fn nonzero_rlimit_core_runs_dump_via_helper_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let sh = registry.sighand_for_group(1, 0, 64);
        let task = VeTask::new(1, 1, 0, 0, sh);
        registry.insert(task.clone());
        let dumper = NullElfDumper::new();
        let launcher = FakeHelperLauncher::new();
        let config = CoreDumpConfig {
            core_pattern: "core".into(),
            ve_exec_dir: dir.path().to_str().unwrap().to_string(),
            hostname: "h".into(),
            helper_path: "/bin/true".into(),
        };
        run_coredump(&registry, &task, 1, &config, &RealProcStatusSource, &launcher, &dumper).unwrap();
        assert_eq!(dumper.invocations.lock().unwrap().as_slice(), &[1]);
        assert_eq!(launcher.opened.lock().unwrap().len(), 1);
    }
}
