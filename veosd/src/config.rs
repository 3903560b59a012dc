//! CLI configuration, mirroring the external CLI wrapper's `-N/--node`
//! flag family described in §6 but for the service side: node number,
//! driver device path, socket path, core-dump helper path, log
//! verbosity.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// VE node number this instance serves, e.g. `/dev/veslot<N>`.
    #[arg(short = 'N', long, default_value_t = 0)]
    pub node: u32,

    /// VE driver character device. Defaults to `/dev/veslot<node>`.
    #[arg(long)]
    pub driver_device: Option<String>,

    /// UNIX socket the pseudo-process protocol is served on. Defaults to
    /// `<localstatedir>/veos<node>.sock`.
    #[arg(long)]
    pub socket: Option<String>,

    /// Path to the privilege-dropping core-dump helper executable.
    #[arg(long, default_value = "/opt/nec/ve/libexec/ve-coredump-helper")]
    pub core_helper: String,

    /// `/proc/sys/kernel/core_pattern`-style path; read once at startup.
    #[arg(long, default_value = "/proc/sys/kernel/core_pattern")]
    pub core_pattern_file: String,

    /// Soft `RLIMIT_CORE` applied to every task's thread group.
    #[arg(long, default_value_t = u64::MAX)]
    pub rlimit_core: u64,

    /// Soft `RLIMIT_SIGPENDING` applied to every task's thread group.
    #[arg(long, default_value_t = 1024)]
    pub rlimit_sigpending: u64,

    /// Increase log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity; repeatable (`-q`, `-qq`).
    #[arg(short = 'q', long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Config {
    pub fn driver_device_path(&self) -> String {
        self.driver_device.clone().unwrap_or_else(|| format!("/dev/veslot{}", self.node))
    }

    pub fn socket_path(&self) -> String {
        self.socket.clone().unwrap_or_else(|| format!("/var/lib/veos/veos{}.sock", self.node))
    }

    /// Driver sysfs attribute reporting whitespace-separated dead PIDs,
    /// polled with `POLLPRI` by the polling thread (§4.7/§6).
    pub fn dead_pid_attr_path(&self) -> String {
        format!("/sys/class/ve/veslot{}/dead_pids", self.node)
    }

    /// Maps `-v`/`-q` onto an `env_logger` filter level, with `warn` as
    /// the baseline (matching `pevub`'s `release_max_level_warn` default
    /// for an unattended service).
    pub fn log_level(&self) -> log::LevelFilter {
        use log::LevelFilter::*;
        let base = 2i16; // Warn
        let level = base + self.verbose as i16 - self.quiet as i16;
        match level.clamp(0, 4) {
            0 => Off,
            1 => Error,
            2 => Warn,
            3 => Info,
            4 => Debug,
            _ => Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_derive_from_node() {
        let cfg = Config::parse_from(["veosd", "--node", "3"]);
        assert_eq!(cfg.driver_device_path(), "/dev/veslot3");
        assert_eq!(cfg.socket_path(), "/var/lib/veos/veos3.sock");
    }

    #[test]
    fn explicit_paths_override_derived_ones() {
        let cfg = Config::parse_from(["veosd", "--socket", "/tmp/x.sock", "--driver-device", "/dev/foo"]);
        assert_eq!(cfg.driver_device_path(), "/dev/foo");
        assert_eq!(cfg.socket_path(), "/tmp/x.sock");
    }

    #[test]
    fn verbosity_shifts_default_warn_level() {
        let cfg = Config::parse_from(["veosd"]);
        assert_eq!(cfg.log_level(), log::LevelFilter::Warn);
        let cfg = Config::parse_from(["veosd", "-vv"]);
        assert_eq!(cfg.log_level(), log::LevelFilter::Debug);
        let cfg = Config::parse_from(["veosd", "-q"]);
        assert_eq!(cfg.log_level(), log::LevelFilter::Error);
    }
}
