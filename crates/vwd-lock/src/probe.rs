//! Process liveness probing.
//!
//! External lock holders cannot be trusted to release the lock: a git
//! process may crash or be killed at any point. Ownership is therefore
//! re-validated at every contention point by checking that the recorded PID
//! is still running *and* still executing the originally recorded command,
//! which guards against PID reuse.

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Probe for whether a process is alive and what it is running.
///
/// A trait so tests can script holder lifetimes without spawning processes.
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this PID currently exists.
    fn is_running(&self, pid: i32) -> bool;

    /// The process's current command line, or `None` if it cannot be read
    /// (typically because the process has already exited).
    fn command_line(&self, pid: i32) -> Option<String>;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_running(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        // Signal 0 performs the permission/existence check without
        // delivering anything. EPERM still means the process exists.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    fn command_line(&self, pid: i32) -> Option<String> {
        let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
        let joined = raw
            .split(|byte| *byte == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn command_line(&self, _pid: i32) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_running() {
        let probe = SystemProbe;
        assert!(probe.is_running(std::process::id() as i32));
    }

    #[test]
    fn test_bogus_pid_is_not_running() {
        let probe = SystemProbe;
        assert!(!probe.is_running(-1));
        // PID max on Linux is bounded well below i32::MAX.
        assert!(!probe.is_running(i32::MAX));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_command_line_is_readable() {
        let probe = SystemProbe;
        let cmdline = probe.command_line(std::process::id() as i32).unwrap();
        assert!(!cmdline.is_empty());
    }
}
