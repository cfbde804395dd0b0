//! # vwd-lock
//!
//! Cooperative mutual exclusion between the virtualization provider (the
//! "internal" role) and external command-line processes that need
//! uninterrupted access to the working directory.
//!
//! External holders never release explicitly: a terminated git process
//! cannot be relied on to send anything. Instead, every acquisition attempt
//! re-validates the recorded holder's liveness (PID running and command line
//! unchanged) and clears a stale holder it finds.

pub mod probe;

pub use probe::{ProcessProbe, SystemProbe};

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Identity of an external process holding (or requesting) the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub pid: i32,
    pub is_elevated: bool,
    /// Command line recorded at acquisition time; compared against the
    /// process's current command line to detect PID reuse.
    pub command_line: String,
}

/// Outcome of an external acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalAcquireOutcome {
    Granted,
    /// The provider itself holds the lock.
    DeniedByProvider,
    /// Another live external process holds the lock.
    DeniedByHolder(HolderInfo),
}

enum HolderState {
    Free,
    Internal,
    External(HolderInfo),
}

/// The exclusion lock.
///
/// Invariant: at most one of internal-held / external-holder is true at any
/// time. Holder state is only mutated under the internal mutex.
pub struct ExclusionLock {
    state: Mutex<HolderState>,
    probe: Arc<dyn ProcessProbe>,
}

impl Default for ExclusionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ExclusionLock {
    /// Lock backed by real OS process probing.
    pub fn new() -> Self {
        Self::with_probe(Arc::new(SystemProbe))
    }

    pub fn with_probe(probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            state: Mutex::new(HolderState::Free),
            probe,
        }
    }

    /// Attempt to take the lock for the provider.
    ///
    /// Succeeds iff no live external holder exists; a recorded holder that
    /// has exited or changed identity is implicitly released. Returns `true`
    /// when already held internally.
    pub fn try_acquire_internal(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match &*state {
            HolderState::Free => {
                *state = HolderState::Internal;
                true
            }
            HolderState::Internal => true,
            HolderState::External(holder) => {
                if self.holder_is_live(holder) {
                    debug!(pid = holder.pid, "internal acquire denied by live holder");
                    false
                } else {
                    info!(
                        pid = holder.pid,
                        command_line = %holder.command_line,
                        "clearing stale external holder"
                    );
                    *state = HolderState::Internal;
                    true
                }
            }
        }
    }

    /// Release the provider's hold.
    ///
    /// # Panics
    ///
    /// Releasing a lock the provider does not hold is a logic bug and
    /// panics.
    pub fn release_internal(&self) {
        let mut state = self.state.lock().unwrap();
        match &*state {
            HolderState::Internal => *state = HolderState::Free,
            _ => panic!("release_internal without an internal hold"),
        }
    }

    /// Attempt to take the lock for an external process.
    ///
    /// A requester whose PID matches the current holder is re-granted (the
    /// same process re-requesting is not contention). A recorded holder that
    /// is no longer live is treated as an implicit release.
    pub fn try_acquire_external(&self, requester: HolderInfo) -> ExternalAcquireOutcome {
        let mut state = self.state.lock().unwrap();
        match &*state {
            HolderState::Internal => ExternalAcquireOutcome::DeniedByProvider,
            HolderState::Free => {
                info!(pid = requester.pid, command_line = %requester.command_line, "lock granted to external process");
                *state = HolderState::External(requester);
                ExternalAcquireOutcome::Granted
            }
            HolderState::External(holder) => {
                if holder.pid == requester.pid {
                    *state = HolderState::External(requester);
                    return ExternalAcquireOutcome::Granted;
                }
                if self.holder_is_live(holder) {
                    return ExternalAcquireOutcome::DeniedByHolder(holder.clone());
                }
                info!(
                    stale_pid = holder.pid,
                    pid = requester.pid,
                    "stale external holder replaced"
                );
                *state = HolderState::External(requester);
                ExternalAcquireOutcome::Granted
            }
        }
    }

    /// Snapshot of the current external holder, if any.
    pub fn current_holder(&self) -> Option<HolderInfo> {
        match &*self.state.lock().unwrap() {
            HolderState::External(holder) => Some(holder.clone()),
            _ => None,
        }
    }

    pub fn is_held_internally(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), HolderState::Internal)
    }

    /// Liveness: the recorded PID is running and still executing the
    /// recorded command line. An unreadable command line counts as dead —
    /// the PID may have been recycled by a process we cannot identify.
    fn holder_is_live(&self, holder: &HolderInfo) -> bool {
        if !self.probe.is_running(holder.pid) {
            return false;
        }
        match self.probe.command_line(holder.pid) {
            Some(current) => current == holder.command_line,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Mutex as StdMutex;

    /// Scriptable probe: maps PID to its current command line.
    #[derive(Default)]
    struct FakeProbe {
        processes: StdMutex<HashMap<i32, String>>,
    }

    impl FakeProbe {
        fn spawn(&self, pid: i32, command_line: &str) {
            self.processes
                .lock()
                .unwrap()
                .insert(pid, command_line.to_string());
        }

        fn kill(&self, pid: i32) {
            self.processes.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_running(&self, pid: i32) -> bool {
            self.processes.lock().unwrap().contains_key(&pid)
        }

        fn command_line(&self, pid: i32) -> Option<String> {
            self.processes.lock().unwrap().get(&pid).cloned()
        }
    }

    fn holder(pid: i32, command_line: &str) -> HolderInfo {
        HolderInfo {
            pid,
            is_elevated: false,
            command_line: command_line.to_string(),
        }
    }

    fn lock_with_probe() -> (ExclusionLock, Arc<FakeProbe>) {
        let probe = Arc::new(FakeProbe::default());
        (ExclusionLock::with_probe(probe.clone()), probe)
    }

    #[test]
    fn test_internal_acquire_and_release() {
        let (lock, _) = lock_with_probe();
        assert!(lock.try_acquire_internal());
        assert!(lock.is_held_internally());
        // Reacquiring while held internally is fine.
        assert!(lock.try_acquire_internal());
        lock.release_internal();
        assert!(!lock.is_held_internally());
    }

    #[test]
    fn test_release_without_hold_panics() {
        let (lock, _) = lock_with_probe();
        let result = catch_unwind(AssertUnwindSafe(|| lock.release_internal()));
        assert!(result.is_err());
    }

    #[test]
    fn test_external_denied_while_internal_held() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git status");
        assert!(lock.try_acquire_internal());
        assert_eq!(
            lock.try_acquire_external(holder(100, "git status")),
            ExternalAcquireOutcome::DeniedByProvider
        );
    }

    #[test]
    fn test_internal_denied_by_live_external_holder() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git checkout main");
        assert_eq!(
            lock.try_acquire_external(holder(100, "git checkout main")),
            ExternalAcquireOutcome::Granted
        );
        assert!(!lock.try_acquire_internal());
        assert_eq!(lock.current_holder().unwrap().pid, 100);
    }

    #[test]
    fn test_second_external_denied_with_holder_identity() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git rebase");
        probe.spawn(200, "git status");
        lock.try_acquire_external(holder(100, "git rebase"));
        match lock.try_acquire_external(holder(200, "git status")) {
            ExternalAcquireOutcome::DeniedByHolder(current) => {
                assert_eq!(current.pid, 100);
                assert_eq!(current.command_line, "git rebase");
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn test_same_pid_regrant() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git fetch");
        lock.try_acquire_external(holder(100, "git fetch"));
        assert_eq!(
            lock.try_acquire_external(holder(100, "git fetch")),
            ExternalAcquireOutcome::Granted
        );
    }

    #[test]
    fn test_exited_holder_is_implicitly_released() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git gc");
        lock.try_acquire_external(holder(100, "git gc"));

        probe.kill(100);
        // No explicit release: the next acquisition revalidates liveness.
        assert!(lock.try_acquire_internal());
        assert!(lock.is_held_internally());
    }

    #[test]
    fn test_pid_reuse_is_not_treated_as_live_holder() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git pull");
        lock.try_acquire_external(holder(100, "git pull"));

        // Holder exits; an unrelated process gets the same PID.
        probe.kill(100);
        probe.spawn(100, "some-unrelated-daemon");

        probe.spawn(200, "git status");
        assert_eq!(
            lock.try_acquire_external(holder(200, "git status")),
            ExternalAcquireOutcome::Granted
        );
    }

    #[test]
    fn test_stale_holder_replaced_by_new_external() {
        let (lock, probe) = lock_with_probe();
        probe.spawn(100, "git gc");
        lock.try_acquire_external(holder(100, "git gc"));
        probe.kill(100);

        probe.spawn(200, "git status");
        assert_eq!(
            lock.try_acquire_external(holder(200, "git status")),
            ExternalAcquireOutcome::Granted
        );
        assert_eq!(lock.current_holder().unwrap().pid, 200);
    }
}
