//! Waiting, killing and reaping sandbox processes.
//!
//! [`ProcessControl`] is the seam between the exec cycle and the OS so the
//! race between the kill listener and the primary wait can be exercised
//! without real children.

use crate::config::session::KillScope;
use crate::config::types::{DaemonError, Result, TerminationFacts, WaitOutcome};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::Duration;

pub trait ProcessControl: Sync {
    /// Block until `pid` terminates, collecting wait status and rusage.
    fn wait_child(&self, pid: Pid) -> Result<TerminationFacts>;

    /// Broadcast SIGKILL to the whole sandbox. `child` is the launched
    /// child when one exists.
    fn kill_sandbox(&self, child: Option<Pid>) -> Result<()>;

    /// Collect zombies without blocking until none remain. Returns how
    /// many were reaped.
    fn reap_zombies(&self) -> usize;
}

/// [`ProcessControl`] backed by `wait4`, `kill` and `waitpid(WNOHANG)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostProcessControl {
    scope: KillScope,
}

impl HostProcessControl {
    pub fn new(scope: KillScope) -> Self {
        Self { scope }
    }
}

impl ProcessControl for HostProcessControl {
    fn wait_child(&self, pid: Pid) -> Result<TerminationFacts> {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data, all-zero is a valid value.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

        loop {
            // SAFETY: both out-pointers reference live locals.
            let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
            if rc >= 0 {
                break;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(DaemonError::Wait(format!("pid {}: {}", pid, e))),
            }
        }

        Ok(facts_from_raw(status, &usage))
    }

    fn kill_sandbox(&self, child: Option<Pid>) -> Result<()> {
        crate::kernel::signal::kill_sandbox(self.scope, child)
    }

    fn reap_zombies(&self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    log::debug!("reaped {:?}", status);
                    reaped += 1;
                }
                Err(Errno::EINTR) => continue,
                // ECHILD: nothing left to collect
                Err(_) => break,
            }
        }
        reaped
    }
}

/// Decode a raw wait status plus rusage into [`TerminationFacts`].
pub fn facts_from_raw(status: libc::c_int, usage: &libc::rusage) -> TerminationFacts {
    let outcome = if libc::WIFEXITED(status) {
        WaitOutcome::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        WaitOutcome::Signaled(libc::WTERMSIG(status))
    } else {
        WaitOutcome::Other(status)
    };

    let secs = usage.ru_utime.tv_sec.max(0) as u64;
    let micros = usage.ru_utime.tv_usec.clamp(0, 999_999) as u32;

    TerminationFacts {
        outcome,
        user_time: Duration::new(secs, micros * 1000),
        max_rss_kib: usage.ru_maxrss as i64,
    }
}

/// Make the daemon inherit orphaned sandbox descendants so the reap step
/// can collect them.
pub fn become_child_subreaper() -> Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER takes a single integer argument.
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(DaemonError::Process(format!(
            "prctl(PR_SET_CHILD_SUBREAPER): {}",
            std::io::Error::last_os_error()
        )));
    }
    log::debug!("Registered as child subreaper");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(utime_sec: i64, utime_usec: i64, maxrss: i64) -> libc::rusage {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        usage.ru_utime.tv_sec = utime_sec as libc::time_t;
        usage.ru_utime.tv_usec = utime_usec as libc::suseconds_t;
        usage.ru_maxrss = maxrss as libc::c_long;
        usage
    }

    #[test]
    fn decodes_normal_exit() {
        // exit(3): status word is code << 8
        let facts = facts_from_raw(3 << 8, &usage(1, 500_000, 2048));
        assert_eq!(facts.outcome, WaitOutcome::Exited(3));
        assert!(facts.exited());
        assert_eq!(facts.user_time, Duration::from_millis(1500));
        assert_eq!(facts.max_rss_kib, 2048);
    }

    #[test]
    fn decodes_signal_termination() {
        let facts = facts_from_raw(libc::SIGXCPU, &usage(0, 0, 0));
        assert_eq!(facts.outcome, WaitOutcome::Signaled(libc::SIGXCPU));
        assert!(facts.signalled());
    }

    #[test]
    fn stopped_status_is_other() {
        // WIFSTOPPED: low byte 0x7f, stop signal in the next byte
        let raw = (libc::SIGSTOP << 8) | 0x7f;
        let facts = facts_from_raw(raw, &usage(0, 0, 0));
        assert_eq!(facts.outcome, WaitOutcome::Other(raw));
    }

    #[test]
    fn negative_usage_is_clamped() {
        let facts = facts_from_raw(0, &usage(-1, -5, 0));
        assert_eq!(facts.user_time, Duration::ZERO);
    }
}
