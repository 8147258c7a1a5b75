//! Kill broadcast for the sandbox.
//!
//! Every process of the sandbox dies together: the launched child and any
//! descendants it spawned. ESRCH is success, the target is already gone.

use crate::config::session::KillScope;
use crate::config::types::{DaemonError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Send SIGKILL to everything in `scope`. `leader` is the launched child,
/// which is the leader of its own process group.
pub fn kill_sandbox(scope: KillScope, leader: Option<Pid>) -> Result<()> {
    match scope {
        KillScope::ProcessGroup => {
            let Some(leader) = leader else {
                log::debug!("no sandbox process group to signal");
                return Ok(());
            };
            match killpg(leader, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => {
                    // The child may not have reached setpgid yet.
                    log::warn!("group SIGKILL to {} failed ({}), signalling pid", leader, e);
                    match kill(leader, Signal::SIGKILL) {
                        Ok(()) | Err(Errno::ESRCH) => Ok(()),
                        Err(e) => Err(DaemonError::Process(format!(
                            "kill({}, SIGKILL): {}",
                            leader, e
                        ))),
                    }
                }
            }
        }
        KillScope::Namespace => match kill(Pid::from_raw(-1), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(DaemonError::Process(format!("kill(-1, SIGKILL): {}", e))),
        },
    }
}

/// Human-readable name for a raw signal number, for logs.
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {}", signal),
    }
}
