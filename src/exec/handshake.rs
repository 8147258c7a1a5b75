//! Pre-exec rendezvous with the controller.

use crate::config::types::{Cmd, DaemonError, ProcessCredential, Reply, Result};
use crate::ipc::Channel;
use crate::kernel::credentials::effective_ids;
use nix::unistd::Pid;

/// Report `child` to the controller and block for its verdict.
///
/// One round trip, no retry. `Kill` vetoes the launch; any other command
/// lets the child exec. Descriptors attached to the verdict are dropped.
pub fn synchronize<C: Channel + ?Sized>(channel: &C, child: Pid) -> Result<()> {
    let (uid, gid) = effective_ids();
    let cred = ProcessCredential {
        pid: child.as_raw(),
        uid,
        gid,
    };

    channel
        .send_reply(&Reply::Ack, Some(&cred))
        .map_err(|e| DaemonError::Handshake(format!("handshake: send failed: {}", e)))?;

    let (cmd, _fds) = channel
        .recv_cmd()
        .map_err(|e| DaemonError::Handshake(format!("handshake: receive failed: {}", e)))?;

    match cmd {
        Cmd::Kill => Err(DaemonError::Handshake(
            "handshake: received kill".to_string(),
        )),
        other => {
            log::debug!("handshake for {}: {}", child, other.name());
            Ok(())
        }
    }
}
