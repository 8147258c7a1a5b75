//! Controller channel
//!
//! The session talks to its supervising controller through [`Channel`]:
//! one command in, one reply out, descriptors attached to commands and a
//! process credential attached to the handshake reply.
//!
//! - [`unix::UnixChannel`]: `SOCK_SEQPACKET` socket, descriptors as
//!   `SCM_RIGHTS`, the handshake record in the reply body and, when the
//!   kernel permits it, as `SCM_CREDENTIALS`
//! - [`memory::MemoryChannel`]: in-process pair for embedding and tests

pub mod memory;
pub mod unix;

use crate::config::types::{Cmd, ProcessCredential, Reply, Result};
use std::os::fd::OwnedFd;

/// Both flows of an exec cycle use the channel at once (one receiving,
/// one sending), so implementations must be `Sync`.
pub trait Channel: Sync {
    /// Send one reply, optionally carrying a process credential.
    fn send_reply(&self, reply: &Reply, cred: Option<&ProcessCredential>) -> Result<()>;

    /// Send a transport-error reply.
    fn send_error_reply(&self, message: &str) -> Result<()> {
        log::warn!("replying with error: {}", message);
        self.send_reply(&Reply::error(message), None)
    }

    /// Block for the next command and the descriptors attached to it. A
    /// record that does not decode is `DaemonError::Request`.
    fn recv_cmd(&self) -> Result<(Cmd, Vec<OwnedFd>)>;
}
