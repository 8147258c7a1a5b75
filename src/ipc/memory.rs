//! In-process channel pair.

use super::Channel;
use crate::config::types::{Cmd, DaemonError, ProcessCredential, Reply, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::os::fd::OwnedFd;
use std::time::Duration;

/// A reply as observed by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub reply: Reply,
    pub cred: Option<ProcessCredential>,
}

/// Session side of an in-process channel.
pub struct MemoryChannel {
    commands: Receiver<(Cmd, Vec<OwnedFd>)>,
    replies: Sender<Delivered>,
}

/// Controller side of an in-process channel. Dropping it closes the
/// session's receive side.
pub struct ControllerEnd {
    commands: Sender<(Cmd, Vec<OwnedFd>)>,
    replies: Receiver<Delivered>,
}

pub fn pair() -> (MemoryChannel, ControllerEnd) {
    let (cmd_tx, cmd_rx) = unbounded();
    let (reply_tx, reply_rx) = unbounded();
    (
        MemoryChannel {
            commands: cmd_rx,
            replies: reply_tx,
        },
        ControllerEnd {
            commands: cmd_tx,
            replies: reply_rx,
        },
    )
}

impl Channel for MemoryChannel {
    fn send_reply(&self, reply: &Reply, cred: Option<&ProcessCredential>) -> Result<()> {
        self.replies
            .send(Delivered {
                reply: reply.clone(),
                cred: cred.copied(),
            })
            .map_err(|_| DaemonError::PeerClosed)
    }

    fn recv_cmd(&self) -> Result<(Cmd, Vec<OwnedFd>)> {
        self.commands.recv().map_err(|_| DaemonError::PeerClosed)
    }
}

impl ControllerEnd {
    pub fn send(&self, cmd: Cmd) -> Result<()> {
        self.send_with_fds(cmd, Vec::new())
    }

    pub fn send_with_fds(&self, cmd: Cmd, fds: Vec<OwnedFd>) -> Result<()> {
        self.commands
            .send((cmd, fds))
            .map_err(|_| DaemonError::PeerClosed)
    }

    pub fn recv(&self) -> Result<Delivered> {
        self.replies.recv().map_err(|_| DaemonError::PeerClosed)
    }

    /// Close the command side while still collecting replies.
    pub fn into_reply_receiver(self) -> Receiver<Delivered> {
        self.replies
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Delivered> {
        self.replies.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => DaemonError::Ipc(format!("no reply within {:?}", timeout)),
            RecvTimeoutError::Disconnected => DaemonError::PeerClosed,
        })
    }
}
