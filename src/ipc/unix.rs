//! Unix `SOCK_SEQPACKET` transport.
//!
//! One JSON-encoded record per message. Descriptors travel as `SCM_RIGHTS`
//! (received with `MSG_CMSG_CLOEXEC`).
//!
//! A reply credential always rides in the JSON body under `"cred"`. It is
//! also attached as `SCM_CREDENTIALS` so the kernel translates the pid into
//! the receiver's PID namespace; a sender without `CAP_SYS_ADMIN` may not
//! name another process there, so on `EPERM` the record goes out with the
//! body copy only and `"kernel_cred": false`.

use super::Channel;
use crate::config::types::{Cmd, DaemonError, ProcessCredential, Reply, Result};
use serde_json::Value;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Largest record accepted or sent.
pub const MAX_MESSAGE: usize = 64 * 1024;
/// Most descriptors accepted on one record.
pub const MAX_FDS: usize = 16;

/// One record off the wire.
#[derive(Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
    pub cred: Option<ProcessCredential>,
}

#[derive(Debug)]
pub struct UnixChannel {
    socket: OwnedFd,
}

fn to_ipc_error(prefix: &str, err: impl std::fmt::Display) -> DaemonError {
    DaemonError::Ipc(format!("{prefix}: {err}"))
}

fn cmsg_space(bytes: usize) -> usize {
    // SAFETY: pure size computation.
    unsafe { libc::CMSG_SPACE(bytes as u32) as usize }
}

fn cmsg_len(bytes: usize) -> usize {
    // SAFETY: pure size computation.
    unsafe { libc::CMSG_LEN(bytes as u32) as usize }
}

fn send_error(err: io::Error) -> DaemonError {
    match err.raw_os_error() {
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => DaemonError::PeerClosed,
        _ => to_ipc_error("sendmsg", err),
    }
}

/// Reply JSON, with the credential copied into the body when present.
fn encode_reply(
    reply: &Reply,
    cred: Option<&ProcessCredential>,
    kernel_cred: bool,
) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(reply).map_err(|e| to_ipc_error("encode reply", e))?;
    if let (Some(cred), Value::Object(fields)) = (cred, &mut value) {
        let cred = serde_json::to_value(cred).map_err(|e| to_ipc_error("encode reply", e))?;
        fields.insert("cred".to_string(), cred);
        fields.insert("kernel_cred".to_string(), Value::Bool(kernel_cred));
    }
    serde_json::to_vec(&value).map_err(|e| to_ipc_error("encode reply", e))
}

/// Split a reply record into the reply and its body credential.
fn decode_reply(payload: &[u8]) -> Result<(Reply, Option<ProcessCredential>, bool)> {
    let mut value: Value =
        serde_json::from_slice(payload).map_err(|e| to_ipc_error("decode reply", e))?;
    let (cred, kernel_cred) = match &mut value {
        Value::Object(fields) => (
            fields.remove("cred"),
            fields
                .remove("kernel_cred")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        ),
        _ => (None, false),
    };
    let cred = cred
        .map(serde_json::from_value::<ProcessCredential>)
        .transpose()
        .map_err(|e| to_ipc_error("decode reply credential", e))?;
    let reply = serde_json::from_value(value).map_err(|e| to_ipc_error("decode reply", e))?;
    Ok((reply, cred, kernel_cred))
}

/// Control buffer with `cmsghdr` alignment.
fn control_buffer(bytes: usize) -> Vec<u64> {
    vec![0u64; (bytes + size_of::<u64>() - 1) / size_of::<u64>()]
}

impl UnixChannel {
    /// Wrap an already connected `SOCK_SEQPACKET` socket.
    pub fn from_owned(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// Adopt an inherited socket descriptor, e.g. fd 3 handed over by the
    /// controller.
    ///
    /// # Safety
    /// `fd` must be an open socket not owned by anything else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            socket: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Connected pair: `(daemon side, controller side)`.
    pub fn pair() -> Result<(Self, Self)> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: socketpair writes two descriptors into `fds` on success.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(to_ipc_error("socketpair", io::Error::last_os_error()));
        }
        // SAFETY: both descriptors were just created and are owned here.
        Ok(unsafe { (Self::from_raw_fd(fds[0]), Self::from_raw_fd(fds[1])) })
    }

    /// Ask the kernel to attach sender credentials to received records.
    /// Needed on the controller side to read the handshake credential.
    pub fn enable_passcred(&self) -> Result<()> {
        let on: libc::c_int = 1;
        // SAFETY: option value points at a live c_int of the declared size.
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                (&on as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(to_ipc_error("setsockopt(SO_PASSCRED)", io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn send_message(
        &self,
        payload: &[u8],
        fds: &[RawFd],
        cred: Option<&ProcessCredential>,
    ) -> Result<()> {
        self.transmit(payload, fds, cred).map_err(|e| match e {
            DaemonError::Io(err) => send_error(err),
            other => other,
        })
    }

    /// `sendmsg` with the size checks applied; OS errors stay raw so callers
    /// can react to `EPERM` on the credential.
    fn transmit(
        &self,
        payload: &[u8],
        fds: &[RawFd],
        cred: Option<&ProcessCredential>,
    ) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_MESSAGE {
            return Err(DaemonError::Ipc(format!(
                "message size {} outside 1..={}",
                payload.len(),
                MAX_MESSAGE
            )));
        }
        if fds.len() > MAX_FDS {
            return Err(DaemonError::Ipc(format!(
                "{} descriptors exceed the limit of {}",
                fds.len(),
                MAX_FDS
            )));
        }

        let fd_bytes = fds.len() * size_of::<RawFd>();
        let mut space = 0;
        if !fds.is_empty() {
            space += cmsg_space(fd_bytes);
        }
        if cred.is_some() {
            space += cmsg_space(size_of::<libc::ucred>());
        }
        let mut control = control_buffer(space);

        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        // SAFETY: msghdr is plain old data; every pointer set below outlives sendmsg.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if space > 0 {
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;
        }

        if space > 0 {
            // SAFETY: the control buffer holds exactly the headers written here.
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                if !fds.is_empty() {
                    (*cmsg).cmsg_level = libc::SOL_SOCKET;
                    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                    (*cmsg).cmsg_len = cmsg_len(fd_bytes) as _;
                    std::ptr::copy_nonoverlapping(
                        fds.as_ptr().cast::<u8>(),
                        libc::CMSG_DATA(cmsg),
                        fd_bytes,
                    );
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
                if let Some(cred) = cred {
                    let ucred = libc::ucred {
                        pid: cred.pid,
                        uid: cred.uid,
                        gid: cred.gid,
                    };
                    (*cmsg).cmsg_level = libc::SOL_SOCKET;
                    (*cmsg).cmsg_type = libc::SCM_CREDENTIALS;
                    (*cmsg).cmsg_len = cmsg_len(size_of::<libc::ucred>()) as _;
                    std::ptr::copy_nonoverlapping(
                        (&ucred as *const libc::ucred).cast::<u8>(),
                        libc::CMSG_DATA(cmsg),
                        size_of::<libc::ucred>(),
                    );
                }
            }
        }

        loop {
            // SAFETY: msg is fully initialized above.
            let rc = unsafe { libc::sendmsg(self.socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(DaemonError::Io(err));
        }
    }

    pub fn recv_message(&self) -> Result<Message> {
        let mut payload = vec![0u8; MAX_MESSAGE];
        let space =
            cmsg_space(MAX_FDS * size_of::<RawFd>()) + cmsg_space(size_of::<libc::ucred>());
        let mut control = control_buffer(space);

        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        // SAFETY: msghdr is plain old data; buffers outlive recvmsg.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let received = loop {
            // SAFETY: msg points at live buffers of the declared sizes.
            let rc = unsafe {
                libc::recvmsg(self.socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC)
            };
            if rc > 0 {
                break rc as usize;
            }
            if rc == 0 {
                return Err(DaemonError::PeerClosed);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECONNRESET) => return Err(DaemonError::PeerClosed),
                _ => return Err(to_ipc_error("recvmsg", err)),
            }
        };

        let mut fds = Vec::new();
        let mut cred = None;
        // SAFETY: walks headers the kernel wrote into `control`; data is
        // read unaligned and every received descriptor is wrapped exactly once.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let header = &*cmsg;
                let data = libc::CMSG_DATA(cmsg);
                let data_len = (header.cmsg_len as usize).saturating_sub(cmsg_len(0));
                if header.cmsg_level == libc::SOL_SOCKET && header.cmsg_type == libc::SCM_RIGHTS {
                    for i in 0..data_len / size_of::<RawFd>() {
                        let fd = std::ptr::read_unaligned(data.cast::<RawFd>().add(i));
                        fds.push(OwnedFd::from_raw_fd(fd));
                    }
                } else if header.cmsg_level == libc::SOL_SOCKET
                    && header.cmsg_type == libc::SCM_CREDENTIALS
                    && data_len >= size_of::<libc::ucred>()
                {
                    let ucred = std::ptr::read_unaligned(data.cast::<libc::ucred>());
                    cred = Some(ProcessCredential {
                        pid: ucred.pid,
                        uid: ucred.uid,
                        gid: ucred.gid,
                    });
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(DaemonError::Ipc(format!(
                "control data truncated ({} descriptors kept and closed)",
                fds.len()
            )));
        }
        if msg.msg_flags & libc::MSG_TRUNC != 0 {
            return Err(DaemonError::Ipc(format!(
                "message larger than {} bytes",
                MAX_MESSAGE
            )));
        }

        payload.truncate(received);
        Ok(Message { payload, fds, cred })
    }

    /// Controller side: send a command with attached descriptors.
    pub fn send_cmd(&self, cmd: &Cmd, fds: &[RawFd]) -> Result<()> {
        let payload =
            serde_json::to_vec(cmd).map_err(|e| to_ipc_error("encode command", e))?;
        self.send_message(&payload, fds, None)
    }

    /// Controller side: receive a reply and the credential attached to it.
    ///
    /// The kernel-translated credential wins when the sender attached one;
    /// otherwise the body copy is returned. Credentials the kernel adds on
    /// its own under `SO_PASSCRED` name the daemon and are ignored.
    pub fn recv_reply(&self) -> Result<(Reply, Option<ProcessCredential>)> {
        let message = self.recv_message()?;
        let (reply, body_cred, kernel_cred) = decode_reply(&message.payload)?;
        let cred = match body_cred {
            Some(body) if kernel_cred => Some(message.cred.unwrap_or(body)),
            body => body,
        };
        Ok((reply, cred))
    }
}

impl Channel for UnixChannel {
    fn send_reply(&self, reply: &Reply, cred: Option<&ProcessCredential>) -> Result<()> {
        let Some(cred) = cred else {
            return self.send_message(&encode_reply(reply, None, false)?, &[], None);
        };
        match self.transmit(&encode_reply(reply, Some(cred), true)?, &[], Some(cred)) {
            Err(DaemonError::Io(err)) if err.raw_os_error() == Some(libc::EPERM) => {
                log::debug!(
                    "SCM_CREDENTIALS for pid {} refused, credential sent in body only",
                    cred.pid
                );
                self.send_message(&encode_reply(reply, Some(cred), false)?, &[], None)
            }
            Err(DaemonError::Io(err)) => Err(send_error(err)),
            other => other,
        }
    }

    /// A record that does not decode is a request error; its descriptors
    /// are closed here.
    fn recv_cmd(&self) -> Result<(Cmd, Vec<OwnedFd>)> {
        let message = self.recv_message()?;
        let cmd = serde_json::from_slice(&message.payload)
            .map_err(|e| DaemonError::Request(format!("malformed command: {e}")))?;
        Ok((cmd, message.fds))
    }
}
