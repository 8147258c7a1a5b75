//! Descriptors received alongside an exec request.
//!
//! The session owns them for one exec cycle. The child gets its own
//! duplicates, so the set is dropped as soon as the launch returns, before
//! the wait; early returns drop it as well.

use crate::config::types::{DaemonError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Controller-supplied descriptors for one exec cycle. Dropping the set
/// closes the originals.
#[derive(Debug)]
pub struct DescriptorSet {
    fds: Vec<OwnedFd>,
}

/// Descriptor view handed to the launcher.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchDescriptors {
    /// Executed with `fexecve` instead of argv[0]
    pub exec_target: Option<RawFd>,
    /// Installed as fds `0..n` in the child, in order
    pub inherited: Vec<RawFd>,
}

impl DescriptorSet {
    /// Take ownership and mark every descriptor close-on-exec so no other
    /// fork/exec in the daemon leaks them.
    pub fn prepare(fds: Vec<OwnedFd>) -> Self {
        for fd in &fds {
            if let Err(e) = set_cloexec(fd.as_raw_fd()) {
                log::warn!("Failed to mark fd {} close-on-exec: {}", fd.as_raw_fd(), e);
            }
        }
        Self { fds }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Split off the exec target when exec-by-descriptor is requested.
    pub fn launch_view(&self, exec_by_descriptor: bool) -> Result<LaunchDescriptors> {
        let raw: Vec<RawFd> = self.fds.iter().map(|fd| fd.as_raw_fd()).collect();
        if !exec_by_descriptor {
            return Ok(LaunchDescriptors {
                exec_target: None,
                inherited: raw,
            });
        }
        match raw.split_first() {
            Some((target, rest)) => Ok(LaunchDescriptors {
                exec_target: Some(*target),
                inherited: rest.to_vec(),
            }),
            None => Err(DaemonError::Request(
                "execve: expected fexecve fd".to_string(),
            )),
        }
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if !self.fds.is_empty() {
            log::debug!("Releasing {} request descriptor(s)", self.fds.len());
        }
    }
}

pub fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| DaemonError::Process(format!("fcntl(F_SETFD, {}): {}", fd, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_fd() -> OwnedFd {
        OwnedFd::from(tempfile::tempfile().unwrap())
    }

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn prepare_marks_close_on_exec() {
        let fd = temp_fd();
        let raw = fd.as_raw_fd();
        fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty())).unwrap();

        let set = DescriptorSet::prepare(vec![fd]);
        assert!(is_cloexec(raw));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn exec_by_descriptor_takes_first() {
        let set = DescriptorSet::prepare(vec![temp_fd(), temp_fd(), temp_fd()]);
        let all = set.launch_view(false).unwrap();
        let view = set.launch_view(true).unwrap();

        assert_eq!(view.exec_target, Some(all.inherited[0]));
        assert_eq!(view.inherited, all.inherited[1..].to_vec());
    }

    #[test]
    fn exec_by_descriptor_without_fds_is_request_error() {
        let set = DescriptorSet::prepare(Vec::new());
        assert!(matches!(
            set.launch_view(true),
            Err(DaemonError::Request(_))
        ));
        assert!(set.launch_view(false).unwrap().inherited.is_empty());
    }
}
