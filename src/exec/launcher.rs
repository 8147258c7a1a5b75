//! Process launch with a pre-exec rendezvous.
//!
//! [`ForkLauncher`] forks a child that parks on a pipe until the parent's
//! synchronization callback has returned. The child setup sequence is fixed:
//!
//! 1. setpgid(0, 0) so the sandbox is its own process group
//! 2. block on the sync pipe until the parent says go
//! 3. install inherited descriptors as fds `0..n`
//! 4. apply rlimits
//! 5. setgroups([]) then setresgid then setresuid
//! 6. chdir into the working directory
//! 7. prctl(PR_SET_NO_NEW_PRIVS, 1)
//! 8. execve, or fexecve for an exec-by-descriptor target
//!
//! Everything the child touches is built before fork; between fork and
//! exec only raw syscalls run. A failing step writes `(stage, errno)` to a
//! close-on-exec error pipe and exits with 127, so the parent reads EOF on
//! that pipe exactly when exec succeeded.

use crate::config::types::{DaemonError, Result};
use crate::kernel::credentials::Credential;
use crate::kernel::rlimit::PreparedLimit;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, pipe2, setpgid, ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Everything needed to start one sandboxed program.
#[derive(Clone, Debug)]
pub struct LaunchSpec<'a> {
    pub argv: &'a [String],
    pub env: &'a [String],
    /// Executed with fexecve instead of argv[0]
    pub exec_target: Option<RawFd>,
    /// Installed as fds `0..n` in the child
    pub descriptors: &'a [RawFd],
    pub rlimits: &'a [PreparedLimit],
    pub workdir: &'a Path,
    pub credential: Option<Credential>,
    pub no_new_privs: bool,
}

/// A launch that did not end in a running program.
///
/// `pid` is set when a child was forked; it may still be a zombie and is
/// left for the kill listener to reap.
#[derive(Debug)]
pub struct LaunchFailure {
    pub pid: Option<Pid>,
    pub error: DaemonError,
}

impl LaunchFailure {
    pub fn new(pid: Option<Pid>, error: DaemonError) -> Self {
        Self { pid, error }
    }

    fn before_fork(error: DaemonError) -> Self {
        Self { pid: None, error }
    }
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (child {})", self.error, pid),
            None => write!(f, "{}", self.error),
        }
    }
}

pub trait Launcher: Sync {
    /// Create the child, run `on_child_created` while it is paused before
    /// exec, then let it exec. An error from the callback must stop the
    /// child from ever running the target.
    fn launch(
        &self,
        spec: &LaunchSpec<'_>,
        on_child_created: &mut dyn FnMut(Pid) -> Result<()>,
    ) -> std::result::Result<Pid, LaunchFailure>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
enum SetupStage {
    Sync = 1,
    ProcessGroup,
    Descriptors,
    RLimit,
    SetGroups,
    SetGid,
    SetUid,
    WorkDir,
    NoNewPrivs,
    Exec,
}

impl SetupStage {
    fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => SetupStage::Sync,
            2 => SetupStage::ProcessGroup,
            3 => SetupStage::Descriptors,
            4 => SetupStage::RLimit,
            5 => SetupStage::SetGroups,
            6 => SetupStage::SetGid,
            7 => SetupStage::SetUid,
            8 => SetupStage::WorkDir,
            9 => SetupStage::NoNewPrivs,
            10 => SetupStage::Exec,
            _ => return None,
        })
    }

    fn describe(self) -> &'static str {
        match self {
            SetupStage::Sync => "sync",
            SetupStage::ProcessGroup => "setpgid",
            SetupStage::Descriptors => "dup2",
            SetupStage::RLimit => "setrlimit",
            SetupStage::SetGroups => "setgroups",
            SetupStage::SetGid => "setresgid",
            SetupStage::SetUid => "setresuid",
            SetupStage::WorkDir => "chdir",
            SetupStage::NoNewPrivs => "prctl(PR_SET_NO_NEW_PRIVS)",
            SetupStage::Exec => "execve",
        }
    }
}

/// Size of one `(stage, errno)` report on the error pipe.
const REPORT_LEN: usize = 8;

fn cstring(what: &str, value: &[u8]) -> Result<CString> {
    CString::new(value)
        .map_err(|_| DaemonError::Launch(format!("execve: {} contains a NUL byte", what)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Child-side view of a [`LaunchSpec`], allocated before fork.
struct ChildPlan<'a> {
    path: CString,
    _argv: Vec<CString>,
    _env: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    env_ptrs: Vec<*const libc::c_char>,
    workdir: CString,
    exec_target: Option<RawFd>,
    descriptors: &'a [RawFd],
    staged: Vec<RawFd>,
    rlimits: &'a [PreparedLimit],
    credential: Option<Credential>,
    no_new_privs: bool,
}

impl<'a> ChildPlan<'a> {
    fn build(spec: &LaunchSpec<'a>) -> Result<Self> {
        let Some(first) = spec.argv.first() else {
            return Err(DaemonError::Launch("execve: empty argv".to_string()));
        };
        let path = cstring("argv[0]", first.as_bytes())?;
        let argv = spec
            .argv
            .iter()
            .map(|a| cstring("argv", a.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let env = spec
            .env
            .iter()
            .map(|e| cstring("env", e.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let workdir = cstring("workdir", spec.workdir.as_os_str().as_bytes())?;

        Ok(Self {
            path,
            argv_ptrs: null_terminated(&argv),
            env_ptrs: null_terminated(&env),
            _argv: argv,
            _env: env,
            workdir,
            exec_target: spec.exec_target,
            descriptors: spec.descriptors,
            staged: vec![-1; spec.descriptors.len()],
            rlimits: spec.rlimits,
            credential: spec.credential,
            no_new_privs: spec.no_new_privs,
        })
    }

    /// Runs in the forked child. Never returns.
    ///
    /// # Safety
    /// Must only be called in a freshly forked child. Only async-signal-safe
    /// calls are made and nothing is allocated.
    unsafe fn run(&mut self, sync_r: RawFd, sync_w: RawFd, err_r: RawFd, err_w: RawFd) -> ! {
        libc::close(sync_w);
        libc::close(err_r);

        if libc::setpgid(0, 0) != 0 {
            fail(err_w, SetupStage::ProcessGroup);
        }

        let mut go = 0u8;
        loop {
            let n = libc::read(sync_r, (&mut go as *mut u8).cast(), 1);
            if n == 1 {
                break;
            }
            if n < 0 && last_errno() == libc::EINTR {
                continue;
            }
            // Parent vetoed the launch or went away.
            fail(err_w, SetupStage::Sync);
        }
        libc::close(sync_r);

        // Move everything we still need above the target range first so the
        // dup2 pass below cannot clobber it.
        let floor = self.descriptors.len().max(3) as libc::c_int;
        let err_w = libc::fcntl(err_w, libc::F_DUPFD_CLOEXEC, floor);
        if err_w < 0 {
            libc::_exit(127);
        }
        let mut exec_target = -1;
        if let Some(target) = self.exec_target {
            exec_target = libc::fcntl(target, libc::F_DUPFD_CLOEXEC, floor);
            if exec_target < 0 {
                fail(err_w, SetupStage::Descriptors);
            }
        }
        for (slot, &fd) in self.staged.iter_mut().zip(self.descriptors) {
            *slot = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor);
            if *slot < 0 {
                fail(err_w, SetupStage::Descriptors);
            }
        }
        for (target, &staged) in self.staged.iter().enumerate() {
            if libc::dup2(staged, target as libc::c_int) < 0 {
                fail(err_w, SetupStage::Descriptors);
            }
        }
        // Standard streams not handed over by the controller are not inherited.
        for fd in self.staged.len() as libc::c_int..3 {
            libc::close(fd);
        }

        for limit in self.rlimits {
            if limit.apply().is_err() {
                fail(err_w, SetupStage::RLimit);
            }
        }

        if let Some(cred) = self.credential {
            if cred.drop_supplementary_groups
                && libc::setgroups(0, std::ptr::null()) != 0
                && last_errno() != libc::EPERM
            {
                fail(err_w, SetupStage::SetGroups);
            }
            if libc::setresgid(cred.gid, cred.gid, cred.gid) != 0 {
                fail(err_w, SetupStage::SetGid);
            }
            if libc::setresuid(cred.uid, cred.uid, cred.uid) != 0 {
                fail(err_w, SetupStage::SetUid);
            }
        }

        if libc::chdir(self.workdir.as_ptr()) != 0 {
            fail(err_w, SetupStage::WorkDir);
        }

        if self.no_new_privs && libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            fail(err_w, SetupStage::NoNewPrivs);
        }

        if exec_target >= 0 {
            libc::fexecve(exec_target, self.argv_ptrs.as_ptr(), self.env_ptrs.as_ptr());
        } else {
            libc::execve(
                self.path.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.env_ptrs.as_ptr(),
            );
        }
        fail(err_w, SetupStage::Exec)
    }
}

fn last_errno() -> libc::c_int {
    nix::errno::Errno::last() as libc::c_int
}

/// Report the failed stage to the parent and exit. Child only.
unsafe fn fail(err_w: RawFd, stage: SetupStage) -> ! {
    let errno = last_errno();
    let mut report = [0u8; REPORT_LEN];
    report[..4].copy_from_slice(&(stage as i32).to_ne_bytes());
    report[4..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(err_w, report.as_ptr().cast(), REPORT_LEN);
    libc::_exit(127)
}

fn decode_report(report: &[u8]) -> DaemonError {
    if report.len() < REPORT_LEN {
        return DaemonError::Launch(format!(
            "execve: truncated setup report ({} bytes)",
            report.len()
        ));
    }
    let stage = i32::from_ne_bytes([report[0], report[1], report[2], report[3]]);
    let errno = i32::from_ne_bytes([report[4], report[5], report[6], report[7]]);
    let what = SetupStage::from_raw(stage)
        .map(SetupStage::describe)
        .unwrap_or("setup");
    DaemonError::Launch(format!(
        "{}: {}",
        what,
        nix::errno::Errno::from_i32(errno)
    ))
}

fn cloexec_pipe(name: &str) -> Result<(OwnedFd, OwnedFd)> {
    let (r, w) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| DaemonError::Launch(format!("pipe2({}): {}", name, e)))?;
    // SAFETY: pipe2 returned two fresh descriptors owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) })
}

/// [`Launcher`] built on fork/exec.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkLauncher;

impl ForkLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for ForkLauncher {
    fn launch(
        &self,
        spec: &LaunchSpec<'_>,
        on_child_created: &mut dyn FnMut(Pid) -> Result<()>,
    ) -> std::result::Result<Pid, LaunchFailure> {
        let mut plan = ChildPlan::build(spec).map_err(LaunchFailure::before_fork)?;
        let (sync_r, sync_w) = cloexec_pipe("sync").map_err(LaunchFailure::before_fork)?;
        let (err_r, err_w) = cloexec_pipe("error").map_err(LaunchFailure::before_fork)?;

        // SAFETY: the child branch only runs ChildPlan::run, which restricts
        // itself to async-signal-safe calls and never returns.
        let child = match unsafe { fork() } {
            Err(e) => {
                return Err(LaunchFailure::before_fork(DaemonError::Launch(format!(
                    "fork: {}",
                    e
                ))))
            }
            Ok(ForkResult::Child) => unsafe {
                plan.run(
                    sync_r.as_raw_fd(),
                    sync_w.as_raw_fd(),
                    err_r.as_raw_fd(),
                    err_w.as_raw_fd(),
                )
            },
            Ok(ForkResult::Parent { child }) => child,
        };
        drop(sync_r);
        drop(err_w);
        // Same call as in the child; whichever runs first makes the group
        // exist before anyone can signal it.
        if let Err(e) = setpgid(child, child) {
            log::debug!("setpgid({}) from parent: {}", child, e);
        }
        log::debug!("Forked child {} ({})", child, spec.argv.join(" "));

        if let Err(e) = on_child_created(child) {
            // Still parked on the sync pipe; it never reaches exec.
            if let Err(kill_err) = kill(child, Signal::SIGKILL) {
                log::warn!("kill({}) after failed sync: {}", child, kill_err);
            }
            return Err(LaunchFailure::new(Some(child), e));
        }

        let mut go = File::from(sync_w);
        if let Err(e) = go.write_all(&[1]) {
            return Err(LaunchFailure::new(
                Some(child),
                DaemonError::Launch(format!("sync write to child {}: {}", child, e)),
            ));
        }
        drop(go);

        let mut report = Vec::with_capacity(REPORT_LEN);
        if let Err(e) = File::from(err_r).read_to_end(&mut report) {
            return Err(LaunchFailure::new(
                Some(child),
                DaemonError::Launch(format!("reading setup report of {}: {}", child, e)),
            ));
        }
        if !report.is_empty() {
            return Err(LaunchFailure::new(Some(child), decode_report(&report)));
        }

        log::debug!("Child {} exec'd", child);
        Ok(child)
    }
}
