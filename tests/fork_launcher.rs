//! End-to-end exec cycles with real children.
//!
//! Reaping uses `waitpid(-1)`, which would steal statuses from concurrently
//! running tests in this binary, so every test holds `SERIAL`.

use boxd::config::session::{KillScope, SessionConfig};
use boxd::config::types::{Cmd, ExecRequest, ExecResult, ExecStatus, RLimit, RLimitKind, Reply};
use boxd::exec::ForkLauncher;
use boxd::ipc::memory::{self, ControllerEnd};
use boxd::ipc::unix::UnixChannel;
use boxd::kernel::process::HostProcessControl;
use boxd::ContainerSession;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

static SERIAL: Mutex<()> = Mutex::new(());

const TIMEOUT: Duration = Duration::from_secs(20);

fn config(workdir: &Path) -> SessionConfig {
    SessionConfig {
        workdir: workdir.to_path_buf(),
        kill_scope: KillScope::ProcessGroup,
        ..SessionConfig::default()
    }
}

fn with_host_session<F>(workdir: &Path, controller: F)
where
    F: FnOnce(&ControllerEnd),
{
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let (channel, end) = memory::pair();
    let session = ContainerSession::new(
        channel,
        ForkLauncher::new(),
        HostProcessControl::new(KillScope::ProcessGroup),
        config(workdir),
    );
    thread::scope(|s| {
        let server = s.spawn(|| session.serve());
        controller(&end);
        drop(end);
        server.join().unwrap().unwrap();
    });
}

fn exec(argv: &[&str], rlimits: Vec<RLimit>) -> Cmd {
    Cmd::Exec(Some(ExecRequest {
        argv: argv.iter().map(|s| s.to_string()).collect(),
        env: vec!["PATH=/usr/bin:/bin".to_string()],
        exec_by_descriptor: false,
        rlimits,
    }))
}

fn recv(end: &ControllerEnd) -> Reply {
    end.recv_timeout(TIMEOUT).unwrap().reply
}

/// Handshake, proceed, terminal reply, teardown. Returns the terminal reply
/// and the reported child pid.
fn run_to_completion(end: &ControllerEnd, cmd: Cmd, fds: Vec<OwnedFd>) -> (Reply, i32) {
    end.send_with_fds(cmd, fds).unwrap();
    let handshake = end.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(handshake.reply, Reply::Ack);
    let pid = handshake.cred.expect("handshake carries a credential").pid;
    end.send(Cmd::Continue).unwrap();
    let terminal = recv(end);
    end.send(Cmd::Kill).unwrap();
    assert_eq!(recv(end), Reply::Ack);
    (terminal, pid)
}

fn expect_result(reply: Reply) -> ExecResult {
    match reply {
        Reply::Exec(result) => result,
        other => panic!("expected exec result, got {:?}", other),
    }
}

fn assert_gone(pid: i32) {
    assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH), "pid {} still exists", pid);
}

fn assert_no_zombies() {
    assert_eq!(
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)),
        Err(Errno::ECHILD)
    );
}

fn workdir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

#[test]
fn true_exits_normally() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        let (reply, pid) = run_to_completion(end, exec(&["/bin/true"], vec![]), vec![]);
        let result = expect_result(reply);
        assert_eq!(result.status, ExecStatus::Normal);
        assert_eq!(result.exit_code, 0);
        assert!(result.peak_memory > 0);
        assert_eq!(result.peak_memory % 1024, 0);
        assert_gone(pid);
    });
}

#[test]
fn exit_code_is_carried_through() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        let (reply, _) = run_to_completion(end, exec(&["/bin/sh", "-c", "exit 3"], vec![]), vec![]);
        let result = expect_result(reply);
        assert_eq!(result.status, ExecStatus::Normal);
        assert_eq!(result.exit_code, 3);
    });
}

#[test]
fn cpu_limit_is_time_limit_exceeded() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        let limits = vec![RLimit::new(RLimitKind::Cpu, 1, 3)];
        let (reply, _) = run_to_completion(
            end,
            exec(&["/bin/sh", "-c", "while :; do :; done"], limits),
            vec![],
        );
        let result = expect_result(reply);
        assert_eq!(result.status, ExecStatus::TimeLimitExceeded);
        assert_eq!(result.exit_code, libc::SIGXCPU);
        assert!(
            result.user_time >= Duration::from_millis(500)
                && result.user_time <= Duration::from_millis(2500),
            "user time {:?}",
            result.user_time
        );
    });
}

#[test]
fn kill_after_handshake_vetoes_and_reaps() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        end.send(exec(&["/bin/sleep", "30"], vec![])).unwrap();
        let pid = end.recv_timeout(TIMEOUT).unwrap().cred.unwrap().pid;
        end.send(Cmd::Kill).unwrap();

        assert_eq!(recv(end), Reply::error("handshake: received kill"));
        end.send(Cmd::Kill).unwrap();
        assert_eq!(recv(end), Reply::Ack);

        assert_gone(pid);
        assert_no_zombies();
    });
}

#[test]
fn kill_reaches_the_whole_process_group() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        end.send(exec(&["/bin/sh", "-c", "sleep 30 & sleep 30"], vec![]))
            .unwrap();
        assert_eq!(recv(end), Reply::Ack);
        end.send(Cmd::Continue).unwrap();
        thread::sleep(Duration::from_millis(200));
        end.send(Cmd::Kill).unwrap();

        let result = expect_result(recv(end));
        assert_eq!(result.status, ExecStatus::TimeLimitExceeded);
        assert_eq!(result.exit_code, libc::SIGKILL);
        assert_eq!(recv(end), Reply::Ack);

        assert_no_zombies();
    });
}

#[test]
fn descriptors_become_standard_streams() {
    let dir = workdir();
    let mut out = tempfile::tempfile().unwrap();
    let stdin = File::open("/dev/null").unwrap();
    let expected: PathBuf = dir.path().canonicalize().unwrap();

    with_host_session(dir.path(), |end| {
        let fds = vec![
            OwnedFd::from(stdin),
            OwnedFd::from(out.try_clone().unwrap()),
        ];
        let (reply, _) =
            run_to_completion(end, exec(&["/bin/sh", "-c", "pwd -P"], vec![]), fds);
        assert_eq!(expect_result(reply).exit_code, 0);
    });

    out.seek(SeekFrom::Start(0)).unwrap();
    let mut printed = String::new();
    out.read_to_string(&mut printed).unwrap();
    assert_eq!(printed.trim_end(), expected.to_str().unwrap());
}

#[test]
fn exec_by_descriptor_runs_the_first_fd() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        let target = File::open("/bin/true").unwrap();
        let cmd = Cmd::Exec(Some(ExecRequest {
            argv: vec!["true".to_string()],
            exec_by_descriptor: true,
            ..ExecRequest::default()
        }));
        let (reply, _) = run_to_completion(end, cmd, vec![OwnedFd::from(target)]);
        let result = expect_result(reply);
        assert_eq!(result.status, ExecStatus::Normal);
        assert_eq!(result.exit_code, 0);
    });
}

#[test]
fn missing_program_is_a_transport_error() {
    let dir = workdir();
    with_host_session(dir.path(), |end| {
        let (reply, pid) =
            run_to_completion(end, exec(&["/nonexistent/program"], vec![]), vec![]);
        match reply {
            Reply::Error { message } => {
                assert!(message.contains("execve"), "{}", message);
                assert!(message.contains("ENOENT"), "{}", message);
            }
            other => panic!("expected error reply, got {:?}", other),
        }
        assert_gone(pid);
        assert_no_zombies();
    });
}

#[test]
fn socket_controller_runs_a_full_cycle() {
    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let dir = workdir();
    let (daemon, controller) = UnixChannel::pair().unwrap();
    controller.enable_passcred().unwrap();
    let session = ContainerSession::new(
        daemon,
        ForkLauncher::new(),
        HostProcessControl::new(KillScope::ProcessGroup),
        config(dir.path()),
    );

    thread::scope(|s| {
        let server = s.spawn(|| session.serve());

        controller.send_cmd(&exec(&["/bin/true"], vec![]), &[]).unwrap();
        let (reply, cred) = controller.recv_reply().unwrap();
        assert_eq!(reply, Reply::Ack);
        let cred = cred.expect("handshake carries a credential");
        assert_eq!(cred.uid, nix::unistd::geteuid().as_raw());
        assert_eq!(cred.gid, nix::unistd::getegid().as_raw());
        assert_ne!(cred.pid, std::process::id() as i32);

        controller.send_cmd(&Cmd::Continue, &[]).unwrap();
        let result = expect_result(controller.recv_reply().unwrap().0);
        assert_eq!(result.status, ExecStatus::Normal);
        assert_eq!(result.exit_code, 0);

        controller.send_cmd(&Cmd::Kill, &[]).unwrap();
        assert_eq!(controller.recv_reply().unwrap().0, Reply::Ack);

        drop(controller);
        server.join().unwrap().unwrap();
        assert_gone(cred.pid);
    });
}
