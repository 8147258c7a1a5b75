//! Termination race between the kill listener and the primary wait.
//!
//! Two flows run per exec cycle and are ordered by two one-shot signals:
//!
//! - kill listener: receive one command, SIGKILL the sandbox, wait for
//!   `wait_done`, reap until no zombies remain, then fire `kill_done`
//! - primary: wait for the launched child, fire `wait_done`, reply, then
//!   wait for `kill_done`
//!
//! Reaping never starts before the primary wait has consumed the child's
//! status, and the cycle never returns while the listener is still running.
//! A one-shot signal is a zero-capacity channel whose sender is dropped:
//! the receiver's `recv` returns `Disconnected` exactly then, and dropping
//! also happens while unwinding.

use super::launcher::LaunchFailure;
use crate::config::types::{DaemonError, Result, TerminationFacts};
use crate::ipc::Channel;
use crate::kernel::process::ProcessControl;
use crossbeam_channel::{bounded, Receiver};
use nix::unistd::Pid;
use std::thread;

/// What the kill listener did before firing `kill_done`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KillOutcome {
    /// A command arrived and the sandbox was signalled
    pub commanded: bool,
    pub reaped: usize,
}

/// Run both flows for a launched (or failed) child.
///
/// `finish` receives the primary wait result, or the launch error when no
/// child ran, and sends the terminal reply. Its result is returned once the
/// kill listener has finished.
pub fn run_race<C, P, F>(
    channel: &C,
    process: &P,
    launched: std::result::Result<Pid, LaunchFailure>,
    finish: F,
) -> Result<()>
where
    C: Channel + ?Sized,
    P: ProcessControl + ?Sized,
    F: FnOnce(Result<TerminationFacts>) -> Result<()>,
{
    let (target, waitable) = match launched {
        Ok(pid) => (Some(pid), Ok(pid)),
        Err(failure) => (failure.pid, Err(failure.error)),
    };

    let (kill_done_tx, kill_done) = bounded::<()>(0);
    let (wait_done_tx, wait_done) = bounded::<()>(0);

    thread::scope(|scope| {
        let listener = scope.spawn(move || {
            let _kill_done = kill_done_tx;
            listen_for_kill(channel, process, target, &wait_done)
        });

        let facts = waitable.and_then(|pid| process.wait_child(pid));
        drop(wait_done_tx);

        let sent = finish(facts);

        let _ = kill_done.recv();
        match listener.join() {
            Ok(outcome) => log::debug!(
                "kill listener done: commanded={} reaped={}",
                outcome.commanded,
                outcome.reaped
            ),
            Err(_) => log::error!("kill listener panicked"),
        }
        sent
    })
}

fn listen_for_kill<C, P>(
    channel: &C,
    process: &P,
    target: Option<Pid>,
    wait_done: &Receiver<()>,
) -> KillOutcome
where
    C: Channel + ?Sized,
    P: ProcessControl + ?Sized,
{
    // Any command at all means terminate.
    match channel.recv_cmd() {
        Ok((cmd, _fds)) => log::debug!("kill listener: {} received", cmd.name()),
        Err(DaemonError::Request(msg)) => log::debug!("kill listener: {}, killing anyway", msg),
        Err(DaemonError::PeerClosed) => {
            log::debug!("kill listener: channel closed, nothing to kill");
            return KillOutcome::default();
        }
        Err(e) => {
            log::warn!("kill listener: receive failed: {}", e);
            return KillOutcome::default();
        }
    }

    if let Err(e) = process.kill_sandbox(target) {
        log::warn!("kill listener: {}", e);
    }

    // Only disconnects; the primary wait has returned once this does.
    let _ = wait_done.recv();

    KillOutcome {
        commanded: true,
        reaped: process.reap_zombies(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Cmd, WaitOutcome};
    use crate::ipc::memory;
    use crossbeam_channel::{unbounded, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        Killed(Option<i32>),
        WaitReturned,
        Reaped,
        Finished,
    }

    struct FakeProcess {
        events: Mutex<Vec<Event>>,
        exits: Receiver<WaitOutcome>,
        exit_tx: Sender<WaitOutcome>,
        kill_delivers: bool,
    }

    impl FakeProcess {
        fn new(kill_delivers: bool) -> Self {
            let (exit_tx, exits) = unbounded();
            Self {
                events: Mutex::new(Vec::new()),
                exits,
                exit_tx,
                kill_delivers,
            }
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn position(&self, event: Event) -> usize {
            self.events()
                .iter()
                .position(|e| *e == event)
                .unwrap_or_else(|| panic!("{:?} not recorded in {:?}", event, self.events()))
        }
    }

    impl ProcessControl for FakeProcess {
        fn wait_child(&self, _pid: Pid) -> Result<TerminationFacts> {
            let outcome = self
                .exits
                .recv()
                .map_err(|_| DaemonError::Wait("no child".to_string()))?;
            self.record(Event::WaitReturned);
            Ok(TerminationFacts {
                outcome,
                user_time: Duration::from_millis(10),
                max_rss_kib: 100,
            })
        }

        fn kill_sandbox(&self, child: Option<Pid>) -> Result<()> {
            self.record(Event::Killed(child.map(Pid::as_raw)));
            if self.kill_delivers {
                let _ = self.exit_tx.send(WaitOutcome::Signaled(libc::SIGKILL));
            }
            Ok(())
        }

        fn reap_zombies(&self) -> usize {
            self.record(Event::Reaped);
            1
        }
    }

    #[test]
    fn kill_while_running_is_reaped_after_wait() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(true);
        controller.send(Cmd::Kill).unwrap();

        let mut seen = None;
        run_race(&session, &process, Ok(Pid::from_raw(50)), |facts| {
            seen = Some(facts.unwrap().outcome);
            process.record(Event::Finished);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, Some(WaitOutcome::Signaled(libc::SIGKILL)));
        assert!(process.position(Event::Killed(Some(50))) < process.position(Event::Reaped));
        assert!(process.position(Event::WaitReturned) < process.position(Event::Reaped));
    }

    #[test]
    fn reap_waits_for_primary_wait_even_when_kill_is_first() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(false);
        controller.send(Cmd::Kill).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                // Let the listener kill and park on wait_done first.
                thread::sleep(Duration::from_millis(50));
                process.exit_tx.send(WaitOutcome::Exited(0)).unwrap();
            });
            run_race(&session, &process, Ok(Pid::from_raw(51)), |_| Ok(())).unwrap();
        });

        assert!(process.position(Event::Killed(Some(51))) < process.position(Event::WaitReturned));
        assert!(process.position(Event::WaitReturned) < process.position(Event::Reaped));
    }

    #[test]
    fn natural_exit_wins_over_concurrent_kill() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(true);
        process.exit_tx.send(WaitOutcome::Exited(3)).unwrap();
        controller.send(Cmd::Kill).unwrap();

        let mut seen = None;
        run_race(&session, &process, Ok(Pid::from_raw(52)), |facts| {
            seen = Some(facts.unwrap().outcome);
            Ok(())
        })
        .unwrap();

        assert_eq!(seen, Some(WaitOutcome::Exited(3)));
    }

    #[test]
    fn cycle_returns_only_after_listener_reaped() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(false);
        process.exit_tx.send(WaitOutcome::Exited(0)).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                // Teardown command arrives well after the terminal reply.
                thread::sleep(Duration::from_millis(50));
                controller.send(Cmd::Kill).unwrap();
            });
            run_race(&session, &process, Ok(Pid::from_raw(53)), |_| {
                process.record(Event::Finished);
                Ok(())
            })
            .unwrap();
            // Still inside the scope: the race has returned.
            assert_eq!(process.events().last(), Some(&Event::Reaped));
        });

        assert!(process.position(Event::Finished) < process.position(Event::Reaped));
    }

    #[test]
    fn closed_channel_ends_listener_without_kill() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(true);
        process.exit_tx.send(WaitOutcome::Exited(0)).unwrap();
        drop(controller);

        run_race(&session, &process, Ok(Pid::from_raw(54)), |_| Ok(())).unwrap();

        assert_eq!(process.events(), vec![Event::WaitReturned]);
    }

    #[test]
    fn malformed_command_still_kills() {
        let (session, controller) = crate::ipc::unix::UnixChannel::pair().unwrap();
        let process = FakeProcess::new(true);
        controller.send_message(b"not json", &[], None).unwrap();

        run_race(&session, &process, Ok(Pid::from_raw(57)), |_| Ok(())).unwrap();

        assert!(process.position(Event::Killed(Some(57))) < process.position(Event::Reaped));
    }

    #[test]
    fn launch_failure_skips_wait_but_still_reaps() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(false);
        controller.send(Cmd::Kill).unwrap();

        let failure = LaunchFailure::new(
            Some(Pid::from_raw(55)),
            DaemonError::Handshake("handshake: received kill".to_string()),
        );
        let mut reported = None;
        run_race(&session, &process, Err(failure), |facts| {
            reported = Some(facts.unwrap_err().to_string());
            Ok(())
        })
        .unwrap();

        assert!(reported.unwrap().contains("received kill"));
        assert_eq!(process.events(), vec![Event::Killed(Some(55)), Event::Reaped]);
    }

    #[test]
    fn terminal_reply_error_is_returned() {
        let (session, controller) = memory::pair();
        let process = FakeProcess::new(true);
        controller.send(Cmd::Kill).unwrap();

        let result = run_race(&session, &process, Ok(Pid::from_raw(56)), |_| {
            Err(DaemonError::PeerClosed)
        });
        assert!(matches!(result, Err(DaemonError::PeerClosed)));
    }
}
