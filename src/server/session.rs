//! Command loop and exec cycle glue.
//!
//! One exec cycle on the channel, in order:
//!
//! 1. `Exec` request plus descriptors arrives
//! 2. handshake: `Ack` carrying `{pid, uid, gid}`
//! 3. controller answers `Continue` or `Kill`
//! 4. terminal reply: `Exec(result)` or `Error`
//! 5. one more command (normally `Kill`) tears the sandbox down
//! 6. final `Ack`

use crate::config::session::SessionConfig;
use crate::config::types::{Cmd, DaemonError, ExecRequest, ExecStatus, Reply, Result};
use crate::exec::handshake::synchronize;
use crate::exec::launcher::{LaunchSpec, Launcher};
use crate::exec::race::run_race;
use crate::ipc::Channel;
use crate::kernel::process::ProcessControl;
use crate::kernel::rlimit;
use crate::kernel::signal::signal_name;
use crate::utils::fd::DescriptorSet;
use crate::verdict::ExitClassifier;
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use uuid::Uuid;

pub struct ContainerSession<C, L, P> {
    channel: C,
    launcher: L,
    process: P,
    config: SessionConfig,
}

impl<C, L, P> ContainerSession<C, L, P>
where
    C: Channel,
    L: Launcher,
    P: ProcessControl,
{
    pub fn new(channel: C, launcher: L, process: P, config: SessionConfig) -> Self {
        Self {
            channel,
            launcher,
            process,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Serve commands until the controller closes the channel.
    ///
    /// Only IPC failures end the session with an error; a command that does
    /// not decode and everything that goes wrong inside an exec cycle are
    /// reported as replies.
    pub fn serve(&self) -> Result<()> {
        log::info!("Session started (credential_drop={})", self.config.credential_drop);
        loop {
            let handled = match self.channel.recv_cmd() {
                Ok((cmd, fds)) => self.dispatch(cmd, fds),
                Err(DaemonError::PeerClosed) => break,
                Err(DaemonError::Request(msg)) => self.channel.send_error_reply(&msg),
                Err(e) => return Err(e),
            };

            match handled {
                Ok(()) => {}
                Err(DaemonError::PeerClosed) => break,
                Err(e) => return Err(e),
            }
        }
        log::info!("Controller closed the channel, session finished");
        Ok(())
    }

    fn dispatch(&self, cmd: Cmd, fds: Vec<OwnedFd>) -> Result<()> {
        match cmd {
            Cmd::Ping => self.channel.send_reply(&Reply::Ack, None),
            Cmd::Exec(request) => self.handle_exec(request, fds),
            stray @ (Cmd::Continue | Cmd::Kill) => {
                log::debug!("{} outside an exec cycle", stray.name());
                self.channel.send_reply(&Reply::Ack, None)
            }
        }
    }

    /// Run one exec cycle. Request descriptors are closed on every path.
    pub fn handle_exec(&self, request: Option<ExecRequest>, fds: Vec<OwnedFd>) -> Result<()> {
        let descriptors = DescriptorSet::prepare(fds);

        let Some(request) = request else {
            return self.channel.send_error_reply("execve: no parameter provided");
        };

        let view = match descriptors.launch_view(request.exec_by_descriptor) {
            Ok(view) => view,
            Err(DaemonError::Request(msg)) => return self.channel.send_error_reply(&msg),
            Err(e) => return Err(e),
        };

        let cycle = Uuid::new_v4();
        log::info!(
            "[{}] exec {:?} ({} fd(s), by_descriptor={})",
            cycle,
            request.argv,
            descriptors.len(),
            request.exec_by_descriptor
        );

        let limits = rlimit::prepare(&request.rlimits);
        let spec = LaunchSpec {
            argv: &request.argv,
            env: &request.env,
            exec_target: view.exec_target,
            descriptors: &view.inherited,
            rlimits: &limits,
            workdir: &self.config.workdir,
            credential: self.config.credential(),
            no_new_privs: self.config.no_new_privs,
        };

        let launched = self
            .launcher
            .launch(&spec, &mut |pid: Pid| synchronize(&self.channel, pid));
        // Closed before the wait: the child holds its own copies from here on.
        drop(descriptors);

        match &launched {
            Ok(pid) => log::info!("[{}] child {} running", cycle, pid),
            Err(failure) => log::warn!("[{}] launch failed: {}", cycle, failure),
        }

        run_race(&self.channel, &self.process, launched, |facts| {
            let result = ExitClassifier::classify(&facts);
            match result.status {
                ExecStatus::Normal => log::info!(
                    "[{}] exited {} (user {:?}, peak {} bytes)",
                    cycle,
                    result.exit_code,
                    result.user_time,
                    result.peak_memory
                ),
                ExecStatus::TransportError => log::warn!(
                    "[{}] {}",
                    cycle,
                    result.diagnostic.as_deref().unwrap_or("transport error")
                ),
                status => log::info!(
                    "[{}] {} by {} (user {:?}, peak {} bytes)",
                    cycle,
                    status,
                    signal_name(result.exit_code),
                    result.user_time,
                    result.peak_memory
                ),
            }
            self.channel.send_reply(&Reply::from_result(result), None)
        })?;

        log::debug!("[{}] teardown complete", cycle);
        self.channel.send_reply(&Reply::Ack, None)
    }
}
