use crate::config::session::{KillScope, SessionConfig};
use crate::exec::ForkLauncher;
use crate::ipc::unix::UnixChannel;
use crate::kernel::process::{become_child_subreaper, HostProcessControl};
use crate::server::ContainerSession;
use crate::utils::fd::set_cloexec;
use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::stat::{fstat, SFlag};
use std::os::fd::RawFd;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sandbox daemon execution controller", long_about = None)]
struct Cli {
    /// Descriptor of the connected SOCK_SEQPACKET controller socket
    #[arg(long, default_value_t = 3)]
    socket_fd: RawFd,
    /// JSON session configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run sandboxed programs as the fixed sandbox uid/gid
    #[arg(long)]
    cred: bool,
    /// Working directory of sandboxed programs
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Kill broadcast scope: "group" or "namespace"
    #[arg(long)]
    kill_scope: Option<KillScope>,
}

extern "C" fn signal_handler(sig: i32) {
    // Async-signal-safe only: raw write and _exit.
    let msg = b"boxd: signal received, exiting\n";
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as usize);
        libc::signal(libc::SIGINT, signal_handler as usize);
    }
}

fn build_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if cli.cred {
        config.credential_drop = true;
    }
    if let Some(workdir) = &cli.workdir {
        config.workdir = workdir.clone();
    }
    if let Some(scope) = cli.kill_scope {
        config.kill_scope = scope;
    }
    config.validate()?;
    Ok(config)
}

fn check_socket(fd: RawFd) -> Result<()> {
    let stat = fstat(fd).with_context(|| format!("--socket-fd {} is not open", fd))?;
    if SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT != SFlag::S_IFSOCK {
        anyhow::bail!("--socket-fd {} is not a socket", fd);
    }
    Ok(())
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    env_logger::init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    log::debug!("Session config: {:?}", config);

    check_socket(cli.socket_fd)?;
    // Sandboxed children must never inherit the controller socket.
    set_cloexec(cli.socket_fd)?;

    // Orphaned sandbox descendants are reparented here and reaped by the
    // kill listener.
    become_child_subreaper()?;
    if config.kill_scope == KillScope::Namespace && std::process::id() != 1 {
        log::warn!("namespace kill scope outside a PID namespace signals every process we can reach");
    }

    // SAFETY: the controller hands this descriptor over exclusively.
    let channel = unsafe { UnixChannel::from_raw_fd(cli.socket_fd) };
    let session = ContainerSession::new(
        channel,
        ForkLauncher::new(),
        HostProcessControl::new(config.kill_scope),
        config,
    );
    session.serve().context("session ended with an IPC failure")?;
    Ok(())
}
