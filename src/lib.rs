//! boxd: execution controller of a sandbox daemon
//!
//! Launches one untrusted program per request behind a pre-exec handshake,
//! races an out-of-band kill against the program's own exit, and reports a
//! judge-facing result.
//!
//! # Architecture
//!
//! ## Configuration & Types ([`config`])
//! - [`config::types`]: Wire commands and replies, exec results, errors
//! - [`config::session`]: Per-session configuration and JSON loading
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::credentials`]: Sandbox identity and id validation
//! - [`kernel::rlimit`]: Resource limits resolved before fork
//! - [`kernel::signal`]: Sandbox-wide SIGKILL broadcast
//! - [`kernel::process`]: Primary wait, zombie reaping, subreaper setup
//!
//! ## Execution Control ([`exec`])
//! - [`exec::launcher`]: fork/exec with a paused child and a setup report pipe
//! - [`exec::handshake`]: Controller rendezvous before exec
//! - [`exec::race`]: Kill listener versus primary wait
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classifier`]: Termination facts to exec result
//!
//! ## Controller Channel ([`ipc`])
//! - [`ipc::unix`]: `SOCK_SEQPACKET` with descriptor and credential passing
//! - [`ipc::memory`]: In-process pair
//!
//! ## Session ([`server`])
//! - [`server::session`]: Command loop and exec cycle
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd`]: Request descriptor ownership

// Configuration & Types
pub mod config;

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Verdict
pub mod verdict;

// Controller Channel
pub mod ipc;

// Session
pub mod server;

// Utilities
pub mod utils;

// CLI
pub mod cli;

pub use config::session::SessionConfig;
pub use config::types::{Cmd, DaemonError, ExecRequest, ExecResult, ExecStatus, Reply, Result};
pub use server::ContainerSession;
