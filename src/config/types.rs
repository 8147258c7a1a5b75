/// Core types shared by the exec controller, the IPC layer and the session.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Resource limit families accepted in an exec request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RLimitKind {
    /// CPU seconds; soft limit raises SIGXCPU
    #[serde(rename = "cpu")]
    Cpu,
    /// Largest file the process may create; exceeding raises SIGXFSZ
    #[serde(rename = "fsize")]
    FileSize,
    /// Virtual address space in bytes
    #[serde(rename = "as")]
    AddressSpace,
    #[serde(rename = "data")]
    Data,
    #[serde(rename = "stack")]
    Stack,
    #[serde(rename = "core")]
    Core,
    #[serde(rename = "nofile")]
    NoFile,
    #[serde(rename = "nproc")]
    NProc,
    #[serde(rename = "memlock")]
    MemLock,
}

/// One `(soft, hard)` pair for a limit kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RLimit {
    pub kind: RLimitKind,
    pub soft: u64,
    pub hard: u64,
}

impl RLimit {
    pub fn new(kind: RLimitKind, soft: u64, hard: u64) -> Self {
        Self { kind, soft, hard }
    }
}

/// Exec request sent by the controller. Immutable once received.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecRequest {
    /// argv[0] is the path executed unless `exec_by_descriptor` is set
    pub argv: Vec<String>,
    /// `KEY=VALUE` entries, passed through untouched
    #[serde(default)]
    pub env: Vec<String>,
    /// Execute the first attached descriptor instead of argv[0]
    #[serde(default)]
    pub exec_by_descriptor: bool,
    #[serde(default)]
    pub rlimits: Vec<RLimit>,
}

/// Controller -> daemon command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", content = "body", rename_all = "snake_case")]
pub enum Cmd {
    Ping,
    /// Start one exec cycle; `None` is answered with an error reply
    Exec(Option<ExecRequest>),
    /// Handshake verdict: let the paused child exec
    Continue,
    /// Handshake veto, in-flight kill, or end-of-cycle teardown
    Kill,
}

impl Cmd {
    pub fn name(&self) -> &'static str {
        match self {
            Cmd::Ping => "ping",
            Cmd::Exec(_) => "exec",
            Cmd::Continue => "continue",
            Cmd::Kill => "kill",
        }
    }
}

/// Judge-facing outcome taxonomy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecStatus {
    /// Exited on its own; exit code carried through
    #[serde(rename = "OK")]
    Normal,
    /// SIGXCPU or SIGKILL
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    /// SIGXFSZ
    #[serde(rename = "OLE")]
    OutputLimitExceeded,
    /// SIGSYS
    #[serde(rename = "DSC")]
    DisallowedSyscall,
    /// Any other terminating signal
    #[serde(rename = "SIG")]
    Signalled,
    /// The wait itself failed or reported an impossible state
    #[serde(rename = "TE")]
    TransportError,
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecStatus::Normal => write!(f, "normal"),
            ExecStatus::TimeLimitExceeded => write!(f, "time_limit_exceeded"),
            ExecStatus::OutputLimitExceeded => write!(f, "output_limit_exceeded"),
            ExecStatus::DisallowedSyscall => write!(f, "disallowed_syscall"),
            ExecStatus::Signalled => write!(f, "signalled"),
            ExecStatus::TransportError => write!(f, "transport_error"),
        }
    }
}

/// Result of one exec cycle, the only value crossing the session boundary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecResult {
    pub status: ExecStatus,
    /// Exit code, or the signal number when signalled
    pub exit_code: i32,
    /// User CPU time of the waited child
    pub user_time: Duration,
    /// Peak resident set size in bytes
    pub peak_memory: u64,
    /// Only set for `TransportError`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// How the waited child changed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signaled(i32),
    /// Stopped/continued or anything else; carries the raw wait status
    Other(i32),
}

/// Raw facts gathered by the primary wait. Produced once, consumed once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminationFacts {
    pub outcome: WaitOutcome,
    pub user_time: Duration,
    /// `ru_maxrss`, which the kernel reports in KiB
    pub max_rss_kib: i64,
}

impl TerminationFacts {
    pub fn exited(&self) -> bool {
        matches!(self.outcome, WaitOutcome::Exited(_))
    }

    pub fn signalled(&self) -> bool {
        matches!(self.outcome, WaitOutcome::Signaled(_))
    }
}

/// Handshake record: the child pid plus the daemon's effective ids.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessCredential {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Daemon -> controller reply.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reply", content = "body", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Exec(ExecResult),
    Error { message: String },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    /// Transport-error results travel as error replies; everything else is data.
    pub fn from_result(result: ExecResult) -> Self {
        match result.status {
            ExecStatus::TransportError => Reply::Error {
                message: result
                    .diagnostic
                    .unwrap_or_else(|| "execve: transport error".to_string()),
            },
            _ => Reply::Exec(result),
        }
    }
}

/// Custom error types for boxd
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("IPC peer closed the channel")]
    PeerClosed,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Wait error: {0}")]
    Wait(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Process error: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
