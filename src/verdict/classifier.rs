/// Exit classification
///
/// Maps the primary wait's termination facts onto the judge-facing status
/// taxonomy. A misbehaving sandboxed program is data, never an error: only a
/// failed wait (or launch) and impossible wait states become transport errors.
use crate::config::types::{DaemonError, ExecResult, ExecStatus, Result, TerminationFacts, WaitOutcome};
use std::time::Duration;

/// `ru_maxrss` unit.
const KIB: u64 = 1024;

/// Exit classifier - pure function over the primary wait result
pub struct ExitClassifier;

impl ExitClassifier {
    /// Classify the outcome of one exec cycle.
    pub fn classify(facts: &Result<TerminationFacts>) -> ExecResult {
        let facts = match facts {
            Ok(facts) => facts,
            Err(err) => return Self::classify_failed_wait(err),
        };

        match facts.outcome {
            WaitOutcome::Exited(code) => Self::result(ExecStatus::Normal, code, facts),
            WaitOutcome::Signaled(signal) => {
                Self::result(Self::status_for_signal(signal), signal, facts)
            }
            WaitOutcome::Other(raw) => ExecResult {
                diagnostic: Some(format!("execve: unknown status {:#x}", raw)),
                ..Self::result(ExecStatus::TransportError, 0, facts)
            },
        }
    }

    /// Controller kills and kernel CPU enforcement both arrive as a fatal
    /// signal; they are deliberately reported the same.
    pub fn status_for_signal(signal: i32) -> ExecStatus {
        match signal {
            libc::SIGXCPU | libc::SIGKILL => ExecStatus::TimeLimitExceeded,
            libc::SIGXFSZ => ExecStatus::OutputLimitExceeded,
            libc::SIGSYS => ExecStatus::DisallowedSyscall,
            _ => ExecStatus::Signalled,
        }
    }

    /// Peak resident set in bytes from the KiB counter. Negative counters read as zero.
    pub fn peak_memory_bytes(max_rss_kib: i64) -> u64 {
        (max_rss_kib.max(0) as u64).saturating_mul(KIB)
    }

    fn result(status: ExecStatus, exit_code: i32, facts: &TerminationFacts) -> ExecResult {
        ExecResult {
            status,
            exit_code,
            user_time: facts.user_time,
            peak_memory: Self::peak_memory_bytes(facts.max_rss_kib),
            diagnostic: None,
        }
    }

    fn classify_failed_wait(err: &DaemonError) -> ExecResult {
        let diagnostic = match err {
            DaemonError::Wait(msg) => format!("execve: wait4 {}", msg),
            DaemonError::Launch(msg)
            | DaemonError::Handshake(msg)
            | DaemonError::Request(msg) => {
                if msg.starts_with("execve:") || msg.starts_with("handshake:") {
                    msg.clone()
                } else {
                    format!("execve: {}", msg)
                }
            }
            other => format!("execve: {}", other),
        };
        ExecResult {
            status: ExecStatus::TransportError,
            exit_code: 0,
            user_time: Duration::ZERO,
            peak_memory: 0,
            diagnostic: Some(diagnostic),
        }
    }
}
