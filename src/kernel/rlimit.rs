//! Resource limits for the sandboxed child.
//!
//! Limits are resolved to raw `rlimit` values before fork so the child only
//! has to issue `setrlimit` calls.

use crate::config::types::{RLimit, RLimitKind};
use nix::sys::resource::{setrlimit, Resource};

/// A limit resolved to its kernel resource id.
#[derive(Clone, Copy, Debug)]
pub struct PreparedLimit {
    pub kind: RLimitKind,
    resource: Resource,
    soft: libc::rlim_t,
    hard: libc::rlim_t,
}

impl PreparedLimit {
    /// Issue the `setrlimit` call. Async-signal-safe; returns errno on failure.
    pub fn apply(&self) -> Result<(), libc::c_int> {
        setrlimit(self.resource, self.soft, self.hard).map_err(|e| e as libc::c_int)
    }
}

pub fn resource_of(kind: RLimitKind) -> Resource {
    match kind {
        RLimitKind::Cpu => Resource::RLIMIT_CPU,
        RLimitKind::FileSize => Resource::RLIMIT_FSIZE,
        RLimitKind::AddressSpace => Resource::RLIMIT_AS,
        RLimitKind::Data => Resource::RLIMIT_DATA,
        RLimitKind::Stack => Resource::RLIMIT_STACK,
        RLimitKind::Core => Resource::RLIMIT_CORE,
        RLimitKind::NoFile => Resource::RLIMIT_NOFILE,
        RLimitKind::NProc => Resource::RLIMIT_NPROC,
        RLimitKind::MemLock => Resource::RLIMIT_MEMLOCK,
    }
}

/// Resolve request limits, clamping a soft limit above its hard limit.
pub fn prepare(limits: &[RLimit]) -> Vec<PreparedLimit> {
    limits
        .iter()
        .map(|l| {
            let soft = l.soft.min(l.hard);
            if soft != l.soft {
                log::warn!(
                    "rlimit {:?}: soft {} exceeds hard {}, clamped",
                    l.kind,
                    l.soft,
                    l.hard
                );
            }
            PreparedLimit {
                kind: l.kind,
                resource: resource_of(l.kind),
                soft: soft as libc::rlim_t,
                hard: l.hard as libc::rlim_t,
            }
        })
        .collect()
}
