use nix::unistd::{getegid, geteuid};

/// Privilege-drop credential applied to the child before exec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    /// Clear supplementary groups before switching ids
    pub drop_supplementary_groups: bool,
}

impl Credential {
    /// Fixed sandbox identity with supplementary groups disabled.
    pub fn sandbox(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            drop_supplementary_groups: true,
        }
    }
}

/// Effective uid/gid of the daemon, reported in the handshake record.
pub fn effective_ids() -> (u32, u32) {
    (geteuid().as_raw(), getegid().as_raw())
}
