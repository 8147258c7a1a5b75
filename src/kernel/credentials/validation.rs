//! Credential validation logic.

use crate::config::types::{DaemonError, Result};

/// Reject root UIDs/GIDs (0) as sandbox identity.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(DaemonError::Privilege(format!(
            "Cannot run sandbox as root UID/GID (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}
