//! Per-session daemon configuration.
//!
//! Loaded once at bootstrap from an optional JSON file, then adjusted by
//! command-line overrides. Read-only for the lifetime of the session.

use crate::config::types::{DaemonError, Result};
use crate::kernel::credentials::{validate_ids, Credential};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Uid assigned to sandboxed programs when credential dropping is enabled.
pub const SANDBOX_UID: u32 = 1000;
/// Gid assigned to sandboxed programs when credential dropping is enabled.
pub const SANDBOX_GID: u32 = 1000;
/// Working directory of every sandboxed program.
pub const SANDBOX_WORKDIR: &str = "/w";

/// Which processes receive the kill broadcast.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KillScope {
    /// The launched child's process group (the launcher makes it a group leader)
    #[serde(rename = "group")]
    ProcessGroup,
    /// Every process the daemon may signal (`kill(-1)`); the daemon must be
    /// init of its own PID namespace
    #[serde(rename = "namespace")]
    Namespace,
}

impl Default for KillScope {
    fn default() -> Self {
        KillScope::ProcessGroup
    }
}

impl std::str::FromStr for KillScope {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "group" => Ok(KillScope::ProcessGroup),
            "namespace" => Ok(KillScope::Namespace),
            other => Err(DaemonError::Config(format!(
                "unknown kill scope '{}', expected 'group' or 'namespace'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Run sandboxed programs as `sandbox_uid`/`sandbox_gid`
    pub credential_drop: bool,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub workdir: PathBuf,
    pub kill_scope: KillScope,
    /// Set PR_SET_NO_NEW_PRIVS in the child before exec
    pub no_new_privs: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_drop: false,
            sandbox_uid: SANDBOX_UID,
            sandbox_gid: SANDBOX_GID,
            workdir: PathBuf::from(SANDBOX_WORKDIR),
            kill_scope: KillScope::default(),
            no_new_privs: true,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file; missing keys keep their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: SessionConfig = serde_json::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.credential_drop {
            validate_ids(self.sandbox_uid, self.sandbox_gid)?;
        }
        if !self.workdir.is_absolute() {
            return Err(DaemonError::Config(format!(
                "workdir must be absolute: {}",
                self.workdir.display()
            )));
        }
        Ok(())
    }

    /// Fresh credential for one exec, or `None` to keep the daemon's identity.
    pub fn credential(&self) -> Option<Credential> {
        self.credential_drop
            .then(|| Credential::sandbox(self.sandbox_uid, self.sandbox_gid))
    }
}
