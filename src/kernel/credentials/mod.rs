//! Sandbox credentials and the daemon's own identity.
//!
//! The credential is pure data here; the launcher applies it in the child,
//! setresgid strictly before setresuid.

mod identity;
mod validation;

pub use identity::{effective_ids, Credential};
pub use validation::validate_ids;
