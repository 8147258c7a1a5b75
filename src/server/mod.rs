//! Container server session
//!
//! Owns one controller channel and serves commands on it until the
//! controller goes away.

pub mod session;

pub use session::ContainerSession;
