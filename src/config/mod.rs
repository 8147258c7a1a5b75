//! Configuration and shared types
//!
//! Wire/data types of the exec cycle and the per-session configuration.

pub mod session;
pub mod types;
