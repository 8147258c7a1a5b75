//! Thin wrappers around Linux kernel primitives.

pub mod credentials;
pub mod process;
pub mod rlimit;
pub mod signal;
