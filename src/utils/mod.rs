//! Utilities
//!
//! Descriptor ownership for the exec cycle.

pub mod fd;
