//! Execution control
//!
//! Launch, pre-exec handshake and the termination race of one exec cycle.

pub mod handshake;
pub mod launcher;
pub mod race;

pub use launcher::{ForkLauncher, LaunchFailure, LaunchSpec, Launcher};
pub use race::{run_race, KillOutcome};
