//! Exit classification
//!
//! Derives the judge-facing result as a pure function of the primary wait.

pub mod classifier;

pub use classifier::ExitClassifier;
