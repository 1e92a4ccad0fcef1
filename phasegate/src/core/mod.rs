//! Deterministic, pure workflow logic.
//!
//! Core modules must be free of I/O side effects. Time and the workspace root
//! are passed in by callers so every transition is reproducible in tests.

pub mod command;
pub mod engine;
pub mod graph;
pub mod phases;
pub mod types;
