//! Side-effecting helpers: files, locks, config and child processes.

pub mod config;
pub mod lock;
pub mod paths;
pub mod process;
pub mod state_store;
