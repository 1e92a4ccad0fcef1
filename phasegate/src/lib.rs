//! Workflow phase and gate state daemon.
//!
//! `phasegate` keeps one authoritative workflow state per workspace and
//! enforces phase ordering, gate prerequisites and anti-bypass rules for
//! tool-use interceptors. The crate is split the usual way:
//!
//! - **[`core`]**: Pure, deterministic logic (phases, dependency graphs, the
//!   protocol engine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting helpers (state file, locks, config, child
//!   processes).
//!
//! [`daemon`] serializes all mutations through one process per workspace and
//! [`hooks`] exposes the fast, fail-open primitives interceptors call.

pub mod core;
pub mod daemon;
pub mod exit_codes;
pub mod hooks;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
