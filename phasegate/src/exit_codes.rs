//! Stable exit codes for phasegate CLI and hook invocations.

use crate::core::types::{Decision, ErrorKind};

/// Allowed, or command succeeded.
pub const OK: i32 = 0;
/// Non-blocking failure: the caller should warn and continue.
pub const WARN: i32 = 1;
/// Authoritative block; interceptors must not run the tool.
pub const BLOCK: i32 = 2;

/// Exit code for a failed command of the given kind.
pub fn for_error_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::AntiBypassViolation
        | ErrorKind::PhaseOrderViolation
        | ErrorKind::GateNotPassed
        | ErrorKind::WorkspaceMismatch => BLOCK,
        ErrorKind::InvalidCommand
        | ErrorKind::DaemonUnavailable
        | ErrorKind::CorruptState
        | ErrorKind::StorageFailure => WARN,
    }
}

pub fn for_decision(decision: Decision) -> i32 {
    match decision {
        Decision::Allow => OK,
        Decision::Block => BLOCK,
    }
}
