//! Typed protocol commands accepted by the engine.

use crate::core::phases::Phase;
use crate::core::types::{Origin, ValidationStatus, WorkflowType};

/// One engine command. Wire names are the kebab-case forms from [`Command::name`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init {
        workflow_type: WorkflowType,
    },
    Activate,
    Deactivate,
    StartPhase {
        phase: Phase,
    },
    CompletePhase {
        phase: Phase,
    },
    FailPhase {
        phase: Phase,
    },
    PassGate {
        gate: String,
        origin: Origin,
        evidence: Option<String>,
    },
    FailGate {
        gate: String,
        evidence: Option<String>,
    },
    RequireGate {
        gate: String,
    },
    CheckGate {
        gate: String,
    },
    CheckDeps {
        name: String,
    },
    MarkValidation {
        name: String,
        status: ValidationStatus,
        origin: Origin,
    },
    Confirm,
    Checkpoint {
        agent: String,
    },
    SetDesignHash {
        hash: String,
    },
    AddRollback {
        description: String,
        source_revision: Option<String>,
    },
    GetRollbacks,
    Reset,
    Get,
    GetPhase,
    IsActive,
    Phases,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::Activate => "activate",
            Command::Deactivate => "deactivate",
            Command::StartPhase { .. } => "start-phase",
            Command::CompletePhase { .. } => "complete-phase",
            Command::FailPhase { .. } => "fail-phase",
            Command::PassGate { .. } => "pass-gate",
            Command::FailGate { .. } => "fail-gate",
            Command::RequireGate { .. } => "require-gate",
            Command::CheckGate { .. } => "check-gate",
            Command::CheckDeps { .. } => "check-deps",
            Command::MarkValidation { .. } => "mark-validation",
            Command::Confirm => "confirm",
            Command::Checkpoint { .. } => "checkpoint",
            Command::SetDesignHash { .. } => "set-design-hash",
            Command::AddRollback { .. } => "add-rollback",
            Command::GetRollbacks => "get-rollbacks",
            Command::Reset => "reset",
            Command::Get => "get",
            Command::GetPhase => "get-phase",
            Command::IsActive => "is-active",
            Command::Phases => "phases",
        }
    }

    /// Read-only commands never write the state file.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::RequireGate { .. }
                | Command::CheckGate { .. }
                | Command::CheckDeps { .. }
                | Command::GetRollbacks
                | Command::Get
                | Command::GetPhase
                | Command::IsActive
                | Command::Phases
        )
    }
}
