//! Shared deterministic types for the workflow state machine.
//!
//! These types define the persisted contract (`.phasegate/state.json`) and the
//! typed errors returned across the IPC boundary. They must not depend on I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::phases::Phase;

/// Current persisted schema version. Older files are upgraded on load.
pub const SCHEMA_VERSION: u32 = 2;

/// Kind of authoring workflow; selects the dependency graph table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    SkillCreation,
    AgentCreation,
    PluginPublish,
    QuickFix,
    AnalyzeOnly,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 5] = [
        WorkflowType::SkillCreation,
        WorkflowType::AgentCreation,
        WorkflowType::PluginPublish,
        WorkflowType::QuickFix,
        WorkflowType::AnalyzeOnly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowType::SkillCreation => "skill_creation",
            WorkflowType::AgentCreation => "agent_creation",
            WorkflowType::PluginPublish => "plugin_publish",
            WorkflowType::QuickFix => "quick_fix",
            WorkflowType::AnalyzeOnly => "analyze_only",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                ProtocolError::invalid(format!("unknown workflow type '{}'", s))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Unclaimed,
    Claimed,
    Passed,
}

impl FromStr for ValidationStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unclaimed" => Ok(ValidationStatus::Unclaimed),
            "claimed" => Ok(ValidationStatus::Claimed),
            "passed" => Ok(ValidationStatus::Passed),
            other => Err(ProtocolError::invalid(format!(
                "unknown validation status '{}'",
                other
            ))),
        }
    }
}

/// Who asked for a validation or gate change.
///
/// `Hook` is the automated interceptor path; only it may pass protected entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Manual,
    Hook,
}

impl FromStr for Origin {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Origin::Manual),
            "hook" => Ok(Origin::Hook),
            other => Err(ProtocolError::invalid(format!("unknown origin '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub passed: bool,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub status: ValidationStatus,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub agent_name: String,
    pub phase: Option<Phase>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub description: String,
    pub source_revision: Option<String>,
    pub phase: Option<Phase>,
    pub timestamp: DateTime<Utc>,
}

/// The single live workflow for a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub schema_version: u32,
    pub workflow_type: WorkflowType,
    pub active: bool,
    pub current_phase: Option<Phase>,
    pub phase_status: BTreeMap<Phase, PhaseStatus>,
    pub gates_passed: BTreeMap<String, GateRecord>,
    pub validations: BTreeMap<String, ValidationRecord>,
    pub checkpoints: Vec<Checkpoint>,
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub design_hash: Option<String>,
    pub requires_reconfirmation: bool,
    pub rollback_points: Vec<RollbackPoint>,
    pub workspace_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh, active workflow with every phase pending.
    pub fn new(workflow_type: WorkflowType, workspace_root: PathBuf, now: DateTime<Utc>) -> Self {
        let phase_status = Phase::ALL
            .into_iter()
            .map(|phase| (phase, PhaseStatus::Pending))
            .collect();
        Self {
            schema_version: SCHEMA_VERSION,
            workflow_type,
            active: true,
            current_phase: None,
            phase_status,
            gates_passed: BTreeMap::new(),
            validations: BTreeMap::new(),
            checkpoints: Vec::new(),
            confirmed: false,
            confirmed_at: None,
            design_hash: None,
            requires_reconfirmation: false,
            rollback_points: Vec::new(),
            workspace_root,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phase_status
            .get(&phase)
            .copied()
            .unwrap_or(PhaseStatus::Pending)
    }

    /// True if `name` is a passed gate or a passed validation.
    pub fn is_satisfied(&self, name: &str) -> bool {
        if self.gates_passed.get(name).is_some_and(|gate| gate.passed) {
            return true;
        }
        self.validations
            .get(name)
            .is_some_and(|record| record.status == ValidationStatus::Passed)
    }
}

/// Interceptor verdict for `require-gate` and tool checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

/// Stable error taxonomy shared by the engine, daemon and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    WorkspaceMismatch,
    PhaseOrderViolation,
    GateNotPassed,
    AntiBypassViolation,
    DaemonUnavailable,
    CorruptState,
    InvalidCommand,
    /// Write-side I/O failure; the only kind fatal to the invoking command.
    StorageFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::WorkspaceMismatch => "WorkspaceMismatch",
            ErrorKind::PhaseOrderViolation => "PhaseOrderViolation",
            ErrorKind::GateNotPassed => "GateNotPassed",
            ErrorKind::AntiBypassViolation => "AntiBypassViolation",
            ErrorKind::DaemonUnavailable => "DaemonUnavailable",
            ErrorKind::CorruptState => "CorruptState",
            ErrorKind::InvalidCommand => "InvalidCommand",
            ErrorKind::StorageFailure => "StorageFailure",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCommand, message)
    }

    pub fn phase_order(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PhaseOrderViolation, message)
    }

    pub fn gate_not_passed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::GateNotPassed, message)
    }
}
