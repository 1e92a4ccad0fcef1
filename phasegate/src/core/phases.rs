//! Fixed linear phase chain and per-phase tool policy.
//!
//! Phase order is global: every workflow walks
//! `input → analysis → design → preview → execute → validation`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::types::ProtocolError;

/// A workflow phase. Declaration order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Input,
    Analysis,
    Design,
    Preview,
    Execute,
    Validation,
}

/// Tool families that interceptors may be told to block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Write,
    Edit,
    Shell,
}

impl ToolCategory {
    /// Map an interceptor tool name to its category. Unknown tools are uncategorized.
    pub fn from_tool_name(tool: &str) -> Option<Self> {
        match tool {
            "Write" | "NotebookWrite" => Some(ToolCategory::Write),
            "Edit" | "MultiEdit" | "NotebookEdit" => Some(ToolCategory::Edit),
            "Bash" => Some(ToolCategory::Shell),
            _ => None,
        }
    }
}

/// Static description of one phase.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PhaseSpec {
    pub phase: Phase,
    pub title: &'static str,
    pub agent: &'static str,
    pub guidance: &'static str,
    pub blocked: &'static [ToolCategory],
    /// Blocking applies only until the workflow is confirmed.
    pub blocked_until_confirmed: bool,
    pub required_gate: Option<&'static str>,
    pub block_reason: &'static str,
}

/// The execute phase, where `confirm` is legal.
pub const EXECUTE_PHASE: Phase = Phase::Execute;

/// Completing this phase ends the workflow.
pub const TERMINAL_PHASE: Phase = Phase::Validation;

static PHASES: [PhaseSpec; 6] = [
    PhaseSpec {
        phase: Phase::Input,
        title: "Input",
        agent: "input-agent",
        guidance: "Normalize user intent into a clear problem statement",
        blocked: &[ToolCategory::Write, ToolCategory::Edit, ToolCategory::Shell],
        blocked_until_confirmed: false,
        required_gate: None,
        block_reason: "Input phase gathers requirements only; no file modifications",
    },
    PhaseSpec {
        phase: Phase::Analysis,
        title: "Analysis",
        agent: "analysis-agent",
        guidance: "Analyze the codebase and describe reality",
        blocked: &[],
        blocked_until_confirmed: false,
        required_gate: None,
        block_reason: "",
    },
    PhaseSpec {
        phase: Phase::Design,
        title: "Design",
        agent: "design-agent",
        guidance: "Propose design options with trade-offs",
        blocked: &[ToolCategory::Write, ToolCategory::Edit],
        blocked_until_confirmed: false,
        required_gate: Some("design_approved"),
        block_reason: "Design phase produces options only; no implementation",
    },
    PhaseSpec {
        phase: Phase::Preview,
        title: "Preview",
        agent: "preview-agent",
        guidance: "Preview the changes that will be made (dry run)",
        blocked: &[ToolCategory::Write, ToolCategory::Edit],
        blocked_until_confirmed: false,
        required_gate: Some("preview_reviewed"),
        block_reason: "Preview phase is a dry run; no file modifications",
    },
    PhaseSpec {
        phase: Phase::Execute,
        title: "Execute",
        agent: "execute-agent",
        guidance: "Implement the confirmed design",
        blocked: &[ToolCategory::Write, ToolCategory::Edit, ToolCategory::Shell],
        blocked_until_confirmed: true,
        required_gate: Some("execution_complete"),
        block_reason: "Execute phase requires user confirmation before implementation",
    },
    PhaseSpec {
        phase: Phase::Validation,
        title: "Validate",
        agent: "validate-agent",
        guidance: "Validate structure and schema of the result",
        blocked: &[],
        blocked_until_confirmed: false,
        required_gate: Some("validation_passed"),
        block_reason: "",
    },
];

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Input,
        Phase::Analysis,
        Phase::Design,
        Phase::Preview,
        Phase::Execute,
        Phase::Validation,
    ];

    pub fn spec(self) -> &'static PhaseSpec {
        &PHASES[self.index()]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Input => "input",
            Phase::Analysis => "analysis",
            Phase::Design => "design",
            Phase::Preview => "preview",
            Phase::Execute => "execute",
            Phase::Validation => "validation",
        }
    }

    /// Phases that must be completed before `self` may start.
    pub fn predecessors(self) -> &'static [Phase] {
        let order: &'static [Phase; 6] = &Phase::ALL;
        &order[..self.index()]
    }

    pub fn next(self) -> Option<Phase> {
        Phase::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| ProtocolError::invalid(format!("unknown phase '{}'", s)))
    }
}

/// All phase definitions in order.
pub fn phase_table() -> &'static [PhaseSpec] {
    &PHASES
}

/// True if `tool` must be blocked while `phase` is current.
///
/// Execute only blocks until the workflow is confirmed.
pub fn is_tool_blocked(phase: Phase, tool: &str, confirmed: bool) -> bool {
    let Some(category) = ToolCategory::from_tool_name(tool) else {
        return false;
    };
    let spec = phase.spec();
    if spec.blocked_until_confirmed && confirmed {
        return false;
    }
    spec.blocked.contains(&category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_order_matches_enum_order() {
        for (idx, spec) in phase_table().iter().enumerate() {
            assert_eq!(spec.phase.index(), idx);
        }
    }

    #[test]
    fn predecessors_are_strict_prefix() {
        assert!(Phase::Input.predecessors().is_empty());
        assert_eq!(
            Phase::Design.predecessors(),
            &[Phase::Input, Phase::Analysis]
        );
        assert_eq!(Phase::Validation.next(), None);
    }

    #[test]
    fn parse_round_trips_names() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().expect("parse"), phase);
        }
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn input_blocks_shell_but_not_reads() {
        assert!(is_tool_blocked(Phase::Input, "Bash", false));
        assert!(is_tool_blocked(Phase::Input, "Write", false));
        assert!(!is_tool_blocked(Phase::Input, "Read", false));
        assert!(!is_tool_blocked(Phase::Analysis, "Write", false));
    }

    #[test]
    fn execute_blocks_only_until_confirmed() {
        assert!(is_tool_blocked(Phase::Execute, "Edit", false));
        assert!(!is_tool_blocked(Phase::Execute, "Edit", true));
        // Confirmation never unlocks other phases.
        assert!(is_tool_blocked(Phase::Preview, "Edit", true));
    }
}
