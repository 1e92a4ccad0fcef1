//! Static gate/validation dependency graphs, one table per workflow type.
//!
//! Each entry lists its prerequisites (which must be satisfied before it may
//! pass), whether it is protected (only the hook path may pass it) and whether
//! it may run alongside its siblings.

use serde::Serialize;

use crate::core::types::{WorkflowState, WorkflowType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Gate,
    Validation,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GraphEntry {
    pub name: &'static str,
    pub kind: EntryKind,
    pub prerequisites: &'static [&'static str],
    pub protected: bool,
    pub parallelizable: bool,
}

const fn gate(name: &'static str, prerequisites: &'static [&'static str]) -> GraphEntry {
    GraphEntry {
        name,
        kind: EntryKind::Gate,
        prerequisites,
        protected: false,
        parallelizable: false,
    }
}

const fn validation(
    name: &'static str,
    prerequisites: &'static [&'static str],
    protected: bool,
    parallelizable: bool,
) -> GraphEntry {
    GraphEntry {
        name,
        kind: EntryKind::Validation,
        prerequisites,
        protected,
        parallelizable,
    }
}

static SKILL_CREATION: [GraphEntry; 7] = [
    validation("frontmatter_check", &[], false, true),
    validation("form_selection_audit", &[], true, true),
    validation("schema_validation", &["frontmatter_check"], true, false),
    gate("design_approved", &["form_selection_audit"]),
    gate("preview_reviewed", &["design_approved"]),
    gate("execution_complete", &["preview_reviewed"]),
    gate("validation_passed", &["execution_complete", "schema_validation"]),
];

static AGENT_CREATION: [GraphEntry; 7] = [
    validation("frontmatter_check", &[], false, true),
    validation("tool_permission_audit", &[], true, true),
    validation("schema_validation", &["frontmatter_check"], true, false),
    gate("design_approved", &["tool_permission_audit"]),
    gate("preview_reviewed", &["design_approved"]),
    gate("execution_complete", &["preview_reviewed"]),
    gate("validation_passed", &["execution_complete", "schema_validation"]),
];

static PLUGIN_PUBLISH: [GraphEntry; 6] = [
    validation("manifest_check", &[], false, true),
    validation("schema_validation", &["manifest_check"], true, true),
    validation("test_suite", &["manifest_check"], true, false),
    gate("preview_reviewed", &["manifest_check"]),
    gate("execution_complete", &["preview_reviewed", "test_suite"]),
    gate("validation_passed", &["execution_complete", "schema_validation"]),
];

static QUICK_FIX: [GraphEntry; 3] = [
    validation("lint_check", &[], false, true),
    gate("execution_complete", &[]),
    gate("validation_passed", &["execution_complete", "lint_check"]),
];

static ANALYZE_ONLY: [GraphEntry; 1] = [validation("analysis_report", &[], false, true)];

/// Graph table for a workflow type.
pub fn graph_for(workflow_type: WorkflowType) -> &'static [GraphEntry] {
    match workflow_type {
        WorkflowType::SkillCreation => &SKILL_CREATION,
        WorkflowType::AgentCreation => &AGENT_CREATION,
        WorkflowType::PluginPublish => &PLUGIN_PUBLISH,
        WorkflowType::QuickFix => &QUICK_FIX,
        WorkflowType::AnalyzeOnly => &ANALYZE_ONLY,
    }
}

pub fn lookup(workflow_type: WorkflowType, name: &str) -> Option<&'static GraphEntry> {
    graph_for(workflow_type)
        .iter()
        .find(|entry| entry.name == name)
}

/// True if `name` is protected in any workflow's table.
///
/// Used when no state can be read and the fail-closed decision must be made
/// without knowing the workflow type.
pub fn is_protected_anywhere(name: &str) -> bool {
    WorkflowType::ALL
        .into_iter()
        .filter_map(|kind| lookup(kind, name))
        .any(|entry| entry.protected)
}

/// Prerequisites of `entry` not yet satisfied in `state`, in declaration order.
pub fn unsatisfied_prerequisites(entry: &GraphEntry, state: &WorkflowState) -> Vec<&'static str> {
    entry
        .prerequisites
        .iter()
        .copied()
        .filter(|prereq| !state.is_satisfied(prereq))
        .collect()
}

/// Check one table for unknown prerequisites and cycles.
///
/// Returns stable error messages (empty on success).
pub fn validate_table(table: &[GraphEntry]) -> Vec<String> {
    let mut errors = Vec::new();
    for entry in table {
        for prereq in entry.prerequisites {
            if !table.iter().any(|other| other.name == *prereq) {
                errors.push(format!("{}: unknown prerequisite '{}'", entry.name, prereq));
            }
        }
    }
    for entry in table {
        let mut stack = Vec::new();
        if has_cycle(table, entry.name, &mut stack) {
            errors.push(format!("{}: prerequisite cycle {}", entry.name, stack.join(" -> ")));
        }
    }
    errors
}

fn has_cycle<'a>(table: &'a [GraphEntry], name: &'a str, stack: &mut Vec<&'a str>) -> bool {
    if stack.contains(&name) {
        stack.push(name);
        return true;
    }
    let Some(entry) = table.iter().find(|entry| entry.name == name) else {
        return false;
    };
    stack.push(name);
    for prereq in entry.prerequisites {
        if has_cycle(table, prereq, stack) {
            return true;
        }
    }
    stack.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phases::Phase;
    use crate::test_support::state_for;

    #[test]
    fn every_table_is_acyclic_and_closed() {
        for kind in WorkflowType::ALL {
            let errors = validate_table(graph_for(kind));
            assert!(errors.is_empty(), "{}: {:?}", kind, errors);
        }
    }

    #[test]
    fn phase_gates_declared_in_a_table_are_gates() {
        for kind in WorkflowType::ALL {
            for phase in Phase::ALL {
                let Some(gate_name) = phase.spec().required_gate else {
                    continue;
                };
                if let Some(entry) = lookup(kind, gate_name) {
                    assert_eq!(entry.kind, EntryKind::Gate, "{} {}", kind, gate_name);
                }
            }
        }
    }

    #[test]
    fn validate_table_reports_cycles() {
        let table = [gate("a", &["b"]), gate("b", &["a"])];
        let errors = validate_table(&table);
        assert!(errors.iter().any(|err| err.contains("cycle")));
    }

    #[test]
    fn form_selection_audit_is_protected() {
        let entry = lookup(WorkflowType::SkillCreation, "form_selection_audit").expect("entry");
        assert!(entry.protected);
        assert!(is_protected_anywhere("form_selection_audit"));
        assert!(!is_protected_anywhere("frontmatter_check"));
        assert!(!is_protected_anywhere("no_such_gate"));
    }

    #[test]
    fn unsatisfied_prerequisites_lists_missing_in_order() {
        let state = state_for(WorkflowType::SkillCreation);
        let entry = lookup(WorkflowType::SkillCreation, "validation_passed").expect("entry");
        assert_eq!(
            unsatisfied_prerequisites(entry, &state),
            vec!["execution_complete", "schema_validation"]
        );
    }
}
