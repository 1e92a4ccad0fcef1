//! Pure workflow state transitions.
//!
//! [`apply`] takes the current state (if any) and one command and returns the
//! next state plus a typed reply. It performs no I/O; the caller supplies the
//! workspace root and the clock. A failing command leaves the state untouched,
//! with one exception: a manual attempt to pass a protected validation records
//! the validation as `claimed` while still failing.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::core::command::Command;
use crate::core::graph::{self, EntryKind, GraphEntry};
use crate::core::phases::{EXECUTE_PHASE, Phase, TERMINAL_PHASE, phase_table};
use crate::core::types::{
    Checkpoint, Decision, ErrorKind, GateRecord, Origin, PhaseStatus, ProtocolError,
    RollbackPoint, ValidationRecord, ValidationStatus, WorkflowState, WorkflowType,
};

/// Inputs the engine may not obtain itself.
#[derive(Debug, Clone, Copy)]
pub struct Env<'a> {
    pub workspace_root: &'a Path,
    pub now: DateTime<Utc>,
}

/// What should happen to the persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Unchanged,
    Replace(WorkflowState),
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub next: Next,
    pub reply: Result<Value, ProtocolError>,
}

impl Applied {
    fn read(reply: Value) -> Self {
        Self {
            next: Next::Unchanged,
            reply: Ok(reply),
        }
    }

    fn reject(err: ProtocolError) -> Self {
        Self {
            next: Next::Unchanged,
            reply: Err(err),
        }
    }
}

pub const DEFAULT_WORKFLOW: WorkflowType = WorkflowType::SkillCreation;

/// Apply `command` to `current`.
pub fn apply(current: Option<&WorkflowState>, command: &Command, env: &Env<'_>) -> Applied {
    match command {
        Command::Get => Applied::read(json!(current)),
        Command::GetPhase => Applied::read(json!({
            "phase": current.and_then(|state| state.current_phase),
        })),
        Command::IsActive => Applied::read(json!({
            "active": current.is_some_and(|state| state.active),
        })),
        Command::Phases => Applied::read(json!({ "phases": phase_table() })),
        Command::RequireGate { gate } => Applied::read(require_gate(current, gate)),
        Command::CheckGate { gate } => with_state(current, |state| check_gate(state, gate)),
        Command::CheckDeps { name } => with_state(current, |state| check_deps(state, name)),
        Command::GetRollbacks => with_state(current, |state| {
            Ok(json!({ "rollback_points": state.rollback_points }))
        }),
        Command::Init { workflow_type } => init(current, *workflow_type, env),
        Command::Activate => activate(current, env),
        Command::Reset => Applied {
            next: Next::Clear,
            reply: Ok(json!({ "reset": true, "had_workflow": current.is_some() })),
        },
        Command::Deactivate => mutate(current, env, false, |state| {
            state.active = false;
            Ok(json!({ "active": false }))
        }),
        Command::StartPhase { phase } => {
            mutate(current, env, true, |state| start_phase(state, *phase))
        }
        Command::CompletePhase { phase } => complete_phase(current, *phase, env),
        Command::FailPhase { phase } => {
            mutate(current, env, true, |state| fail_phase(state, *phase))
        }
        Command::PassGate {
            gate,
            origin,
            evidence,
        } => mutate(current, env, true, |state| {
            pass_gate(state, gate, *origin, evidence.clone())
        }),
        Command::FailGate { gate, evidence } => mutate(current, env, true, |state| {
            fail_gate(state, gate, evidence.clone())
        }),
        Command::MarkValidation {
            name,
            status,
            origin,
        } => mark_validation(current, name, *status, *origin, env),
        Command::Confirm => mutate(current, env, true, |state| confirm(state, env.now)),
        Command::Checkpoint { agent } => mutate(current, env, false, |state| {
            checkpoint(state, agent, env.now)
        }),
        Command::SetDesignHash { hash } => {
            mutate(current, env, false, |state| set_design_hash(state, hash))
        }
        Command::AddRollback {
            description,
            source_revision,
        } => mutate(current, env, false, |state| {
            add_rollback(state, description, source_revision.clone(), env.now)
        }),
    }
}

fn no_workflow() -> ProtocolError {
    ProtocolError::invalid("no workflow initialized (run init first)")
}

fn with_state(
    current: Option<&WorkflowState>,
    f: impl FnOnce(&WorkflowState) -> Result<Value, ProtocolError>,
) -> Applied {
    match current {
        Some(state) => Applied {
            next: Next::Unchanged,
            reply: f(state),
        },
        None => Applied::reject(no_workflow()),
    }
}

/// Clone, mutate, and replace on success; leave untouched on error.
fn mutate(
    current: Option<&WorkflowState>,
    env: &Env<'_>,
    require_active: bool,
    f: impl FnOnce(&mut WorkflowState) -> Result<Value, ProtocolError>,
) -> Applied {
    let Some(state) = current else {
        return Applied::reject(no_workflow());
    };
    if require_active && !state.active {
        return Applied::reject(ProtocolError::invalid(
            "workflow is not active (run activate first)",
        ));
    }
    let mut next = state.clone();
    match f(&mut next) {
        Ok(reply) => {
            next.updated_at = env.now;
            Applied {
                next: Next::Replace(next),
                reply: Ok(reply),
            }
        }
        Err(err) => Applied::reject(err),
    }
}

fn init(current: Option<&WorkflowState>, workflow_type: WorkflowType, env: &Env<'_>) -> Applied {
    if let Some(existing) = current.filter(|state| state.active) {
        return Applied::reject(ProtocolError::invalid(format!(
            "an active {} workflow already exists (reset it first)",
            existing.workflow_type
        )));
    }
    let state = WorkflowState::new(workflow_type, env.workspace_root.to_path_buf(), env.now);
    Applied {
        next: Next::Replace(state),
        reply: Ok(json!({
            "workflow_type": workflow_type,
            "active": true,
            "next_phase": Phase::Input,
            "guidance": Phase::Input.spec().guidance,
        })),
    }
}

fn activate(current: Option<&WorkflowState>, env: &Env<'_>) -> Applied {
    match current {
        None => init(None, DEFAULT_WORKFLOW, env),
        Some(_) => mutate(current, env, false, |state| {
            state.active = true;
            Ok(json!({
                "workflow_type": state.workflow_type,
                "active": true,
                "phase": state.current_phase,
            }))
        }),
    }
}

fn start_phase(state: &mut WorkflowState, phase: Phase) -> Result<Value, ProtocolError> {
    match state.phase_status(phase) {
        PhaseStatus::InProgress => {
            return Err(ProtocolError::phase_order(format!(
                "phase '{}' is already in progress",
                phase
            )));
        }
        PhaseStatus::Completed => {
            return Err(ProtocolError::phase_order(format!(
                "phase '{}' is already completed",
                phase
            )));
        }
        PhaseStatus::Pending | PhaseStatus::Failed => {}
    }
    if let Some(running) = Phase::ALL
        .into_iter()
        .find(|other| state.phase_status(*other) == PhaseStatus::InProgress)
    {
        return Err(ProtocolError::phase_order(format!(
            "cannot start '{}' while '{}' is in progress",
            phase, running
        )));
    }
    let incomplete: Vec<&str> = phase
        .predecessors()
        .iter()
        .filter(|prev| state.phase_status(**prev) != PhaseStatus::Completed)
        .map(|prev| prev.as_str())
        .collect();
    if !incomplete.is_empty() {
        return Err(ProtocolError::phase_order(format!(
            "cannot start '{}': earlier phases incomplete: {}",
            phase,
            incomplete.join(", ")
        )));
    }

    state.phase_status.insert(phase, PhaseStatus::InProgress);
    state.current_phase = Some(phase);
    state.confirmed = false;
    Ok(json!({
        "phase": phase,
        "status": PhaseStatus::InProgress,
        "guidance": phase.spec().guidance,
        "required_gate": required_gate(state.workflow_type, phase),
    }))
}

/// The phase's required gate, if this workflow's graph declares it.
fn required_gate(workflow_type: WorkflowType, phase: Phase) -> Option<&'static str> {
    phase
        .spec()
        .required_gate
        .filter(|gate| graph::lookup(workflow_type, gate).is_some())
}

fn complete_phase(current: Option<&WorkflowState>, phase: Phase, env: &Env<'_>) -> Applied {
    let applied = mutate(current, env, true, |state| {
        if state.phase_status(phase) != PhaseStatus::InProgress {
            return Err(ProtocolError::phase_order(format!(
                "phase '{}' is not in progress",
                phase
            )));
        }
        if let Some(gate) = required_gate(state.workflow_type, phase) {
            if !state.is_satisfied(gate) {
                return Err(ProtocolError::gate_not_passed(format!(
                    "phase '{}' requires gate '{}' to pass first",
                    phase, gate
                )));
            }
        }
        state.phase_status.insert(phase, PhaseStatus::Completed);
        Ok(json!({
            "phase": phase,
            "status": PhaseStatus::Completed,
            "next_phase": phase.next(),
        }))
    });

    // Completing the terminal phase ends the workflow.
    match applied.next {
        Next::Replace(finished) if phase == TERMINAL_PHASE => Applied {
            next: Next::Clear,
            reply: Ok(json!({
                "phase": phase,
                "status": PhaseStatus::Completed,
                "completed": true,
                "final_state": finished,
            })),
        },
        _ => applied,
    }
}

fn fail_phase(state: &mut WorkflowState, phase: Phase) -> Result<Value, ProtocolError> {
    if state.phase_status(phase) != PhaseStatus::InProgress {
        return Err(ProtocolError::phase_order(format!(
            "phase '{}' is not in progress",
            phase
        )));
    }
    state.phase_status.insert(phase, PhaseStatus::Failed);
    Ok(json!({ "phase": phase, "status": PhaseStatus::Failed }))
}

/// Look up `name` in the workflow's graph and require the given kind.
fn declared(
    state: &WorkflowState,
    name: &str,
    kind: EntryKind,
) -> Result<&'static GraphEntry, ProtocolError> {
    let entry = graph::lookup(state.workflow_type, name).ok_or_else(|| {
        ProtocolError::invalid(format!(
            "'{}' is not declared for {} workflows",
            name, state.workflow_type
        ))
    })?;
    if entry.kind != kind {
        let hint = match entry.kind {
            EntryKind::Gate => "a gate",
            EntryKind::Validation => "a validation",
        };
        return Err(ProtocolError::invalid(format!("'{}' is {}", name, hint)));
    }
    Ok(entry)
}

fn ensure_prerequisites(entry: &GraphEntry, state: &WorkflowState) -> Result<(), ProtocolError> {
    let missing = graph::unsatisfied_prerequisites(entry, state);
    if missing.is_empty() {
        return Ok(());
    }
    Err(ProtocolError::gate_not_passed(format!(
        "'{}' has unsatisfied prerequisites: {}",
        entry.name,
        missing.join(", ")
    )))
}

fn pass_gate(
    state: &mut WorkflowState,
    gate: &str,
    origin: Origin,
    evidence: Option<String>,
) -> Result<Value, ProtocolError> {
    let entry = declared(state, gate, EntryKind::Gate)?;
    if entry.protected && origin != Origin::Hook {
        return Err(anti_bypass(gate));
    }
    ensure_prerequisites(entry, state)?;
    state.gates_passed.insert(
        gate.to_string(),
        GateRecord {
            passed: true,
            evidence,
        },
    );
    Ok(json!({ "gate": gate, "passed": true }))
}

fn fail_gate(
    state: &mut WorkflowState,
    gate: &str,
    evidence: Option<String>,
) -> Result<Value, ProtocolError> {
    declared(state, gate, EntryKind::Gate)?;
    state.gates_passed.insert(
        gate.to_string(),
        GateRecord {
            passed: false,
            evidence,
        },
    );
    Ok(json!({ "gate": gate, "passed": false }))
}

fn anti_bypass(name: &str) -> ProtocolError {
    ProtocolError::new(
        ErrorKind::AntiBypassViolation,
        format!(
            "'{}' claimed, not passed: requires automated execution (origin=hook)",
            name
        ),
    )
}

fn mark_validation(
    current: Option<&WorkflowState>,
    name: &str,
    status: ValidationStatus,
    origin: Origin,
    env: &Env<'_>,
) -> Applied {
    let mut bypass_attempt = false;
    let mut applied = mutate(current, env, true, |state| {
        let entry = declared(state, name, EntryKind::Validation)?;
        let mut stored = status;
        if status == ValidationStatus::Passed {
            if entry.protected && origin != Origin::Hook {
                bypass_attempt = true;
                stored = ValidationStatus::Claimed;
            } else {
                ensure_prerequisites(entry, state)?;
            }
        }
        state.validations.insert(
            name.to_string(),
            ValidationRecord {
                status: stored,
                origin,
            },
        );
        Ok(json!({ "name": name, "status": stored, "origin": origin }))
    });
    if bypass_attempt {
        // The claim is recorded, but the caller must see a distinct failure.
        applied.reply = Err(anti_bypass(name));
    }
    applied
}

fn confirm(state: &mut WorkflowState, now: DateTime<Utc>) -> Result<Value, ProtocolError> {
    if state.current_phase != Some(EXECUTE_PHASE) {
        return Err(ProtocolError::phase_order(format!(
            "confirm is only valid during '{}' (current: {})",
            EXECUTE_PHASE,
            state
                .current_phase
                .map_or("none", |phase| phase.as_str())
        )));
    }
    state.confirmed = true;
    state.confirmed_at = Some(now);
    state.requires_reconfirmation = false;
    Ok(json!({
        "confirmed": true,
        "phase": EXECUTE_PHASE,
        "guidance": EXECUTE_PHASE.spec().guidance,
    }))
}

fn checkpoint(
    state: &mut WorkflowState,
    agent: &str,
    now: DateTime<Utc>,
) -> Result<Value, ProtocolError> {
    if agent.trim().is_empty() {
        return Err(ProtocolError::invalid("checkpoint agent name must be non-empty"));
    }
    state.checkpoints.push(Checkpoint {
        agent_name: agent.to_string(),
        phase: state.current_phase,
        timestamp: now,
    });
    Ok(json!({
        "agent": agent,
        "phase": state.current_phase,
        "count": state.checkpoints.len(),
    }))
}

fn set_design_hash(state: &mut WorkflowState, hash: &str) -> Result<Value, ProtocolError> {
    if hash.trim().is_empty() {
        return Err(ProtocolError::invalid("design hash must be non-empty"));
    }
    let changed = state.design_hash.as_deref() != Some(hash);
    if changed && state.confirmed {
        state.confirmed = false;
        state.requires_reconfirmation = true;
    }
    state.design_hash = Some(hash.to_string());
    Ok(json!({
        "hash": hash,
        "changed": changed,
        "confirmed": state.confirmed,
        "requires_reconfirmation": state.requires_reconfirmation,
    }))
}

fn add_rollback(
    state: &mut WorkflowState,
    description: &str,
    source_revision: Option<String>,
    now: DateTime<Utc>,
) -> Result<Value, ProtocolError> {
    let point = RollbackPoint {
        description: description.to_string(),
        source_revision,
        phase: state.current_phase,
        timestamp: now,
    };
    state.rollback_points.push(point.clone());
    Ok(json!({ "point": point, "count": state.rollback_points.len() }))
}

fn require_gate(current: Option<&WorkflowState>, gate: &str) -> Value {
    let decision = match current.filter(|state| state.active) {
        None => Decision::Allow,
        Some(state) if state.is_satisfied(gate) => Decision::Allow,
        Some(_) => Decision::Block,
    };
    json!({ "gate": gate, "decision": decision })
}

fn check_gate(state: &WorkflowState, gate: &str) -> Result<Value, ProtocolError> {
    let record = state.gates_passed.get(gate);
    Ok(json!({
        "gate": gate,
        "declared": graph::lookup(state.workflow_type, gate).is_some(),
        "passed": record.is_some_and(|record| record.passed),
        "evidence": record.and_then(|record| record.evidence.clone()),
    }))
}

fn check_deps(state: &WorkflowState, name: &str) -> Result<Value, ProtocolError> {
    let entry = graph::lookup(state.workflow_type, name).ok_or_else(|| {
        ProtocolError::invalid(format!(
            "'{}' is not declared for {} workflows",
            name, state.workflow_type
        ))
    })?;
    let missing = graph::unsatisfied_prerequisites(entry, state);
    Ok(json!({
        "name": name,
        "satisfied": missing.is_empty(),
        "missing": missing,
        "protected": entry.protected,
        "parallelizable": entry.parallelizable,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TEST_ROOT, at, env_at, state_for};

    fn run(state: &WorkflowState, command: Command) -> Applied {
        apply(Some(state), &command, &env_at(TEST_ROOT, 10))
    }

    fn expect_state(applied: Applied) -> WorkflowState {
        match applied.next {
            Next::Replace(state) => state,
            other => panic!("expected replace, got {:?} ({:?})", other, applied.reply),
        }
    }

    fn kind(applied: &Applied) -> ErrorKind {
        applied.reply.as_ref().expect_err("expected error").kind
    }

    fn start(state: &WorkflowState, phase: Phase) -> WorkflowState {
        expect_state(run(state, Command::StartPhase { phase }))
    }

    fn complete(state: &WorkflowState, phase: Phase) -> WorkflowState {
        expect_state(run(state, Command::CompletePhase { phase }))
    }

    fn pass(state: &WorkflowState, gate: &str) -> WorkflowState {
        expect_state(run(
            state,
            Command::PassGate {
                gate: gate.to_string(),
                origin: Origin::Manual,
                evidence: None,
            },
        ))
    }

    fn hook_validation(state: &WorkflowState, name: &str) -> WorkflowState {
        expect_state(run(
            state,
            Command::MarkValidation {
                name: name.to_string(),
                status: ValidationStatus::Passed,
                origin: Origin::Hook,
            },
        ))
    }

    /// Walk a skill_creation workflow up to (and into) the execute phase.
    fn into_execute() -> WorkflowState {
        let mut state = state_for(WorkflowType::SkillCreation);
        state = start(&state, Phase::Input);
        state = complete(&state, Phase::Input);
        state = start(&state, Phase::Analysis);
        state = complete(&state, Phase::Analysis);
        state = start(&state, Phase::Design);
        state = hook_validation(&state, "form_selection_audit");
        state = pass(&state, "design_approved");
        state = complete(&state, Phase::Design);
        state = start(&state, Phase::Preview);
        state = pass(&state, "preview_reviewed");
        state = complete(&state, Phase::Preview);
        start(&state, Phase::Execute)
    }

    #[test]
    fn init_then_out_of_order_start_is_phase_order_violation() {
        let env = env_at(TEST_ROOT, 0);
        let init = apply(
            None,
            &Command::Init {
                workflow_type: WorkflowType::SkillCreation,
            },
            &env,
        );
        let state = expect_state(init);

        let applied = run(&state, Command::StartPhase {
            phase: Phase::Validation,
        });
        assert_eq!(kind(&applied), ErrorKind::PhaseOrderViolation);
        assert_eq!(applied.next, Next::Unchanged);
    }

    #[test]
    fn rejected_start_leaves_serialized_state_identical() {
        let state = state_for(WorkflowType::SkillCreation);
        let before = serde_json::to_vec(&state).expect("serialize");
        for phase in [Phase::Analysis, Phase::Design, Phase::Preview, Phase::Execute] {
            let applied = run(&state, Command::StartPhase { phase });
            assert_eq!(kind(&applied), ErrorKind::PhaseOrderViolation);
            assert_eq!(applied.next, Next::Unchanged);
        }
        assert_eq!(serde_json::to_vec(&state).expect("serialize"), before);
    }

    #[test]
    fn activate_without_state_then_input_then_analysis() {
        let env = env_at(TEST_ROOT, 0);
        let state = expect_state(apply(None, &Command::Activate, &env));
        assert!(state.active);
        let state = start(&state, Phase::Input);
        let state = complete(&state, Phase::Input);
        let state = start(&state, Phase::Analysis);
        assert_eq!(state.current_phase, Some(Phase::Analysis));
        assert_eq!(state.phase_status(Phase::Analysis), PhaseStatus::InProgress);
    }

    #[test]
    fn cannot_start_while_another_phase_runs() {
        let state = start(&state_for(WorkflowType::QuickFix), Phase::Input);
        let applied = run(&state, Command::StartPhase {
            phase: Phase::Input,
        });
        assert_eq!(kind(&applied), ErrorKind::PhaseOrderViolation);
    }

    #[test]
    fn completed_phase_cannot_restart_but_failed_phase_can() {
        let state = start(&state_for(WorkflowType::QuickFix), Phase::Input);
        let failed = expect_state(run(&state, Command::FailPhase {
            phase: Phase::Input,
        }));
        assert_eq!(failed.phase_status(Phase::Input), PhaseStatus::Failed);
        let restarted = start(&failed, Phase::Input);
        let done = complete(&restarted, Phase::Input);
        let applied = run(&done, Command::StartPhase {
            phase: Phase::Input,
        });
        assert_eq!(kind(&applied), ErrorKind::PhaseOrderViolation);
    }

    #[test]
    fn complete_requires_declared_gate() {
        let mut state = state_for(WorkflowType::SkillCreation);
        for phase in [Phase::Input, Phase::Analysis] {
            state = start(&state, phase);
            state = complete(&state, phase);
        }
        state = start(&state, Phase::Design);
        let applied = run(&state, Command::CompletePhase {
            phase: Phase::Design,
        });
        assert_eq!(kind(&applied), ErrorKind::GateNotPassed);
    }

    #[test]
    fn analyze_only_has_no_phase_gates() {
        let mut state = state_for(WorkflowType::AnalyzeOnly);
        for phase in [Phase::Input, Phase::Analysis, Phase::Design] {
            state = start(&state, phase);
            state = complete(&state, phase);
        }
        assert_eq!(state.phase_status(Phase::Design), PhaseStatus::Completed);
    }

    #[test]
    fn complete_requires_in_progress() {
        let state = state_for(WorkflowType::SkillCreation);
        let applied = run(&state, Command::CompletePhase {
            phase: Phase::Input,
        });
        assert_eq!(kind(&applied), ErrorKind::PhaseOrderViolation);
    }

    #[test]
    fn gate_prerequisites_are_enforced() {
        let state = state_for(WorkflowType::SkillCreation);
        let applied = run(&state, Command::PassGate {
            gate: "design_approved".to_string(),
            origin: Origin::Manual,
            evidence: None,
        });
        assert_eq!(kind(&applied), ErrorKind::GateNotPassed);
        let message = &applied.reply.as_ref().expect_err("error").message;
        assert!(message.contains("form_selection_audit"));
    }

    #[test]
    fn manual_pass_of_protected_validation_is_claimed() {
        let state = state_for(WorkflowType::SkillCreation);
        let applied = run(&state, Command::MarkValidation {
            name: "form_selection_audit".to_string(),
            status: ValidationStatus::Passed,
            origin: Origin::Manual,
        });
        assert_eq!(kind(&applied), ErrorKind::AntiBypassViolation);
        let next = match applied.next {
            Next::Replace(next) => next,
            other => panic!("claim must be persisted, got {:?}", other),
        };
        let record = &next.validations["form_selection_audit"];
        assert_eq!(record.status, ValidationStatus::Claimed);
        assert!(!next.is_satisfied("form_selection_audit"));
    }

    #[test]
    fn manual_pass_downgrades_even_after_hook_pass() {
        let state = hook_validation(
            &state_for(WorkflowType::SkillCreation),
            "form_selection_audit",
        );
        let applied = run(&state, Command::MarkValidation {
            name: "form_selection_audit".to_string(),
            status: ValidationStatus::Passed,
            origin: Origin::Manual,
        });
        assert_eq!(kind(&applied), ErrorKind::AntiBypassViolation);
        let next = expect_state(applied);
        assert_eq!(
            next.validations["form_selection_audit"].status,
            ValidationStatus::Claimed
        );
    }

    #[test]
    fn hook_pass_of_protected_validation_is_passed() {
        let state = hook_validation(
            &state_for(WorkflowType::SkillCreation),
            "form_selection_audit",
        );
        let record = &state.validations["form_selection_audit"];
        assert_eq!(record.status, ValidationStatus::Passed);
        assert_eq!(record.origin, Origin::Hook);
    }

    #[test]
    fn unprotected_validation_passes_manually_once_deps_met() {
        let state = state_for(WorkflowType::QuickFix);
        let state = expect_state(run(&state, Command::MarkValidation {
            name: "lint_check".to_string(),
            status: ValidationStatus::Passed,
            origin: Origin::Manual,
        }));
        assert!(state.is_satisfied("lint_check"));
    }

    #[test]
    fn validation_deps_checked_for_hook_origin() {
        let state = state_for(WorkflowType::SkillCreation);
        let applied = run(&state, Command::MarkValidation {
            name: "schema_validation".to_string(),
            status: ValidationStatus::Passed,
            origin: Origin::Hook,
        });
        assert_eq!(kind(&applied), ErrorKind::GateNotPassed);
        assert_eq!(applied.next, Next::Unchanged);
    }

    #[test]
    fn undeclared_names_are_invalid() {
        let state = state_for(WorkflowType::QuickFix);
        let applied = run(&state, Command::PassGate {
            gate: "design_approved".to_string(),
            origin: Origin::Hook,
            evidence: None,
        });
        assert_eq!(kind(&applied), ErrorKind::InvalidCommand);
        let applied = run(&state, Command::PassGate {
            gate: "lint_check".to_string(),
            origin: Origin::Hook,
            evidence: None,
        });
        assert_eq!(kind(&applied), ErrorKind::InvalidCommand);
    }

    #[test]
    fn require_gate_allows_without_workflow() {
        let env = env_at(TEST_ROOT, 0);
        for gate in ["design_approved", "anything", ""] {
            let applied = apply(None, &Command::RequireGate { gate: gate.to_string() }, &env);
            assert_eq!(applied.reply.expect("reply")["decision"], "allow");
            assert_eq!(applied.next, Next::Unchanged);
        }
    }

    #[test]
    fn require_gate_blocks_until_passed() {
        let state = state_for(WorkflowType::QuickFix);
        let gate = || Command::RequireGate {
            gate: "execution_complete".to_string(),
        };
        assert_eq!(run(&state, gate()).reply.expect("reply")["decision"], "block");
        let state = pass(&state, "execution_complete");
        assert_eq!(run(&state, gate()).reply.expect("reply")["decision"], "allow");
    }

    #[test]
    fn require_gate_allows_when_inactive() {
        let mut state = state_for(WorkflowType::QuickFix);
        state.active = false;
        let applied = run(&state, Command::RequireGate {
            gate: "execution_complete".to_string(),
        });
        assert_eq!(applied.reply.expect("reply")["decision"], "allow");
    }

    #[test]
    fn confirm_only_in_execute() {
        let state = state_for(WorkflowType::SkillCreation);
        assert_eq!(kind(&run(&state, Command::Confirm)), ErrorKind::PhaseOrderViolation);

        let state = expect_state(run(&into_execute(), Command::Confirm));
        assert!(state.confirmed);
        assert!(state.confirmed_at.is_some());
    }

    #[test]
    fn design_change_after_confirm_requires_reconfirmation() {
        let state = expect_state(run(&into_execute(), Command::SetDesignHash {
            hash: "h1".to_string(),
        }));
        let state = expect_state(run(&state, Command::Confirm));
        assert!(state.confirmed);

        let state = expect_state(run(&state, Command::SetDesignHash {
            hash: "h2".to_string(),
        }));
        assert!(!state.confirmed);
        assert!(state.requires_reconfirmation);

        let state = expect_state(run(&state, Command::Confirm));
        assert!(state.confirmed);
        assert!(!state.requires_reconfirmation);
    }

    #[test]
    fn same_design_hash_keeps_confirmation() {
        let state = expect_state(run(&into_execute(), Command::SetDesignHash {
            hash: "h1".to_string(),
        }));
        let state = expect_state(run(&state, Command::Confirm));
        let applied = run(&state, Command::SetDesignHash {
            hash: "h1".to_string(),
        });
        assert_eq!(applied.reply.as_ref().expect("reply")["changed"], false);
        assert!(expect_state(applied).confirmed);
    }

    #[test]
    fn starting_next_phase_clears_confirmation() {
        let mut state = expect_state(run(&into_execute(), Command::Confirm));
        state = pass(&state, "execution_complete");
        state = complete(&state, Phase::Execute);
        assert!(state.confirmed);
        state = start(&state, Phase::Validation);
        assert!(!state.confirmed);
    }

    #[test]
    fn completing_terminal_phase_clears_workflow() {
        let mut state = expect_state(run(&into_execute(), Command::Confirm));
        state = pass(&state, "execution_complete");
        state = complete(&state, Phase::Execute);
        state = start(&state, Phase::Validation);
        state = expect_state(run(&state, Command::MarkValidation {
            name: "frontmatter_check".to_string(),
            status: ValidationStatus::Passed,
            origin: Origin::Manual,
        }));
        state = hook_validation(&state, "schema_validation");
        state = pass(&state, "validation_passed");

        let applied = run(&state, Command::CompletePhase {
            phase: Phase::Validation,
        });
        assert_eq!(applied.next, Next::Clear);
        let reply = applied.reply.expect("reply");
        assert_eq!(reply["completed"], true);
        assert_eq!(reply["final_state"]["phase_status"]["validation"], "completed");
    }

    #[test]
    fn rollbacks_and_checkpoints_only_append() {
        let state = state_for(WorkflowType::QuickFix);
        let first = expect_state(run(&state, Command::AddRollback {
            description: "before edit".to_string(),
            source_revision: Some("abc123".to_string()),
        }));
        let second = expect_state(run(&first, Command::AddRollback {
            description: "after edit".to_string(),
            source_revision: None,
        }));
        assert_eq!(second.rollback_points.len(), 2);
        assert_eq!(second.rollback_points[0], first.rollback_points[0]);

        let checked = expect_state(run(&second, Command::Checkpoint {
            agent: "agent-x".to_string(),
        }));
        assert_eq!(checked.checkpoints.len(), 1);
        assert_eq!(checked.rollback_points, second.rollback_points);
    }

    #[test]
    fn mutations_without_workflow_are_invalid() {
        let env = env_at(TEST_ROOT, 0);
        for command in [
            Command::Confirm,
            Command::Checkpoint {
                agent: "a".to_string(),
            },
            Command::StartPhase {
                phase: Phase::Input,
            },
        ] {
            let applied = apply(None, &command, &env);
            assert_eq!(kind(&applied), ErrorKind::InvalidCommand);
            assert_eq!(applied.next, Next::Unchanged);
        }
    }

    #[test]
    fn inactive_workflow_rejects_phase_commands() {
        let state = expect_state(run(&state_for(WorkflowType::QuickFix), Command::Deactivate));
        let applied = run(&state, Command::StartPhase {
            phase: Phase::Input,
        });
        assert_eq!(kind(&applied), ErrorKind::InvalidCommand);
        let state = expect_state(run(&state, Command::Activate));
        start(&state, Phase::Input);
    }

    #[test]
    fn init_refuses_to_replace_active_workflow() {
        let state = state_for(WorkflowType::QuickFix);
        let applied = run(&state, Command::Init {
            workflow_type: WorkflowType::SkillCreation,
        });
        assert_eq!(kind(&applied), ErrorKind::InvalidCommand);
    }

    #[test]
    fn reset_clears() {
        let applied = run(&state_for(WorkflowType::QuickFix), Command::Reset);
        assert_eq!(applied.next, Next::Clear);
    }

    #[test]
    fn successful_mutation_stamps_updated_at() {
        let state = state_for(WorkflowType::QuickFix);
        let next = expect_state(run(&state, Command::Checkpoint {
            agent: "a".to_string(),
        }));
        assert_eq!(next.updated_at, at(10));
        assert_eq!(next.created_at, state.created_at);
    }
}
