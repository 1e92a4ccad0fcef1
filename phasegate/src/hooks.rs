//! Primitives for tool-use interceptors and the `phasegate hook` events.
//!
//! Everything here sits on the tool-invocation critical path. Reads go to the
//! state file directly and never spawn a daemon. Unexpected errors fail open,
//! except [`HookSurface::require_gate`] for a name that is protected in some
//! workflow, which fails closed.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::command::Command;
use crate::core::graph::is_protected_anywhere;
use crate::core::phases::{EXECUTE_PHASE, Phase, is_tool_blocked};
use crate::core::types::{Decision, Origin, ProtocolError, ValidationStatus, WorkflowState};
use crate::daemon::client::Client;
use crate::daemon::dispatch;
use crate::exit_codes;
use crate::io::config::PhasegateConfig;
use crate::io::paths::PhasegatePaths;
use crate::io::process::run_validator;
use crate::io::state_store::StateStore;

const BLOCKED_TEMPLATE: &str = include_str!("templates/blocked.txt");

static CONFIRM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(yes|proceed|go ahead|confirm|approved?|lgtm|do it|execute)\b")
        .expect("confirmation pattern")
});

/// True if a user prompt reads as approval to execute.
pub fn is_confirmation(prompt: &str) -> bool {
    CONFIRM_RE.is_match(prompt)
}

pub struct HookSurface {
    paths: PhasegatePaths,
    config: PhasegateConfig,
    store: StateStore,
    client: Client,
}

impl HookSurface {
    pub fn new(paths: PhasegatePaths, config: PhasegateConfig) -> Self {
        let store = StateStore::new(&paths);
        let client = Client::new(paths.clone(), config.clone());
        Self {
            paths,
            config,
            store,
            client,
        }
    }

    /// Active workflow, or `None` on absence or any read error.
    fn active_state(&self) -> Option<WorkflowState> {
        match self.store.load() {
            Ok(state) => state.filter(|state| state.active),
            Err(err) => {
                warn!(err = %err, "hook cannot read state; failing open");
                None
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_state().is_some()
    }

    pub fn get_phase(&self) -> Option<Phase> {
        self.active_state().and_then(|state| state.current_phase)
    }

    /// Whether `tool` must be blocked in `phase` given the live confirmation flag.
    pub fn is_tool_blocked(&self, phase: Phase, tool: &str) -> bool {
        let confirmed = self
            .active_state()
            .is_some_and(|state| state.confirmed);
        is_tool_blocked(phase, tool, confirmed)
    }

    pub fn require_gate(&self, name: &str) -> Decision {
        let state = match self.store.load() {
            Ok(state) => state,
            Err(err) if is_protected_anywhere(name) => {
                warn!(gate = name, err = %err, "state unreadable for protected gate; blocking");
                return Decision::Block;
            }
            Err(err) => {
                warn!(gate = name, err = %err, "state unreadable; allowing");
                return Decision::Allow;
            }
        };
        match state.filter(|state| state.active) {
            Some(state) if !state.is_satisfied(name) => Decision::Block,
            _ => Decision::Allow,
        }
    }

    pub fn checkpoint(&self, agent: &str) -> Result<Value, ProtocolError> {
        self.send(&Command::Checkpoint {
            agent: agent.to_string(),
        })
    }

    fn send(&self, command: &Command) -> Result<Value, ProtocolError> {
        dispatch(&self.client, &self.store, command)
    }
}

/// Interceptor events handled by `phasegate hook <event>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    SessionStart,
    PreTool,
    PostTool,
    UserPrompt,
    RunValidation { name: String },
}

/// Verdict printed to stdout as JSON; `exit_code` is the process status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookOutcome {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip)]
    pub exit_code: i32,
}

impl HookOutcome {
    fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            message: None,
            exit_code: exit_codes::OK,
        }
    }

    fn allow_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::allow()
        }
    }

    fn warn(message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            message: Some(message.into()),
            exit_code: exit_codes::WARN,
        }
    }

    fn block(message: String) -> Self {
        Self {
            decision: Decision::Block,
            message: Some(message),
            exit_code: exit_codes::BLOCK,
        }
    }
}

/// Handle one event. `input` is the interceptor's JSON payload.
pub fn handle_event(surface: &HookSurface, event: &HookEvent, input: &Value) -> HookOutcome {
    let Some(state) = surface.active_state() else {
        return HookOutcome::allow();
    };
    match event {
        HookEvent::SessionStart => session_start(&state),
        HookEvent::PreTool => pre_tool(&state, input),
        HookEvent::PostTool => post_tool(surface, &state, input),
        HookEvent::UserPrompt => user_prompt(surface, &state, input),
        HookEvent::RunValidation { name } => match run_validation(surface, name) {
            Ok(outcome) => outcome,
            Err(err) => HookOutcome::warn(format!("{:#}", err)),
        },
    }
}

fn input_str<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn session_start(state: &WorkflowState) -> HookOutcome {
    let message = match state.current_phase {
        Some(phase) => format!(
            "phasegate active ({}): phase {} ({}). {}",
            state.workflow_type,
            phase,
            phase.spec().title,
            phase.spec().guidance
        ),
        None => format!(
            "phasegate active ({}): no phase started yet",
            state.workflow_type
        ),
    };
    HookOutcome::allow_with(message)
}

fn pre_tool(state: &WorkflowState, input: &Value) -> HookOutcome {
    let tool = input_str(input, "tool_name");
    let Some(phase) = state.current_phase else {
        return HookOutcome::allow();
    };
    if !is_tool_blocked(phase, tool, state.confirmed) {
        return HookOutcome::allow();
    }
    debug!(%phase, tool, "tool blocked");
    match render_blocked(phase, tool) {
        Ok(message) => HookOutcome::block(message),
        Err(err) => {
            warn!(err = %err, "block template failed");
            HookOutcome::block(format!("BLOCKED: {}", phase.spec().block_reason))
        }
    }
}

/// Render the message shown when a tool is blocked.
pub fn render_blocked(phase: Phase, tool: &str) -> Result<String> {
    let spec = phase.spec();
    let mut env = Environment::new();
    env.add_template("blocked", BLOCKED_TEMPLATE)
        .context("load blocked template")?;
    let rendered = env.get_template("blocked")?.render(context! {
        reason => spec.block_reason,
        until_confirmed => spec.blocked_until_confirmed,
        phase => phase.as_str(),
        tool => tool,
    })?;
    Ok(rendered)
}

fn post_tool(surface: &HookSurface, state: &WorkflowState, input: &Value) -> HookOutcome {
    if input_str(input, "tool_name") != "Task" {
        return HookOutcome::allow();
    }
    let agent = input
        .get("tool_input")
        .map(|tool_input| input_str(tool_input, "subagent_type"))
        .unwrap_or_default();
    if agent.is_empty() {
        return HookOutcome::allow();
    }
    let expected = state.current_phase.map(|phase| phase.spec().agent);
    match surface.checkpoint(agent) {
        Ok(_) => match expected {
            Some(expected) if !agent.ends_with(expected) => HookOutcome::allow_with(format!(
                "checkpoint recorded for {}; current phase expects {}",
                agent, expected
            )),
            _ => HookOutcome::allow_with(format!("checkpoint recorded for {}", agent)),
        },
        Err(err) => {
            warn!(agent, err = %err, "checkpoint not recorded");
            HookOutcome::allow_with(format!("checkpoint not recorded: {}", err))
        }
    }
}

fn user_prompt(surface: &HookSurface, state: &WorkflowState, input: &Value) -> HookOutcome {
    if state.current_phase != Some(EXECUTE_PHASE) || state.confirmed {
        return HookOutcome::allow();
    }
    if !is_confirmation(input_str(input, "prompt")) {
        return HookOutcome::allow();
    }
    match surface.send(&Command::Confirm) {
        Ok(_) => {
            info!("execution confirmed from prompt");
            HookOutcome::allow_with("Execution confirmed; write, edit and shell tools are unlocked")
        }
        Err(err) => {
            warn!(err = %err, "confirm failed");
            HookOutcome::allow_with(format!("confirmation not recorded: {}", err))
        }
    }
}

/// Run the configured validator for `name` and record a hook-origin pass on success.
pub fn run_validation(surface: &HookSurface, name: &str) -> Result<HookOutcome> {
    let validator = surface
        .config
        .validators
        .get(name)
        .ok_or_else(|| {
            anyhow!(
                "no validator configured for '{}' in {}",
                name,
                surface.paths.config_path.display()
            )
        })?;
    let run = run_validator(
        &validator.command,
        &surface.paths.root,
        Duration::from_secs(validator.timeout_secs),
        surface.config.validator_output_limit_bytes,
    )
    .with_context(|| format!("run validator '{}'", name))?;
    let summary = run.summary(name);
    if !run.passed() {
        let stderr = String::from_utf8_lossy(&run.stderr);
        return Ok(HookOutcome::warn(format!("{}\n{}", summary, stderr.trim_end())));
    }
    match surface.send(&Command::MarkValidation {
        name: name.to_string(),
        status: ValidationStatus::Passed,
        origin: Origin::Hook,
    }) {
        Ok(_) => Ok(HookOutcome::allow_with(format!("{}; '{}' passed", summary, name))),
        Err(err) => Ok(HookOutcome {
            exit_code: exit_codes::for_error_kind(err.kind),
            ..HookOutcome::warn(format!("{}; not recorded: {}", summary, err))
        }),
    }
}
