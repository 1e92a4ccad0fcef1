//! `phasegate` command-line entry point.
//!
//! Every workflow command is relayed to the workspace daemon (spawned on
//! demand). Exit codes follow [`phasegate::exit_codes`]: 0 allow, 1 warn,
//! 2 block.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::warn;

use phasegate::core::command::Command as EngineCommand;
use phasegate::core::phases::Phase;
use phasegate::core::types::{Origin, ProtocolError, ValidationStatus, WorkflowType};
use phasegate::daemon::client::{Client, ClientError};
use phasegate::daemon::protocol::{Control, Request};
use phasegate::daemon::{dispatch, server};
use phasegate::exit_codes;
use phasegate::hooks::{HookEvent, HookSurface, handle_event};
use phasegate::io::config::{PhasegateConfig, load_config};
use phasegate::io::paths::PhasegatePaths;
use phasegate::io::state_store::StateStore;
use phasegate::logging;

#[derive(Parser)]
#[command(
    name = "phasegate",
    version,
    about = "Workflow phase and gate state daemon"
)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true, env = "PHASEGATE_WORKSPACE")]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start a new workflow (fails if one is already active).
    Init { workflow_type: WorkflowType },
    /// Enable hooks for this workspace, creating a workflow if none exists.
    Activate,
    /// Make hooks passive without discarding state.
    Deactivate,
    StartPhase { phase: Phase },
    CompletePhase { phase: Phase },
    FailPhase { phase: Phase },
    PassGate {
        gate: String,
        #[arg(long)]
        evidence: Option<String>,
        #[arg(long, default_value = "manual")]
        origin: Origin,
    },
    FailGate {
        gate: String,
        #[arg(long)]
        evidence: Option<String>,
    },
    /// Exit 0 if the gate is satisfied (or no workflow is active), 2 otherwise.
    RequireGate { gate: String },
    CheckGate { gate: String },
    /// List unsatisfied prerequisites of a gate or validation.
    CheckDeps { name: String },
    MarkValidation {
        name: String,
        status: ValidationStatus,
        #[arg(long, default_value = "manual")]
        origin: Origin,
    },
    /// Approve execution (execute phase only).
    Confirm,
    Checkpoint { agent: String },
    /// Record the design hash; a change after confirmation forces reconfirmation.
    SetDesignHash {
        #[arg(conflicts_with = "content_file", required_unless_present = "content_file")]
        hash: Option<String>,
        /// Hash this file's contents (sha256) instead of passing a hash.
        #[arg(long)]
        content_file: Option<PathBuf>,
    },
    AddRollback {
        description: String,
        #[arg(long)]
        revision: Option<String>,
    },
    GetRollbacks,
    /// Discard the workflow.
    Reset,
    Get,
    GetPhase,
    IsActive,
    /// Print the phase table.
    Phases,
    /// Run the workspace daemon in the foreground.
    Daemon,
    /// Report daemon pid and uptime, starting it if needed.
    Ping,
    /// Stop the workspace daemon if one is running.
    Stop,
    /// Handle an interceptor event; reads the event JSON from stdin.
    Hook {
        event: HookEventArg,
        /// Validation name for `run-validation`.
        #[arg(required_if_eq("event", "run-validation"))]
        name: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HookEventArg {
    SessionStart,
    PreTool,
    PostTool,
    UserPrompt,
    RunValidation,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::WARN
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Usage errors must not collide with the block exit code.
            let code = match err.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => exit_codes::OK,
                _ => exit_codes::WARN,
            };
            let _ = err.print();
            return Ok(code);
        }
    };
    let is_daemon = matches!(cli.command, CliCommand::Daemon);
    logging::init(if is_daemon {
        logging::DAEMON_DEFAULT
    } else {
        logging::CLI_DEFAULT
    });

    let root = resolve_root(cli.workspace.as_deref())?;
    let paths = PhasegatePaths::new(root);

    if let CliCommand::Hook { event, name } = cli.command {
        return Ok(cmd_hook(paths, event, name));
    }
    let config = load_config(&paths.config_path)?;

    match cli.command {
        CliCommand::Daemon => cmd_daemon(&paths, &config),
        CliCommand::Ping => cmd_ping(paths, config),
        CliCommand::Stop => cmd_stop(paths, config),
        CliCommand::RequireGate { gate } => Ok(cmd_require_gate(paths, config, &gate)),
        other => {
            let command = engine_command(other)?;
            let client = Client::new(paths.clone(), config);
            let store = StateStore::new(&paths);
            Ok(report(dispatch(&client, &store, &command)))
        }
    }
}

fn resolve_root(workspace: Option<&Path>) -> Result<PathBuf> {
    let root = match workspace {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    fs::canonicalize(&root).with_context(|| format!("resolve workspace {}", root.display()))
}

fn engine_command(command: CliCommand) -> Result<EngineCommand> {
    let command = match command {
        CliCommand::Init { workflow_type } => EngineCommand::Init { workflow_type },
        CliCommand::Activate => EngineCommand::Activate,
        CliCommand::Deactivate => EngineCommand::Deactivate,
        CliCommand::StartPhase { phase } => EngineCommand::StartPhase { phase },
        CliCommand::CompletePhase { phase } => EngineCommand::CompletePhase { phase },
        CliCommand::FailPhase { phase } => EngineCommand::FailPhase { phase },
        CliCommand::PassGate {
            gate,
            evidence,
            origin,
        } => EngineCommand::PassGate {
            gate,
            origin,
            evidence,
        },
        CliCommand::FailGate { gate, evidence } => EngineCommand::FailGate { gate, evidence },
        CliCommand::RequireGate { gate } => EngineCommand::RequireGate { gate },
        CliCommand::CheckGate { gate } => EngineCommand::CheckGate { gate },
        CliCommand::CheckDeps { name } => EngineCommand::CheckDeps { name },
        CliCommand::MarkValidation {
            name,
            status,
            origin,
        } => EngineCommand::MarkValidation {
            name,
            status,
            origin,
        },
        CliCommand::Confirm => EngineCommand::Confirm,
        CliCommand::Checkpoint { agent } => EngineCommand::Checkpoint { agent },
        CliCommand::SetDesignHash { hash, content_file } => EngineCommand::SetDesignHash {
            hash: match (hash, content_file) {
                (Some(hash), _) => hash,
                (None, Some(path)) => hash_file(&path)?,
                (None, None) => anyhow::bail!("set-design-hash needs a hash or --content-file"),
            },
        },
        CliCommand::AddRollback {
            description,
            revision,
        } => EngineCommand::AddRollback {
            description,
            source_revision: revision,
        },
        CliCommand::GetRollbacks => EngineCommand::GetRollbacks,
        CliCommand::Reset => EngineCommand::Reset,
        CliCommand::Get => EngineCommand::Get,
        CliCommand::GetPhase => EngineCommand::GetPhase,
        CliCommand::IsActive => EngineCommand::IsActive,
        CliCommand::Phases => EngineCommand::Phases,
        CliCommand::Daemon
        | CliCommand::Ping
        | CliCommand::Stop
        | CliCommand::Hook { .. } => anyhow::bail!("not an engine command"),
    };
    Ok(command)
}

fn hash_file(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&contents)))
}

/// Print the payload (or error) and map it to an exit code.
fn report(result: Result<Value, ProtocolError>) -> i32 {
    match result {
        Ok(payload) => {
            print_json(&payload);
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("{}", err);
            exit_codes::for_error_kind(err.kind)
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn cmd_daemon(paths: &PhasegatePaths, config: &PhasegateConfig) -> Result<i32> {
    let exit = server::run(paths, config)?;
    tracing::info!(?exit, "daemon exited");
    Ok(exit_codes::OK)
}

fn cmd_ping(paths: PhasegatePaths, config: PhasegateConfig) -> Result<i32> {
    let client = Client::new(paths, config);
    match client.send(&Request::control(Control::Ping)) {
        Ok(response) => Ok(report(response.into_result())),
        Err(err) => {
            eprintln!("{}", err);
            Ok(exit_codes::WARN)
        }
    }
}

fn cmd_stop(paths: PhasegatePaths, config: PhasegateConfig) -> Result<i32> {
    let client = Client::new(paths, config);
    match client.send_existing(&Request::control(Control::Shutdown)) {
        Ok(response) => Ok(report(response.into_result())),
        Err(ClientError::Unavailable(_)) => {
            print_json(&json!({ "running": false }));
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{}", err);
            Ok(exit_codes::WARN)
        }
    }
}

fn cmd_require_gate(paths: PhasegatePaths, config: PhasegateConfig, gate: &str) -> i32 {
    let decision = HookSurface::new(paths, config).require_gate(gate);
    print_json(&json!({ "gate": gate, "decision": decision }));
    exit_codes::for_decision(decision)
}

fn cmd_hook(paths: PhasegatePaths, event: HookEventArg, name: Option<String>) -> i32 {
    // Hooks fail open: a broken config falls back to defaults.
    let config = load_config(&paths.config_path).unwrap_or_else(|err| {
        warn!(err = %format!("{:#}", err), "invalid config; using defaults");
        PhasegateConfig::default()
    });
    let event = match event {
        HookEventArg::SessionStart => HookEvent::SessionStart,
        HookEventArg::PreTool => HookEvent::PreTool,
        HookEventArg::PostTool => HookEvent::PostTool,
        HookEventArg::UserPrompt => HookEvent::UserPrompt,
        HookEventArg::RunValidation => HookEvent::RunValidation {
            name: name.unwrap_or_default(),
        },
    };
    let input = read_hook_input();
    let outcome = handle_event(&HookSurface::new(paths, config), &event, &input);
    match serde_json::to_string(&outcome) {
        Ok(text) => println!("{}", text),
        Err(err) => warn!(err = %err, "serialize hook outcome"),
    }
    if outcome.exit_code == exit_codes::BLOCK {
        if let Some(message) = &outcome.message {
            eprintln!("{}", message);
        }
    }
    outcome.exit_code
}

/// Event JSON from stdin; anything unreadable is treated as an empty event.
fn read_hook_input() -> Value {
    let mut raw = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut raw) {
        warn!(err = %err, "read hook input");
        return Value::Null;
    }
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(err = %err, "hook input is not JSON");
        Value::Null
    })
}
