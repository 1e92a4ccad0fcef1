//! Newline-delimited JSON wire format between clients and the daemon.
//!
//! Request: `{"command": "<name>", "args": {...}}`.
//! Response: `{"status": "ok"|"error", "error_kind"?, "message"?, "payload"?}`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::command::Command;
use crate::core::types::{ErrorKind, Origin, ProtocolError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Daemon lifecycle requests that never reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Engine(Command),
    Control(Control),
}

impl Request {
    pub fn control(control: Control) -> Self {
        let command = match control {
            Control::Ping => "ping",
            Control::Shutdown => "shutdown",
        };
        Self {
            command: command.to_string(),
            args: Map::new(),
        }
    }

    /// Encode an engine command.
    pub fn from_command(command: &Command) -> Self {
        let args = match command {
            Command::Init { workflow_type } => json!({ "workflow_type": workflow_type }),
            Command::StartPhase { phase }
            | Command::CompletePhase { phase }
            | Command::FailPhase { phase } => json!({ "phase": phase }),
            Command::PassGate {
                gate,
                origin,
                evidence,
            } => json!({ "gate": gate, "origin": origin, "evidence": evidence }),
            Command::FailGate { gate, evidence } => json!({ "gate": gate, "evidence": evidence }),
            Command::RequireGate { gate } | Command::CheckGate { gate } => json!({ "gate": gate }),
            Command::CheckDeps { name } => json!({ "name": name }),
            Command::MarkValidation {
                name,
                status,
                origin,
            } => json!({ "name": name, "status": status, "origin": origin }),
            Command::Checkpoint { agent } => json!({ "agent": agent }),
            Command::SetDesignHash { hash } => json!({ "hash": hash }),
            Command::AddRollback {
                description,
                source_revision,
            } => json!({ "description": description, "source_revision": source_revision }),
            Command::Activate
            | Command::Deactivate
            | Command::Confirm
            | Command::GetRollbacks
            | Command::Reset
            | Command::Get
            | Command::GetPhase
            | Command::IsActive
            | Command::Phases => json!({}),
        };
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            command: command.name().to_string(),
            args,
        }
    }

    /// Decode into an engine command or a control request.
    pub fn parse(&self) -> Result<Parsed, ProtocolError> {
        let args = Args(&self.args);
        let command = match self.command.as_str() {
            "ping" => return Ok(Parsed::Control(Control::Ping)),
            "shutdown" => return Ok(Parsed::Control(Control::Shutdown)),
            "init" => Command::Init {
                workflow_type: args.parse("workflow_type")?,
            },
            "activate" => Command::Activate,
            "deactivate" => Command::Deactivate,
            "start-phase" => Command::StartPhase {
                phase: args.parse("phase")?,
            },
            "complete-phase" => Command::CompletePhase {
                phase: args.parse("phase")?,
            },
            "fail-phase" => Command::FailPhase {
                phase: args.parse("phase")?,
            },
            "pass-gate" => Command::PassGate {
                gate: args.string("gate")?,
                origin: args.origin()?,
                evidence: args.optional_string("evidence")?,
            },
            "fail-gate" => Command::FailGate {
                gate: args.string("gate")?,
                evidence: args.optional_string("evidence")?,
            },
            "require-gate" => Command::RequireGate {
                gate: args.string("gate")?,
            },
            "check-gate" => Command::CheckGate {
                gate: args.string("gate")?,
            },
            "check-deps" => Command::CheckDeps {
                name: args.string("name")?,
            },
            "mark-validation" => Command::MarkValidation {
                name: args.string("name")?,
                status: args.parse("status")?,
                origin: args.origin()?,
            },
            "confirm" => Command::Confirm,
            "checkpoint" => Command::Checkpoint {
                agent: args.string("agent")?,
            },
            "set-design-hash" => Command::SetDesignHash {
                hash: args.string("hash")?,
            },
            "add-rollback" => Command::AddRollback {
                description: args.string("description")?,
                source_revision: args.optional_string("source_revision")?,
            },
            "get-rollbacks" => Command::GetRollbacks,
            "reset" => Command::Reset,
            "get" => Command::Get,
            "get-phase" => Command::GetPhase,
            "is-active" => Command::IsActive,
            "phases" => Command::Phases,
            other => {
                return Err(ProtocolError::invalid(format!(
                    "unknown command '{}'",
                    other
                )));
            }
        };
        Ok(Parsed::Engine(command))
    }
}

struct Args<'a>(&'a Map<String, Value>);

impl Args<'_> {
    fn optional_string(&self, key: &str) -> Result<Option<String>, ProtocolError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(other) => Err(ProtocolError::invalid(format!(
                "argument '{}' must be a string, got {}",
                key, other
            ))),
        }
    }

    fn string(&self, key: &str) -> Result<String, ProtocolError> {
        self.optional_string(key)?
            .ok_or_else(|| ProtocolError::invalid(format!("missing argument '{}'", key)))
    }

    fn parse<T>(&self, key: &str) -> Result<T, ProtocolError>
    where
        T: FromStr<Err = ProtocolError>,
    {
        self.string(key)?.parse()
    }

    fn origin(&self) -> Result<Origin, ProtocolError> {
        match self.optional_string("origin")? {
            Some(raw) => raw.parse(),
            None => Ok(Origin::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: Status::Ok,
            error_kind: None,
            message: None,
            payload: Some(payload),
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self {
            status: Status::Error,
            error_kind: Some(err.kind),
            message: Some(err.message.clone()),
            payload: None,
        }
    }

    pub fn from_result(result: Result<Value, ProtocolError>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(err) => Self::error(&err),
        }
    }

    pub fn into_result(self) -> Result<Value, ProtocolError> {
        match self.status {
            Status::Ok => Ok(self.payload.unwrap_or(Value::Null)),
            Status::Error => Err(ProtocolError::new(
                self.error_kind.unwrap_or(ErrorKind::InvalidCommand),
                self.message.unwrap_or_default(),
            )),
        }
    }
}
