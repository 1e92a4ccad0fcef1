//! Daemon process, wire protocol and the client state machine.
//!
//! [`dispatch`] is the single entry point for callers: talk to the workspace
//! daemon (spawning it if needed) and fall back to a locked direct write when
//! the daemon cannot be reached.

pub mod client;
pub mod fallback;
pub mod protocol;
pub mod server;

use serde_json::Value;
use tracing::warn;

use crate::core::command::Command;
use crate::core::types::{ErrorKind, ProtocolError};
use crate::daemon::client::{Client, ClientError};
use crate::daemon::protocol::Request;
use crate::io::state_store::StateStore;

/// Run `command` through the daemon, or directly if the daemon is unavailable.
pub fn dispatch(
    client: &Client,
    store: &StateStore,
    command: &Command,
) -> Result<Value, ProtocolError> {
    match client.send(&Request::from_command(command)) {
        Ok(response) => response.into_result(),
        Err(err @ (ClientError::Interrupted(_) | ClientError::Malformed(_)))
            if !command.is_read_only() =>
        {
            Err(ProtocolError::new(
                ErrorKind::DaemonUnavailable,
                format!("'{}' may not have been applied: {}", command.name(), err),
            ))
        }
        Err(err) => {
            warn!(command = command.name(), err = %err, "daemon unavailable; applying directly");
            fallback::apply_direct(store, command)
        }
    }
}
