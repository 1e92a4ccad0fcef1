//! Degraded path: apply one command directly to the state file.
//!
//! Used only when no daemon can be reached. The state lock makes this
//! load-apply-save atomic with respect to the daemon and other fallbacks.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::command::Command;
use crate::core::engine::{Env, apply};
use crate::core::types::ProtocolError;
use crate::io::state_store::StateStore;

#[instrument(skip_all, fields(command = command.name()))]
pub fn apply_direct(store: &StateStore, command: &Command) -> Result<Value, ProtocolError> {
    let _lock = store.lock()?;
    let current = store.load()?;
    let env = Env {
        workspace_root: store.root(),
        now: Utc::now(),
    };
    let applied = apply(current.as_ref(), command, &env);
    store.commit(&applied.next)?;
    debug!(ok = applied.reply.is_ok(), "applied without daemon");
    applied.reply
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::core::types::WorkflowType;
    use crate::test_support::TempWorkspace;

    /// Concurrent fallback writers never lose each other's checkpoints.
    #[test]
    fn concurrent_direct_checkpoints_are_all_kept() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        apply_direct(&store, &Command::Init {
            workflow_type: WorkflowType::QuickFix,
        })
        .expect("init");

        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let store = store.clone();
                thread::spawn(move || {
                    apply_direct(&store, &Command::Checkpoint {
                        agent: format!("agent-{}", idx),
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join").expect("checkpoint");
        }

        let state = store.load().expect("load").expect("state");
        assert_eq!(state.checkpoints.len(), 8);
    }
}
