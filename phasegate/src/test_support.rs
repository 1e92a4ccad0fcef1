//! Test-only helpers for constructing workflow states and workspaces.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};

use crate::core::engine::Env;
use crate::core::types::{WorkflowState, WorkflowType};
use crate::io::paths::PhasegatePaths;

/// Workspace root used by pure-core tests that never touch the filesystem.
pub const TEST_ROOT: &str = "/workspace/demo";

/// Deterministic timestamp `secs` seconds after a fixed epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0)
        .single()
        .unwrap_or_default()
}

/// Engine environment rooted at `root` with a fixed clock.
pub fn env_at(root: &'static str, secs: i64) -> Env<'static> {
    Env {
        workspace_root: Path::new(root),
        now: at(secs),
    }
}

/// Fresh active state of `workflow_type` rooted at [`TEST_ROOT`].
pub fn state_for(workflow_type: WorkflowType) -> WorkflowState {
    WorkflowState::new(workflow_type, PathBuf::from(TEST_ROOT), at(0))
}

/// Temporary workspace with resolved phasegate paths.
///
/// The socket runtime directory lives inside the tempdir so parallel tests
/// never share a daemon.
pub struct TempWorkspace {
    pub dir: tempfile::TempDir,
    pub paths: PhasegatePaths,
}

impl TempWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("ws");
        std::fs::create_dir_all(&root).expect("create workspace");
        let root = std::fs::canonicalize(&root).expect("canonicalize workspace");
        let runtime = dir.path().join("run");
        std::fs::create_dir_all(&runtime).expect("create runtime dir");
        let paths = PhasegatePaths::with_runtime_dir(root, &runtime);
        Self { dir, paths }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    /// State for `workflow_type` rooted at this workspace.
    pub fn state_for(&self, workflow_type: WorkflowType) -> WorkflowState {
        WorkflowState::new(workflow_type, self.paths.root.clone(), at(0))
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
