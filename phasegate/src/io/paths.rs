//! Canonical on-disk locations for one workspace.

use std::env;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Overrides the directory that holds daemon sockets.
pub const RUNTIME_DIR_ENV: &str = "PHASEGATE_RUNTIME_DIR";

/// All paths phasegate reads or writes for a workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasegatePaths {
    pub root: PathBuf,
    pub phasegate_dir: PathBuf,
    pub state_path: PathBuf,
    pub state_lock_path: PathBuf,
    pub config_path: PathBuf,
    pub daemon_log_path: PathBuf,
    pub socket_path: PathBuf,
    /// Held by the running daemon for its whole lifetime.
    pub daemon_lock_path: PathBuf,
}

impl PhasegatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_runtime_dir(root, &runtime_dir())
    }

    pub fn with_runtime_dir(root: impl Into<PathBuf>, runtime_dir: &Path) -> Self {
        let root = root.into();
        let phasegate_dir = root.join(".phasegate");
        let socket_path = runtime_dir.join(format!("phasegate-{}.sock", workspace_key(&root)));
        let daemon_lock_path = socket_path.with_extension("sock.lock");
        Self {
            root: root.clone(),
            phasegate_dir: phasegate_dir.clone(),
            state_path: phasegate_dir.join("state.json"),
            state_lock_path: phasegate_dir.join("state.lock"),
            config_path: phasegate_dir.join("config.toml"),
            daemon_log_path: phasegate_dir.join("daemon.log"),
            socket_path,
            daemon_lock_path,
        }
    }
}

/// `$PHASEGATE_RUNTIME_DIR`, else the OS temp dir.
pub fn runtime_dir() -> PathBuf {
    env::var_os(RUNTIME_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
}

/// First 16 hex chars of sha256(workspace root).
pub fn workspace_key(root: &Path) -> String {
    let digest = Sha256::digest(root.as_os_str().as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(16);
    key
}
