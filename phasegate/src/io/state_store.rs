//! Durable storage for the workspace's single workflow state.
//!
//! The file is `.phasegate/state.json`. Reads are forgiving: anything that
//! cannot be parsed, validated against the embedded JSON schema, or upgraded
//! is logged and treated as "no workflow". Writes are strict and atomic.

use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::engine::Next;
use crate::core::phases::Phase;
use crate::core::types::{ErrorKind, ProtocolError, SCHEMA_VERSION, WorkflowState};
use crate::io::lock::{FileLock, lock_exclusive};
use crate::io::paths::PhasegatePaths;

const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/workflow_state/v2.schema.json"
));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state belongs to workspace {found}, not {expected}")]
    WorkspaceMismatch { expected: PathBuf, found: PathBuf },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::WorkspaceMismatch { .. } => ErrorKind::WorkspaceMismatch,
            StoreError::Io { .. } | StoreError::Serialize(_) => ErrorKind::StorageFailure,
        };
        ProtocolError::new(kind, err.to_string())
    }
}

/// Identity of the state file on disk; changes whenever the file is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    len: u64,
    inode: u64,
    mtime_ns: i128,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &PhasegatePaths) -> Self {
        Self {
            root: paths.root.clone(),
            state_path: paths.state_path.clone(),
            lock_path: paths.state_lock_path.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclusive lock serializing load-apply-save across processes.
    pub fn lock(&self) -> Result<FileLock, StoreError> {
        lock_exclusive(&self.lock_path).map_err(|err| StoreError::io("lock", &self.lock_path, err))
    }

    /// Load the current state. Absent or corrupt files yield `Ok(None)`.
    pub fn load(&self) -> Result<Option<WorkflowState>, StoreError> {
        let contents = match fs::read_to_string(&self.state_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(
                    path = %self.state_path.display(),
                    err = %err,
                    "state file unreadable; treating as no workflow"
                );
                return Ok(None);
            }
        };
        let state = match parse_state(&contents, Utc::now()) {
            Ok(state) => state,
            Err(reason) => {
                warn!(path = %self.state_path.display(), %reason, "corrupt state file ignored");
                return Ok(None);
            }
        };
        self.check_root(&state.workspace_root)?;
        debug!(workflow = %state.workflow_type, phase = ?state.current_phase, "state loaded");
        Ok(Some(state))
    }

    /// Atomically replace the state file (temp file, fsync, rename).
    pub fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        self.check_root(&state.workspace_root)?;
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        write_atomic(&self.state_path, buf.as_bytes())?;
        debug!(path = %self.state_path.display(), phase = ?state.current_phase, "state saved");
        Ok(())
    }

    /// Remove the state file. Missing files are fine.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.state_path) {
            Ok(()) => {
                debug!(path = %self.state_path.display(), "state cleared");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io("remove", &self.state_path, err)),
        }
    }

    /// Persist the engine's decision.
    pub fn commit(&self, next: &Next) -> Result<(), StoreError> {
        match next {
            Next::Unchanged => Ok(()),
            Next::Replace(state) => self.save(state),
            Next::Clear => self.clear(),
        }
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        let meta = fs::metadata(&self.state_path).ok()?;
        Some(Fingerprint {
            len: meta.len(),
            inode: meta.ino(),
            mtime_ns: i128::from(meta.mtime()) * 1_000_000_000 + i128::from(meta.mtime_nsec()),
        })
    }

    fn check_root(&self, found: &Path) -> Result<(), StoreError> {
        if found == self.root {
            return Ok(());
        }
        Err(StoreError::WorkspaceMismatch {
            expected: self.root.clone(),
            found: found.to_path_buf(),
        })
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::io("resolve parent of", path, io::ErrorKind::NotFound.into()))?;
    fs::create_dir_all(parent).map_err(|err| StoreError::io("create directory", parent, err))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file =
        File::create(&tmp_path).map_err(|err| StoreError::io("create temp", &tmp_path, err))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|err| StoreError::io("write temp", &tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| StoreError::io("replace", path, err))?;
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Parse, upgrade, schema-check and deserialize raw file contents.
pub fn parse_state(contents: &str, now: DateTime<Utc>) -> Result<WorkflowState, String> {
    let value: Value = serde_json::from_str(contents).map_err(|err| format!("parse: {}", err))?;
    let value = upgrade(value, now)?;
    validate_schema(&value)?;
    serde_json::from_value(value).map_err(|err| format!("deserialize: {}", err))
}

fn validate_schema(value: &Value) -> Result<(), String> {
    let schema: Value =
        serde_json::from_str(STATE_SCHEMA).map_err(|err| format!("parse schema: {}", err))?;
    let compiled = validator_for(&schema).map_err(|err| format!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(format!("schema validation failed: {}", messages.join("; ")))
}

/// Migrate an older state document to the current schema version.
///
/// Files without `schema_version` are version 1. They use `forge_active`, a
/// numeric `phase`, epoch-second timestamps (`ts`, `design_confirmed_at`),
/// `git_sha` on rollback points and bare booleans for gates. Keys with no
/// current counterpart are dropped.
pub fn upgrade(value: Value, now: DateTime<Utc>) -> Result<Value, String> {
    let version = match value.get("schema_version") {
        None => 1,
        Some(raw) => raw
            .as_u64()
            .ok_or_else(|| format!("schema_version is not an integer: {}", raw))?,
    };
    match version {
        1 => upgrade_v1(value, now),
        v if v == u64::from(SCHEMA_VERSION) => Ok(value),
        other => Err(format!("unsupported schema_version {}", other)),
    }
}

/// Top-level keys of a current document.
const V2_KEYS: [&str; 16] = [
    "schema_version",
    "workflow_type",
    "active",
    "current_phase",
    "phase_status",
    "gates_passed",
    "validations",
    "checkpoints",
    "confirmed",
    "confirmed_at",
    "design_hash",
    "requires_reconfirmation",
    "rollback_points",
    "workspace_root",
    "created_at",
    "updated_at",
];

fn upgrade_v1(value: Value, now: DateTime<Utc>) -> Result<Value, String> {
    let Value::Object(mut map) = value else {
        return Err("state is not a JSON object".to_string());
    };
    if let Some(active) = map.remove("forge_active") {
        map.entry("active").or_insert(active);
    }
    let active = map.get("active").and_then(Value::as_bool).unwrap_or(false);

    let legacy_phase = match map.remove("phase") {
        Some(raw) => Some(raw),
        None => map.remove("current_phase"),
    };
    let current = match legacy_phase {
        Some(raw) => legacy_phase_value(&raw)?,
        None => None,
    };
    // A never-activated v1 file sits at phase 0 without having started it.
    let current = current.filter(|phase| active || phase.index() > 0);
    map.insert("current_phase".to_string(), json!(current));
    if !map.contains_key("phase_status") {
        map.insert("phase_status".to_string(), legacy_phase_status(current));
    }

    if let Some(raw) = map.remove("design_confirmed_at") {
        let confirmed_at = legacy_timestamp(&raw)?;
        map.entry("confirmed_at").or_insert(json!(confirmed_at));
    }
    if let Some(Value::Object(gates)) = map.get_mut("gates_passed") {
        for record in gates.values_mut() {
            if let Value::Bool(passed) = record {
                *record = json!({ "passed": *passed, "evidence": null });
            }
        }
    }
    if let Some(Value::Array(points)) = map.get_mut("checkpoints") {
        for point in points.iter_mut() {
            *point = legacy_checkpoint(point, now)?;
        }
    }
    if let Some(Value::Array(points)) = map.get_mut("rollback_points") {
        for point in points.iter_mut() {
            *point = legacy_rollback_point(point, now)?;
        }
    }

    let defaults = [
        ("workflow_type", json!("skill_creation")),
        ("active", json!(false)),
        ("gates_passed", json!({})),
        ("validations", json!({})),
        ("checkpoints", json!([])),
        ("confirmed", json!(false)),
        ("confirmed_at", Value::Null),
        ("design_hash", Value::Null),
        ("requires_reconfirmation", json!(false)),
        ("rollback_points", json!([])),
        ("created_at", json!(now)),
        ("updated_at", json!(now)),
    ];
    for (key, default) in defaults {
        map.entry(key).or_insert(default);
    }
    map.insert("schema_version".to_string(), json!(SCHEMA_VERSION));

    let dropped: Vec<String> = map
        .keys()
        .filter(|key| !V2_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();
    if !dropped.is_empty() {
        debug!(keys = ?dropped, "dropping legacy state keys");
        map.retain(|key, _| V2_KEYS.contains(&key.as_str()));
    }
    Ok(Value::Object(map))
}

/// A v1 phase: an index into the phase order, a phase name, or null.
fn legacy_phase_value(raw: &Value) -> Result<Option<Phase>, String> {
    match raw {
        Value::Null => Ok(None),
        Value::Number(_) => {
            let index = raw
                .as_u64()
                .ok_or_else(|| format!("phase index {} is not a non-negative integer", raw))?;
            usize::try_from(index)
                .ok()
                .and_then(|idx| Phase::ALL.get(idx).copied())
                .map(Some)
                .ok_or_else(|| format!("phase index {} out of range", index))
        }
        Value::String(name) => name.parse().map(Some).map_err(|err: ProtocolError| err.message),
        other => Err(format!("unrecognized phase {}", other)),
    }
}

/// Phases before `current` are done; `current` itself is running.
fn legacy_phase_status(current: Option<Phase>) -> Value {
    let statuses: Map<String, Value> = Phase::ALL
        .into_iter()
        .map(|phase| {
            let status = match current {
                Some(current) if phase < current => "completed",
                Some(current) if phase == current => "in_progress",
                _ => "pending",
            };
            (phase.as_str().to_string(), json!(status))
        })
        .collect();
    Value::Object(statuses)
}

/// Epoch seconds (or an already-formatted timestamp) as RFC 3339.
fn legacy_timestamp(raw: &Value) -> Result<Option<Value>, String> {
    match raw {
        Value::Null => Ok(None),
        Value::String(_) => Ok(Some(raw.clone())),
        Value::Number(_) => {
            let secs = raw
                .as_i64()
                .ok_or_else(|| format!("timestamp {} is not whole seconds", raw))?;
            DateTime::<Utc>::from_timestamp(secs, 0)
                .map(|ts| Some(json!(ts)))
                .ok_or_else(|| format!("timestamp {} out of range", secs))
        }
        other => Err(format!("unrecognized timestamp {}", other)),
    }
}

fn legacy_field(point: &Value, key: &str) -> Value {
    point.get(key).cloned().unwrap_or(Value::Null)
}

fn legacy_checkpoint(point: &Value, now: DateTime<Utc>) -> Result<Value, String> {
    if point.get("agent_name").is_some() {
        return Ok(point.clone());
    }
    let agent = legacy_field(point, "agent");
    let phase = legacy_phase_value(&legacy_field(point, "phase"))?;
    let timestamp = legacy_timestamp(&legacy_field(point, "ts"))?.unwrap_or_else(|| json!(now));
    Ok(json!({ "agent_name": agent, "phase": phase, "timestamp": timestamp }))
}

fn legacy_rollback_point(point: &Value, now: DateTime<Utc>) -> Result<Value, String> {
    if point.get("timestamp").is_some() {
        return Ok(point.clone());
    }
    let phase = legacy_phase_value(&legacy_field(point, "phase"))?;
    let timestamp = legacy_timestamp(&legacy_field(point, "ts"))?.unwrap_or_else(|| json!(now));
    Ok(json!({
        "description": legacy_field(point, "description"),
        "source_revision": legacy_field(point, "git_sha"),
        "phase": phase,
        "timestamp": timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{GateRecord, PhaseStatus, WorkflowType};
    use crate::test_support::{TEST_ROOT, TempWorkspace, at};

    /// Verifies save → load returns an identical state.
    #[test]
    fn save_then_load_round_trips() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        let mut state = ws.state_for(WorkflowType::PluginPublish);
        state.gates_passed.insert(
            "preview_reviewed".to_string(),
            GateRecord {
                passed: true,
                evidence: Some("looked".to_string()),
            },
        );
        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), Some(state));
        assert!(!ws.paths.state_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_file_is_no_workflow() {
        let ws = TempWorkspace::new();
        assert_eq!(StateStore::new(&ws.paths).load().expect("load"), None);
    }

    /// Corrupt or schema-invalid content degrades to "no workflow", never an error.
    #[test]
    fn corrupt_file_is_no_workflow() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        fs::create_dir_all(&ws.paths.phasegate_dir).expect("mkdir");
        for contents in [
            "{not json",
            "[]",
            "{\"schema_version\": 2, \"workflow_type\": \"skill_creation\"}",
            "{\"schema_version\": 9}",
        ] {
            fs::write(&ws.paths.state_path, contents).expect("write");
            assert_eq!(store.load().expect("load"), None, "{}", contents);
        }
    }

    #[test]
    fn foreign_workspace_is_mismatch() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        let mut state = ws.state_for(WorkflowType::QuickFix);
        state.workspace_root = PathBuf::from("/somewhere/else");
        assert!(matches!(
            store.save(&state),
            Err(StoreError::WorkspaceMismatch { .. })
        ));

        let mut buf = serde_json::to_string(&state).expect("serialize");
        buf.push('\n');
        fs::create_dir_all(&ws.paths.phasegate_dir).expect("mkdir");
        fs::write(&ws.paths.state_path, buf).expect("write");
        let err = store.load().expect_err("mismatch");
        assert_eq!(ProtocolError::from(err).kind, ErrorKind::WorkspaceMismatch);
    }

    #[test]
    fn clear_is_idempotent() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        store.save(&ws.state_for(WorkflowType::QuickFix)).expect("save");
        store.clear().expect("clear");
        store.clear().expect("clear again");
        assert_eq!(store.load().expect("load"), None);
    }

    #[test]
    fn fingerprint_changes_on_replace() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        assert_eq!(store.fingerprint(), None);
        let state = ws.state_for(WorkflowType::QuickFix);
        store.save(&state).expect("save");
        let first = store.fingerprint().expect("fingerprint");
        let mut next = state.clone();
        next.active = false;
        store.save(&next).expect("save");
        assert_ne!(store.fingerprint(), Some(first));
    }

    /// Ensures version-1 documents load as current states.
    #[test]
    fn v1_document_is_upgraded() {
        let ws = TempWorkspace::new();
        let store = StateStore::new(&ws.paths);
        let v1 = json!({
            "workflow_type": "quick_fix",
            "forge_active": true,
            "current_phase": 1,
            "gates_passed": { "execution_complete": true },
            "workspace_root": ws.root(),
        });
        fs::create_dir_all(&ws.paths.phasegate_dir).expect("mkdir");
        fs::write(&ws.paths.state_path, v1.to_string()).expect("write");

        let state = store.load().expect("load").expect("state");
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert!(state.active);
        assert_eq!(state.current_phase, Some(Phase::Analysis));
        assert!(state.is_satisfied("execution_complete"));
        assert!(state.rollback_points.is_empty());
        assert!(!state.requires_reconfirmation);
    }

    /// A freshly initialized legacy daemon file loads as an inactive workflow.
    #[test]
    fn legacy_initial_document_is_upgraded() {
        let legacy = json!({
            "forge_active": false,
            "workspace_root": TEST_ROOT,
            "phase": 0,
            "confirmed": false,
            "checkpoints": [],
            "design_hash": null,
            "design_confirmed_at": null,
            "requires_reconfirmation": false,
            "rollback_points": []
        });

        let state = parse_state(&legacy.to_string(), at(0)).expect("upgrade");
        assert!(!state.active);
        assert_eq!(state.current_phase, None);
        assert_eq!(state.phase_status(Phase::Input), PhaseStatus::Pending);
        assert_eq!(state.confirmed_at, None);
        assert_eq!(state.created_at, at(0));
    }

    /// Mid-workflow legacy files keep phase, confirmation, history and rollback points.
    #[test]
    fn legacy_active_document_is_upgraded() {
        let legacy = json!({
            "forge_active": true,
            "workspace_root": TEST_ROOT,
            "phase": 4,
            "confirmed": true,
            "checkpoints": [
                { "phase": 0, "agent": "forge:input-agent", "ts": 1_700_000_000 },
                { "phase": 1, "agent": "forge:analysis-agent", "ts": 1_700_000_060 }
            ],
            "design_hash": "abc123",
            "design_confirmed_at": 1_700_000_120,
            "requires_reconfirmation": false,
            "rollback_points": [
                { "phase": 1, "description": "d", "ts": 1_700_000_000, "git_sha": null },
                {
                    "phase": 3,
                    "description": "pre-exec",
                    "ts": 1_700_000_100,
                    "git_sha": "deadbeef"
                }
            ],
            "session_id": "legacy-only"
        });

        let state = parse_state(&legacy.to_string(), at(0)).expect("upgrade");
        assert!(state.active);
        assert!(state.confirmed);
        assert_eq!(state.current_phase, Some(Phase::Execute));
        assert_eq!(state.phase_status(Phase::Preview), PhaseStatus::Completed);
        assert_eq!(state.phase_status(Phase::Execute), PhaseStatus::InProgress);
        assert_eq!(state.phase_status(Phase::Validation), PhaseStatus::Pending);
        assert_eq!(
            state.confirmed_at,
            DateTime::<Utc>::from_timestamp(1_700_000_120, 0)
        );
        assert_eq!(state.design_hash.as_deref(), Some("abc123"));

        assert_eq!(state.checkpoints.len(), 2);
        assert_eq!(state.checkpoints[1].agent_name, "forge:analysis-agent");
        assert_eq!(state.checkpoints[1].phase, Some(Phase::Analysis));

        let points = &state.rollback_points;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].source_revision, None);
        assert_eq!(points[1].source_revision.as_deref(), Some("deadbeef"));
        assert_eq!(points[1].phase, Some(Phase::Preview));
        assert_eq!(
            Some(points[0].timestamp),
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0)
        );
    }

    #[test]
    fn upgrade_rejects_future_versions() {
        let err = upgrade(json!({ "schema_version": 3 }), at(0)).expect_err("future");
        assert!(err.contains("unsupported"));
    }
}
