//! Workspace configuration stored under `.phasegate/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Phasegate configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values in
/// [`PhasegateConfig::default`]; a missing file is the same as an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhasegateConfig {
    /// Daemon exits after this many seconds without a request.
    pub idle_timeout_secs: u64,

    /// Per-request read/write timeout on the client socket.
    pub request_timeout_ms: u64,

    /// Total time a client waits for a freshly spawned daemon to bind.
    pub spawn_budget_ms: u64,

    /// If false, clients never spawn a daemon and go straight to the fallback.
    pub spawn_daemon: bool,

    /// Truncate validator stdout/stderr beyond this many bytes.
    pub validator_output_limit_bytes: usize,

    /// Commands behind `hook run-validation <name>`.
    pub validators: BTreeMap<String, ValidatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Argv of the validator (e.g. `["cargo","test"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
        }
    }
}

impl Default for PhasegateConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            request_timeout_ms: 3_000,
            spawn_budget_ms: 2_000,
            spawn_daemon: true,
            validator_output_limit_bytes: 100_000,
            validators: BTreeMap::new(),
        }
    }
}

impl PhasegateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            return Err(anyhow!("idle_timeout_secs must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(anyhow!("request_timeout_ms must be > 0"));
        }
        if self.validator_output_limit_bytes == 0 {
            return Err(anyhow!("validator_output_limit_bytes must be > 0"));
        }
        for (name, validator) in &self.validators {
            if validator.command.is_empty() || validator.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "validators.{}.command must be a non-empty array",
                    name
                ));
            }
            if validator.timeout_secs == 0 {
                return Err(anyhow!("validators.{}.timeout_secs must be > 0", name));
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn spawn_budget(&self) -> Duration {
        Duration::from_millis(self.spawn_budget_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PhasegateConfig::default()`.
pub fn load_config(path: &Path) -> Result<PhasegateConfig> {
    if !path.exists() {
        return Ok(PhasegateConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PhasegateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
