//! Provisioner configuration stored under `<state>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::RunKind;

/// How the daemon drives the provisioning tool (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// running `terraform` from `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Command line for plan runs (program followed by arguments).
    pub plan_command: Vec<String>,

    /// Command line for apply runs.
    pub apply_command: Vec<String>,

    /// How often the change watcher inspects the checkout.
    pub poll_interval_secs: u64,

    /// Log a warning once a run has been going for this long. Runs are never killed.
    pub slow_run_warn_secs: u64,

    /// Request a baseline plan once the server is up.
    pub plan_on_startup: bool,

    /// Number of records returned as history by the status endpoint.
    pub history_limit: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            plan_command: vec![
                "terraform".to_string(),
                "plan".to_string(),
                "-input=false".to_string(),
                "-no-color".to_string(),
            ],
            apply_command: vec![
                "terraform".to_string(),
                "apply".to_string(),
                "-input=false".to_string(),
                "-auto-approve".to_string(),
                "-no-color".to_string(),
            ],
            poll_interval_secs: 30,
            slow_run_warn_secs: 30 * 60,
            plan_on_startup: true,
            history_limit: 20,
        }
    }
}

impl ProvisionerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plan_command.is_empty() || self.plan_command[0].trim().is_empty() {
            return Err(anyhow!("plan_command must be a non-empty array"));
        }
        if self.apply_command.is_empty() || self.apply_command[0].trim().is_empty() {
            return Err(anyhow!("apply_command must be a non-empty array"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.slow_run_warn_secs == 0 {
            return Err(anyhow!("slow_run_warn_secs must be > 0"));
        }
        if self.history_limit == 0 {
            return Err(anyhow!("history_limit must be > 0"));
        }
        Ok(())
    }

    pub fn command_for(&self, kind: RunKind) -> &[String] {
        match kind {
            RunKind::Plan => &self.plan_command,
            RunKind::Apply => &self.apply_command,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn slow_run_warning(&self) -> Duration {
        Duration::from_secs(self.slow_run_warn_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ProvisionerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ProvisionerConfig> {
    if !path.exists() {
        let cfg = ProvisionerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ProvisionerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
