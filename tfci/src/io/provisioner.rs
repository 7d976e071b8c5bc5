//! Provisioner abstraction for plan/apply invocation.
//!
//! The [`Provisioner`] trait decouples the scheduler from the actual
//! provisioning backend (a configurable `terraform` command line). Tests use
//! scripted provisioners that return predetermined exit codes without spawning
//! processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::{RunId, RunKind};
use crate::io::config::ProvisionerConfig;
use crate::io::process::run_streaming;

/// Parameters for one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub run_id: RunId,
    pub kind: RunKind,
    /// Working directory: the checkout.
    pub workdir: PathBuf,
    /// Where combined stdout/stderr must be written.
    pub log_path: PathBuf,
    /// Warn (but keep waiting) once the run takes longer than this.
    pub slow_after: Duration,
}

/// How a provisioning process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub slow: bool,
}

impl ProvisionOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            slow: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Abstraction over provisioning backends.
pub trait Provisioner: Send + Sync {
    /// Run to completion. Errors mean the process could not be run at all;
    /// a non-zero exit is a normal [`ProvisionOutcome`].
    fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome>;
}

/// Provisioner that spawns the configured command line.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    config: ProvisionerConfig,
}

impl CommandProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Provisioner for CommandProvisioner {
    #[instrument(skip_all, fields(run_id = request.run_id, kind = %request.kind))]
    fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let line = self.config.command_for(request.kind);
        let (program, args) = line
            .split_first()
            .ok_or_else(|| anyhow!("empty {} command", request.kind))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting provisioner");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("TF_IN_AUTOMATION", "1");

        let output = run_streaming(cmd, &request.log_path, request.slow_after)
            .with_context(|| format!("run {} command `{}`", request.kind, line.join(" ")))?;

        let elapsed_secs = output.elapsed.as_secs();
        if output.status.success() {
            info!(elapsed_secs, bytes_logged = output.bytes_logged, "provisioner finished");
        } else {
            warn!(exit_code = ?output.status.code(), elapsed_secs, "provisioner exited unsuccessfully");
        }
        Ok(ProvisionOutcome {
            exit_code: output.status.code(),
            slow: output.slow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(workdir: &std::path::Path, kind: RunKind) -> ProvisionRequest {
        ProvisionRequest {
            run_id: 1,
            kind,
            workdir: workdir.to_path_buf(),
            log_path: workdir.join("logs").join("1.log"),
            slow_after: Duration::from_secs(30),
        }
    }

    fn sh_config(plan: &str, apply: &str) -> ProvisionerConfig {
        ProvisionerConfig {
            plan_command: vec!["sh".to_string(), "-c".to_string(), plan.to_string()],
            apply_command: vec!["sh".to_string(), "-c".to_string(), apply.to_string()],
            ..ProvisionerConfig::default()
        }
    }

    #[test]
    fn runs_kind_specific_command_in_checkout() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("main.tf"), "").expect("write");
        let provisioner = CommandProvisioner::new(&sh_config("ls; echo plan", "echo apply"));

        let outcome = provisioner
            .provision(&request(temp.path(), RunKind::Plan))
            .expect("provision");

        assert!(outcome.succeeded());
        let log = std::fs::read_to_string(temp.path().join("logs/1.log")).expect("log");
        assert!(log.contains("main.tf"));
        assert!(log.contains("plan"));
        assert!(!log.contains("apply"));
    }

    #[test]
    fn non_zero_exit_is_an_outcome_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provisioner = CommandProvisioner::new(&sh_config("true", "echo denied; exit 1"));

        let outcome = provisioner
            .provision(&request(temp.path(), RunKind::Apply))
            .expect("provision");

        assert_eq!(outcome.exit_code, Some(1));
        assert!(!outcome.succeeded());
    }

    #[test]
    fn runs_with_automation_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provisioner =
            CommandProvisioner::new(&sh_config("echo auto=$TF_IN_AUTOMATION", "true"));

        provisioner
            .provision(&request(temp.path(), RunKind::Plan))
            .expect("provision");

        let log = std::fs::read_to_string(temp.path().join("logs/1.log")).expect("log");
        assert_eq!(log, "auto=1\n");
    }
}
