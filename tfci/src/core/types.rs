//! Run records and the enums that describe them.
//!
//! These types are the stable on-disk and over-the-wire contract for run
//! history. Field names serialize camelCase and enum values PascalCase so the
//! dashboard can consume them unchanged.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a run, unique within a state directory.
pub type RunId = u64;

/// Which provisioning operation a run performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunKind {
    /// Read-only preview of infrastructure changes.
    #[default]
    Plan,
    /// Changes real infrastructure.
    Apply,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// True once the run can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// What caused a run to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    /// An operator asked for it over HTTP.
    Manual,
    /// The change watcher saw the checkout move.
    ChangeDetected,
    /// Baseline plan issued when the daemon comes up.
    StartupRecovery,
}

impl Trigger {
    /// Automatic triggers queue behind a busy scheduler instead of failing.
    pub fn is_queueable(self) -> bool {
        !matches!(self, Trigger::Manual)
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunKind::Plan => "Plan",
            RunKind::Apply => "Apply",
        })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        })
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Manual => "Manual",
            Trigger::ChangeDetected => "ChangeDetected",
            Trigger::StartupRecovery => "StartupRecovery",
        })
    }
}

/// One attempt to plan or apply the checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub triggered_by: Trigger,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Unset while the run is Pending or Running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Only set when a provisioning process actually exited.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr of the provisioning process.
    pub log_path: PathBuf,
    /// Why the run ended the way it did, when that is not obvious.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Checkout revision at request time, if the checkout is a git repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl RunRecord {
    /// A freshly requested run in the Pending state.
    pub fn pending(id: RunId, kind: RunKind, triggered_by: Trigger, log_path: PathBuf) -> Self {
        Self {
            id,
            kind,
            status: RunStatus::Pending,
            triggered_by,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            log_path,
            note: None,
            revision: None,
        }
    }
}
