//! Run status transitions.
//!
//! Allowed edges:
//! - `Pending -> Running | Succeeded | Cancelled`
//! - `Running -> Succeeded | Failed`
//!
//! `Pending -> Succeeded` covers plan requests that are satisfied without
//! running anything (plan runs disabled). Terminal statuses never change.
//! Running runs cannot be cancelled.

use thiserror::Error;

use crate::core::types::RunStatus;

/// A status change that the run lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Validate a single status change.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), InvalidTransition> {
    use RunStatus::{Cancelled, Failed, Pending, Running, Succeeded};

    let allowed = matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Succeeded)
            | (Pending, Cancelled)
            | (Running, Succeeded)
            | (Running, Failed)
    );
    if allowed {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}
