//! Run orchestration core for the terraform-ci daemon.
//!
//! The daemon watches an infrastructure-as-code checkout and runs the
//! provisioning tool's plan/apply cycle against it, one run at a time. The
//! crate is split the same way the daemon is:
//!
//! - **[`core`]**: Pure, deterministic logic (run records, status transitions).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state directory, git, process execution).
//!   Isolated behind small types and traits so tests can substitute them.
//!
//! [`scheduler`] coordinates core logic with I/O to enforce the
//! single-run-at-a-time invariant. [`registry`] lets feature modules contribute
//! to the HTTP server without the server knowing them up front.

pub mod config;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
