//! Stable exit codes for the daemon binary.

/// Clean shutdown.
pub const OK: i32 = 0;
/// Invalid configuration or usage (e.g. no checkout directory).
pub const USAGE: i32 = 1;
/// The daemon could not start or stopped on an unrecoverable error.
pub const FATAL: i32 = 2;
