//! Deterministic, pure logic shared by the daemon core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod transition;
pub mod types;
