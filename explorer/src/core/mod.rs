//! Deterministic, pure logic shared by the exploration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cycle_guard;
pub mod fingerprint;
pub mod hierarchy;
pub mod history;
pub mod prioritizer;
pub mod progress;
pub mod types;
