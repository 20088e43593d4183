//! Deterministic, pure logic shared by the workflow engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod invariants;
pub mod path;
pub mod selector;
pub mod state_update;
pub mod topology;
pub mod types;
