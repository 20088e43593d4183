//! Stateful workflow engine for autonomous software development.
//!
//! A run turns a design document into a roadmap of work items and drives a
//! fixed graph of worker nodes (Documentation, Planner, Architect, Coder,
//! Tester, Integration, Log-Analyst) over it, one node per `advance`, with a
//! checkpoint after every step and a human approval gate in front of
//! sensitive actions.
//!
//! - **[`core`]**: Pure, deterministic logic (topology, delta application,
//!   roadmap invariants, selection). No I/O.
//! - **[`io`]**: Side-effecting adapters (checkpoints, audit log, config,
//!   sandbox, language model, git). Behind traits so tests can swap in fakes.
//!
//! Orchestration modules ([`engine`], [`gate`], [`start`], [`looping`],
//! [`control`]) coordinate the two to implement CLI commands.

pub mod control;
pub mod core;
pub mod design;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod looping;
pub mod nodes;
pub mod roadmap;
pub mod start;
pub mod state;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
