//! Side-effecting adapters used by the engine and the worker nodes.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod design_doc;
pub mod git;
pub mod init;
pub mod llm;
pub mod process;
pub mod prompt;
pub mod run_store;
pub mod sandbox;
