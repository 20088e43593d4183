//! The seven worker nodes and their dispatch table.
//!
//! Every node is a function of a read-only [`RunState`] and the injected
//! [`Capabilities`] that returns a [`NodeOutcome`]: a proposed delta plus the
//! edge to follow. Nodes never mutate the run; the engine commits deltas.

pub mod architect;
pub mod coder;
pub mod documentation;
pub mod integration;
pub mod log_analyst;
pub mod planner;
pub mod tester;

use regex::Regex;
use serde_json::Value;

use crate::core::types::{ExecutionResult, NodeKind, NodeOutcome, NodeRecord};
use crate::error::NodeError;
use crate::io::clock::Clock;
use crate::io::config::EngineConfig;
use crate::io::git::VersionControl;
use crate::io::llm::{LlmClient, RetryPolicy};
use crate::io::prompt::PromptBuilder;
use crate::io::sandbox::SandboxClient;
use crate::state::RunState;

/// External collaborators handed to each node invocation.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub llm: &'a dyn LlmClient,
    pub sandbox: &'a dyn SandboxClient,
    pub vcs: &'a dyn VersionControl,
    pub clock: &'a dyn Clock,
}

/// Everything a node may read besides the run state.
pub struct NodeEnv<'a> {
    pub caps: Capabilities<'a>,
    pub cfg: &'a EngineConfig,
    pub prompts: &'a PromptBuilder,
    /// Compiled `approval.sensitive_commands`.
    pub sensitive: &'a [Regex],
}

impl NodeEnv<'_> {
    pub fn llm_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.cfg.llm)
    }
}

/// True if the node talks to the sandbox and needs a mounted workspace.
pub fn uses_sandbox(node: NodeKind) -> bool {
    match node {
        NodeKind::Coder | NodeKind::Tester | NodeKind::Integration | NodeKind::LogAnalyst => true,
        NodeKind::Documentation | NodeKind::Planner | NodeKind::Architect => false,
    }
}

/// Run the worker bound to `node`.
pub fn dispatch(node: NodeKind, state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    match node {
        NodeKind::Documentation => documentation::run(state),
        NodeKind::Planner => planner::run(state, env),
        NodeKind::Architect => architect::run(state, env),
        NodeKind::Coder => coder::run(state, env),
        NodeKind::Tester => tester::run(state, env),
        NodeKind::Integration => integration::run(state, env),
        NodeKind::LogAnalyst => log_analyst::run(state, env),
    }
}

/// Output record for `node` in the current iteration, referencing the design.
pub(crate) fn record(
    state: &RunState,
    node: NodeKind,
    summary: impl Into<String>,
    detail: Value,
) -> NodeRecord {
    NodeRecord {
        node,
        iteration: state.iteration,
        task_id: state.current_task.clone(),
        design: state.design.reference(),
        summary: summary.into(),
        detail,
    }
}

/// The current work item id, or an error for nodes that need one.
pub(crate) fn current_task(state: &RunState, node: NodeKind) -> Result<String, NodeError> {
    state
        .current_task
        .clone()
        .ok_or_else(|| NodeError::Other(anyhow::anyhow!("{node} has no current task")))
}

/// Run commands in order, stopping after the first failure.
pub(crate) fn run_commands(env: &NodeEnv<'_>, commands: &[String]) -> Vec<ExecutionResult> {
    let timeout = env.cfg.command_timeout();
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let result = env
            .caps
            .sandbox
            .run(command, timeout)
            .unwrap_or_else(|err| ExecutionResult::sandbox_error(command, &err.to_string()));
        let ok = result.success();
        results.push(result);
        if !ok {
            break;
        }
    }
    results
}
