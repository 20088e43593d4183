//! Error taxonomy for the workflow engine and its adapters.
//!
//! Orchestration code returns `anyhow::Result`; the types here are the ones
//! callers branch on (via `downcast_ref`) or that get recorded in the audit log.

use thiserror::Error;

use crate::core::types::{ErrorKind, RunStatus};

/// Workflow-level failures, each mapped to a stable [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("planning error: {0}")]
    Planning(String),

    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    #[error("language model returned a malformed response: {0}")]
    LlmMalformedResponse(String),

    #[error("approval request '{0}' timed out")]
    ApprovalTimeout(String),

    #[error("iteration ceiling of {max_iterations} reached")]
    LoopBudgetExceeded { max_iterations: u32 },
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Planning(_) => ErrorKind::PlanningError,
            WorkflowError::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            WorkflowError::LlmUnavailable(_) => ErrorKind::LlmUnavailable,
            WorkflowError::LlmMalformedResponse(_) => ErrorKind::LlmMalformedResponse,
            WorkflowError::ApprovalTimeout(_) => ErrorKind::ApprovalTimeout,
            WorkflowError::LoopBudgetExceeded { .. } => ErrorKind::LoopBudgetExceeded,
        }
    }
}

/// Failures surfaced by a language-model client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    #[error("llm unavailable: {0}")]
    Unavailable(String),

    #[error("llm malformed response: {0}")]
    MalformedResponse(String),
}

impl From<LlmError> for WorkflowError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(msg) => WorkflowError::LlmUnavailable(msg),
            LlmError::MalformedResponse(msg) => WorkflowError::LlmMalformedResponse(msg),
        }
    }
}

/// Infrastructure failures of the execution sandbox (not command failures).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox workspace not mounted")]
    NotMounted,

    #[error("sandbox workspace {0} does not exist")]
    MissingWorkspace(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Errors a worker node can raise instead of returning a transition.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Language model stayed unavailable or malformed past the retry bound.
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `advance` was called on a run that already reached a terminal position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run '{run_id}' already finished with status {}", .status.as_str())]
pub struct RunFinishedError {
    pub run_id: String,
    pub status: RunStatus,
}

/// `resolve` named a request that is not the run's pending approval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run '{run_id}' has no pending approval '{request_id}'")]
pub struct UnknownApprovalError {
    pub run_id: String,
    pub request_id: String,
}

/// A node returned an edge the fixed topology does not define.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no edge '{edge}' from node '{node}'")]
pub struct TopologyError {
    pub node: String,
    pub edge: String,
}

/// A delta failed validation and was not committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rejected delta from '{node}': {}", .errors.join("; "))]
pub struct DeltaRejectedError {
    pub node: String,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_errors_map_to_taxonomy() {
        let unavailable: WorkflowError = LlmError::Unavailable("down".to_string()).into();
        assert_eq!(unavailable.kind(), ErrorKind::LlmUnavailable);
        let malformed: WorkflowError = LlmError::MalformedResponse("bad".to_string()).into();
        assert_eq!(malformed.kind(), ErrorKind::LlmMalformedResponse);
        assert_eq!(
            WorkflowError::LoopBudgetExceeded { max_iterations: 3 }.to_string(),
            "iteration ceiling of 3 reached"
        );
    }
}
