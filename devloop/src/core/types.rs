//! Shared deterministic types for the workflow core.
//!
//! These types define stable contracts between the engine, the worker nodes
//! and the persisted checkpoints. They carry no I/O and serialize stably.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::design::{DesignDocument, DesignRef};
use crate::roadmap::{ItemStatus, Roadmap};

/// The closed set of worker nodes in the fixed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Documentation,
    Planner,
    Architect,
    Coder,
    Tester,
    Integration,
    LogAnalyst,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Documentation,
        NodeKind::Planner,
        NodeKind::Architect,
        NodeKind::Coder,
        NodeKind::Tester,
        NodeKind::Integration,
        NodeKind::LogAnalyst,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Documentation => "documentation",
            NodeKind::Planner => "planner",
            NodeKind::Architect => "architect",
            NodeKind::Coder => "coder",
            NodeKind::Tester => "tester",
            NodeKind::Integration => "integration",
            NodeKind::LogAnalyst => "log_analyst",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current graph position: a worker node or one of the two terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Documentation,
    Planner,
    Architect,
    Coder,
    Tester,
    Integration,
    LogAnalyst,
    End,
    Failed,
}

impl Position {
    /// Worker bound to this position (`None` for terminals).
    pub fn node(self) -> Option<NodeKind> {
        match self {
            Position::Documentation => Some(NodeKind::Documentation),
            Position::Planner => Some(NodeKind::Planner),
            Position::Architect => Some(NodeKind::Architect),
            Position::Coder => Some(NodeKind::Coder),
            Position::Tester => Some(NodeKind::Tester),
            Position::Integration => Some(NodeKind::Integration),
            Position::LogAnalyst => Some(NodeKind::LogAnalyst),
            Position::End | Position::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.node().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self.node() {
            Some(node) => node.as_str(),
            None if self == Position::End => "end",
            None => "failed",
        }
    }
}

impl From<NodeKind> for Position {
    fn from(node: NodeKind) -> Self {
        match node {
            NodeKind::Documentation => Position::Documentation,
            NodeKind::Planner => Position::Planner,
            NodeKind::Architect => Position::Architect,
            NodeKind::Coder => Position::Coder,
            NodeKind::Tester => Position::Tester,
            NodeKind::Integration => Position::Integration,
            NodeKind::LogAnalyst => Position::LogAnalyst,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Waiting on an external approval decision.
    Suspended,
    /// Halted because the language model stayed unavailable; resumable.
    Degraded,
    /// Halted by a node-level error past its retry bound; resumable.
    Halted,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Suspended => "suspended",
            RunStatus::Degraded => "degraded",
            RunStatus::Halted => "halted",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Stable labels for the error taxonomy, recorded in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlanningError,
    ExecutionFailure,
    LlmUnavailable,
    LlmMalformedResponse,
    ApprovalTimeout,
    ApprovalRejected,
    LoopBudgetExceeded,
    RoadmapStalled,
    InvalidDesign,
    Aborted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PlanningError => "planning_error",
            ErrorKind::ExecutionFailure => "execution_failure",
            ErrorKind::LlmUnavailable => "llm_unavailable",
            ErrorKind::LlmMalformedResponse => "llm_malformed_response",
            ErrorKind::ApprovalTimeout => "approval_timeout",
            ErrorKind::ApprovalRejected => "approval_rejected",
            ErrorKind::LoopBudgetExceeded => "loop_budget_exceeded",
            ErrorKind::RoadmapStalled => "roadmap_stalled",
            ErrorKind::InvalidDesign => "invalid_design",
            ErrorKind::Aborted => "aborted",
        }
    }
}

/// Named edge returned by a node alongside its delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "edge", rename_all = "snake_case")]
pub enum Transition {
    Continue,
    /// Re-enter the same node; the bounded counter travels in the delta.
    Retry,
    /// Architect found nothing eligible.
    LoopDone,
    /// The current work item failed.
    TaskFailed,
    /// An approval request is pending.
    Suspended,
    /// An approval was rejected or expired.
    Rejected { rollback_to: NodeKind },
    /// Stop the run in a resumable halted state.
    Halt { kind: ErrorKind, reason: String },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Continue => "continue",
            Transition::Retry => "retry",
            Transition::LoopDone => "loop_done",
            Transition::TaskFailed => "task_failed",
            Transition::Suspended => "suspended",
            Transition::Rejected { .. } => "rejected",
            Transition::Halt { .. } => "halt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Untracked,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
            ChangeKind::Untracked => "untracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change: ChangeKind,
}

/// File-change summary reported by the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub files: Vec<FileChange>,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// One line per file, `<change> <path>`.
    pub fn render(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("{} {}", f.change.as_str(), f.path))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Outcome of one sandbox command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// True if either stream was cut at the output limit.
    pub truncated: bool,
    pub diff: DiffSummary,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Result for a command that never produced output (spawn or session errors).
    pub fn sandbox_error(command: &str, message: &str) -> Self {
        Self {
            command: command.to_string(),
            exit_code: None,
            timed_out: false,
            stdout: String::new(),
            stderr: message.to_string(),
            truncated: false,
            diff: DiffSummary::default(),
            duration_ms: 0,
        }
    }

    /// Last `max_bytes` of combined output, for feeding back into prompts.
    pub fn failure_tail(&self, max_bytes: usize) -> String {
        let mut buf = format!(
            "$ {}\nexit={}{}\n",
            self.command,
            self.exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            if self.timed_out { " (timed out)" } else { "" }
        );
        buf.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            buf.push_str("\n--- stderr ---\n");
            buf.push_str(&self.stderr);
        }
        if buf.len() <= max_bytes {
            return buf;
        }
        let mut start = buf.len() - max_bytes;
        while !buf.is_char_boundary(start) {
            start += 1;
        }
        buf[start..].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One streamed log line from the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
}

/// What an approval is being asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalPayload {
    Commands {
        commands: Vec<String>,
    },
    Push {
        branch: String,
        message: String,
        diff: DiffSummary,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved {
        at: DateTime<Utc>,
        /// Replacement payload supplied with an `edit` decision.
        edited: Option<String>,
    },
    Rejected {
        at: DateTime<Utc>,
        reason: String,
    },
    Expired {
        at: DateTime<Utc>,
    },
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Pending => "pending",
            Resolution::Approved { .. } => "approved",
            Resolution::Rejected { .. } => "rejected",
            Resolution::Expired { .. } => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub requested_by: NodeKind,
    pub task_id: Option<String>,
    pub summary: String,
    pub payload: ApprovalPayload,
    /// Node to re-enter when the request is rejected or expires.
    pub rollback_to: NodeKind,
    pub created_at: DateTime<Utc>,
    pub resolution: Resolution,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.resolution == Resolution::Pending
    }
}

/// External human decision on a pending approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject { reason: String },
    /// Approve with a replacement payload (commit message or command list).
    Edit { payload: String },
}

/// Output recorded per node and iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: NodeKind,
    pub iteration: u32,
    pub task_id: Option<String>,
    pub design: DesignRef,
    pub summary: String,
    pub detail: serde_json::Value,
}

impl NodeRecord {
    pub fn key(&self) -> String {
        output_key(self.node, self.iteration)
    }
}

pub fn output_key(node: NodeKind, iteration: u32) -> String {
    format!("{node}@{iteration}")
}

/// Bounded retry counters carried through deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    pub planner: u32,
    pub coder: u32,
}

/// Tri-state field update inside a [`StateDelta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for Update<T> {
    fn default() -> Self {
        Update::Keep
    }
}

impl<T> Update<T> {
    pub fn apply_to(self, slot: &mut Option<T>) {
        match self {
            Update::Keep => {}
            Update::Set(value) => *slot = Some(value),
            Update::Clear => *slot = None,
        }
    }
}

/// Status change for one roadmap item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub id: String,
    pub status: ItemStatus,
    /// Count this change against the item's retry budget.
    pub bump_attempts: bool,
}

/// Error a node recovered from (or surfaced), recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeErrorNote {
    pub kind: ErrorKind,
    pub message: String,
}

/// State changes proposed by a node. Only the engine commits them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub design_revision: Option<DesignDocument>,
    pub roadmap: Option<Roadmap>,
    pub item_updates: Vec<ItemUpdate>,
    pub current_task: Update<String>,
    pub retries: Option<RetryCounters>,
    pub remediation_hint: Update<String>,
    pub results: Option<Vec<ExecutionResult>>,
    pub output: Option<NodeRecord>,
    pub approval: Update<ApprovalRequest>,
    pub errors: Vec<NodeErrorNote>,
}

impl StateDelta {
    pub fn with_output(mut self, output: NodeRecord) -> Self {
        self.output = Some(output);
        self
    }

    pub fn item(&mut self, id: &str, status: ItemStatus, bump_attempts: bool) {
        self.item_updates.push(ItemUpdate {
            id: id.to_string(),
            status,
            bump_attempts,
        });
    }

    pub fn error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(NodeErrorNote {
            kind,
            message: message.into(),
        });
    }
}

/// What a node returns: a delta and the edge to follow.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub delta: StateDelta,
    pub transition: Transition,
}

impl NodeOutcome {
    pub fn new(delta: StateDelta, transition: Transition) -> Self {
        Self { delta, transition }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_map_to_nodes() {
        for node in NodeKind::ALL {
            assert_eq!(Position::from(node).node(), Some(node));
        }
        assert!(Position::End.is_terminal());
        assert_eq!(Position::Failed.as_str(), "failed");
    }

    #[test]
    fn failure_tail_keeps_the_end() {
        let result = ExecutionResult {
            command: "make".to_string(),
            exit_code: Some(2),
            timed_out: false,
            stdout: "a".repeat(100),
            stderr: "boom".to_string(),
            truncated: false,
            diff: DiffSummary::default(),
            duration_ms: 5,
        };
        let tail = result.failure_tail(20);
        assert!(tail.len() <= 20);
        assert!(tail.ends_with("boom"));
        assert!(!result.success());
    }

    #[test]
    fn update_apply_to_sets_and_clears() {
        let mut slot = Some(1);
        Update::Keep.apply_to(&mut slot);
        assert_eq!(slot, Some(1));
        Update::Set(2).apply_to(&mut slot);
        assert_eq!(slot, Some(2));
        Update::<i32>::Clear.apply_to(&mut slot);
        assert_eq!(slot, None);
    }
}
