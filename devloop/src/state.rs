//! Aggregate run state owned by the graph engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{
    ApprovalRequest, ErrorKind, ExecutionResult, NodeKind, NodeRecord, Position, RetryCounters,
    RunStatus,
};
use crate::design::DesignDocument;
use crate::roadmap::Roadmap;

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 1-indexed, contiguous within a run.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditKind {
    RunStarted {
        design_id: String,
        design_version: u32,
    },
    Transition {
        from: Position,
        to: Position,
        reason: String,
    },
    NodeError {
        node: NodeKind,
        kind: ErrorKind,
        message: String,
    },
    DesignRevised {
        version: u32,
        digest: String,
    },
    ApprovalRequested {
        request_id: String,
        node: NodeKind,
    },
    ApprovalResolved {
        request_id: String,
        resolution: String,
    },
    RunHalted {
        status: RunStatus,
        kind: ErrorKind,
        message: String,
    },
    RunResumed {
        from_status: RunStatus,
    },
    RunAborted {
        reason: String,
    },
    RunFinished {
        status: RunStatus,
        reason: String,
    },
}

/// The aggregate persisted in every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub position: Position,
    /// Loop iteration, starting at 1 on the first pass through Architect.
    pub iteration: u32,
    pub design: DesignDocument,
    pub roadmap: Roadmap,
    /// Work item selected by the Architect for the current iteration.
    pub current_task: Option<String>,
    pub retries: RetryCounters,
    /// Hint left by the Log-Analyst for the next Architect pass.
    pub remediation_hint: Option<String>,
    /// Execution results of the most recent Coder/Tester invocation.
    pub last_results: Vec<ExecutionResult>,
    /// Node outputs keyed by `<node>@<iteration>`.
    pub outputs: BTreeMap<String, NodeRecord>,
    pub pending_approval: Option<ApprovalRequest>,
    pub approvals_issued: u32,
    pub terminal_reason: Option<String>,
    pub audit: Vec<AuditEvent>,
}

impl RunState {
    /// Fresh state positioned at the Documentation node.
    pub fn new(run_id: impl Into<String>, design: DesignDocument) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            position: Position::Documentation,
            iteration: 0,
            design,
            roadmap: Roadmap::default(),
            current_task: None,
            retries: RetryCounters::default(),
            remediation_hint: None,
            last_results: Vec::new(),
            outputs: BTreeMap::new(),
            pending_approval: None,
            approvals_issued: 0,
            terminal_reason: None,
            audit: Vec::new(),
        }
    }

    /// Append an audit event with the next sequence number.
    pub fn record(&mut self, at: DateTime<Utc>, kind: AuditKind) {
        let seq = self.audit.last().map(|e| e.seq + 1).unwrap_or(1);
        self.audit.push(AuditEvent { seq, at, kind });
    }

    /// Ordered `(from, to, reason)` triples of every recorded transition.
    pub fn transitions(&self) -> Vec<(Position, Position, String)> {
        self.audit
            .iter()
            .filter_map(|event| match &event.kind {
                AuditKind::Transition { from, to, reason } => Some((*from, *to, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn output(&self, node: NodeKind, iteration: u32) -> Option<&NodeRecord> {
        self.outputs
            .get(&crate::core::types::output_key(node, iteration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{design_doc, fixed_time};

    #[test]
    fn record_assigns_contiguous_sequence_numbers() {
        let mut state = RunState::new("run-1", design_doc());
        state.record(
            fixed_time(),
            AuditKind::RunStarted {
                design_id: "todo".to_string(),
                design_version: 1,
            },
        );
        state.record(
            fixed_time(),
            AuditKind::Transition {
                from: Position::Documentation,
                to: Position::Planner,
                reason: "continue".to_string(),
            },
        );
        let seqs: Vec<u64> = state.audit.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(
            state.transitions(),
            vec![(
                Position::Documentation,
                Position::Planner,
                "continue".to_string()
            )]
        );
    }

    #[test]
    fn audit_events_serialize_flat() {
        let mut state = RunState::new("run-1", design_doc());
        state.record(
            fixed_time(),
            AuditKind::RunAborted {
                reason: "operator".to_string(),
            },
        );
        let json = serde_json::to_value(&state.audit[0]).expect("serialize");
        assert_eq!(json["event"], "run_aborted");
        assert_eq!(json["seq"], 1);
        assert_eq!(json["reason"], "operator");
    }
}
