//! Out-of-band operations on a persisted run: approval decisions, abort,
//! and read-only inspection.
//!
//! These operate directly on the run's checkpoints and never dispatch a node.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::path::item_path;
use crate::core::types::{ApprovalRequest, Decision, ErrorKind, Position, RunStatus};
use crate::error::RunFinishedError;
use crate::gate;
use crate::io::checkpoint::{CheckpointId, CheckpointRef, Checkpointer};
use crate::io::init::EnginePaths;
use crate::io::run_store::RunStore;
use crate::io::sandbox::SandboxClient;
use crate::state::{AuditKind, RunState};

/// Record a decision on the run's pending approval and checkpoint it.
pub fn resolve_approval(
    store: &RunStore,
    request_id: &str,
    decision: Decision,
    now: DateTime<Utc>,
) -> Result<(RunState, CheckpointId)> {
    let mut state = store.load(CheckpointRef::Latest)?;
    gate::resolve(&mut state, request_id, decision, now)?;
    let checkpoint = store.persist(&state)?;
    Ok((state, checkpoint))
}

/// Fail the run immediately and release its sandbox.
pub fn abort_run(
    store: &RunStore,
    sandbox: &dyn SandboxClient,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<(RunState, CheckpointId)> {
    let mut state = store.load(CheckpointRef::Latest)?;
    if state.status.is_terminal() {
        return Err(RunFinishedError {
            run_id: state.run_id.clone(),
            status: state.status,
        }
        .into());
    }
    let reason = if reason.trim().is_empty() {
        "aborted by operator".to_string()
    } else {
        reason.trim().to_string()
    };
    state.record(
        now,
        AuditKind::RunAborted {
            reason: reason.clone(),
        },
    );
    if let Err(err) = sandbox.release() {
        warn!(err = %err, "could not release sandbox");
    }
    let from = state.position;
    state.position = Position::Failed;
    state.status = RunStatus::Failed;
    state.terminal_reason = Some(format!("{}: {reason}", ErrorKind::Aborted.as_str()));
    state.record(
        now,
        AuditKind::Transition {
            from,
            to: Position::Failed,
            reason: reason.clone(),
        },
    );
    state.record(
        now,
        AuditKind::RunFinished {
            status: RunStatus::Failed,
            reason,
        },
    );
    let checkpoint = store.persist(&state)?;
    info!(run_id = %state.run_id, "run aborted");
    Ok((state, checkpoint))
}

/// Point-in-time view of a run for `devloop status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub position: Position,
    pub iteration: u32,
    pub design: String,
    pub current_task: Option<String>,
    pub pending_approval: Option<String>,
    pub terminal_reason: Option<String>,
    pub items: Vec<ItemLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemLine {
    pub path: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

pub fn summarize(state: &RunState) -> RunSummary {
    let items = state
        .roadmap
        .work_items()
        .into_iter()
        .map(|item| ItemLine {
            path: item_path(&state.roadmap, &item.id).unwrap_or_else(|| item.id.clone()),
            status: item.status.as_str().to_string(),
            attempts: item.attempts,
            max_attempts: item.max_attempts,
        })
        .collect();
    RunSummary {
        run_id: state.run_id.clone(),
        status: state.status,
        position: state.position,
        iteration: state.iteration,
        design: format!("{}@v{}", state.design.id, state.design.version),
        current_task: state.current_task.clone(),
        pending_approval: state
            .pending_approval
            .as_ref()
            .filter(|req| req.is_pending())
            .map(|req| req.id.clone()),
        terminal_reason: state.terminal_reason.clone(),
        items,
    }
}

/// An unresolved approval request of some run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub run_id: String,
    pub request: ApprovalRequest,
}

/// Unresolved approvals across every run, ordered by run id.
pub fn pending_approvals(paths: &EnginePaths) -> Result<Vec<PendingApproval>> {
    let mut pending = Vec::new();
    for run_id in paths.list_runs()? {
        let store = RunStore::new(paths.run(&run_id));
        if store.checkpoints().list()?.is_empty() {
            continue;
        }
        let state = store.load(CheckpointRef::Latest)?;
        if let Some(request) = state.pending_approval.filter(|req| req.is_pending()) {
            pending.push(PendingApproval { run_id, request });
        }
    }
    Ok(pending)
}

/// The most recently created run, if any.
pub fn latest_run(paths: &EnginePaths) -> Result<String> {
    let mut newest: Option<(u64, String)> = None;
    for run_id in paths.list_runs()? {
        let store = RunStore::new(paths.run(&run_id));
        let Some(first) = store.checkpoints().list()?.first().copied() else {
            continue;
        };
        let state = store.load(CheckpointRef::Id(first))?;
        let started = state
            .audit
            .first()
            .map(|e| e.at.timestamp_millis())
            .unwrap_or_default();
        let key = u64::try_from(started).unwrap_or_default();
        if newest.as_ref().is_none_or(|(at, id)| (key, &run_id) > (*at, id)) {
            newest = Some((key, run_id));
        }
    }
    newest
        .map(|(_, id)| id)
        .ok_or_else(|| anyhow!("no runs found (run `devloop start` first)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ApprovalPayload, NodeKind};
    use crate::start::start_run;
    use crate::test_support::{ScriptedSandbox, TempProject, design_doc, fixed_time, phase, roadmap_of, task};

    fn suspended_run(project: &TempProject) -> RunStore {
        let started = start_run(&project.paths, design_doc(), fixed_time()).expect("start");
        let mut state = started.state;
        state.roadmap = roadmap_of(vec![phase("p1", 0), task("t1", "p1", 0)]);
        state.current_task = Some("t1".to_string());
        state.position = Position::Integration;
        state.status = RunStatus::Suspended;
        state.pending_approval = Some(gate::request(
            &state,
            NodeKind::Integration,
            "push t1",
            ApprovalPayload::Push {
                branch: "main".to_string(),
                message: "t1: Task t1".to_string(),
                diff: Default::default(),
            },
            NodeKind::Architect,
            fixed_time(),
        ));
        state.approvals_issued = 1;
        started.store.persist(&state).expect("persist");
        started.store
    }

    #[test]
    fn resolve_persists_decision() {
        let project = TempProject::new().expect("project");
        let store = suspended_run(&project);
        assert_eq!(pending_approvals(&project.paths).expect("pending").len(), 1);

        let (state, checkpoint) =
            resolve_approval(&store, "apr-1", Decision::Approve, fixed_time()).expect("resolve");
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(checkpoint, CheckpointId(3));
        assert!(pending_approvals(&project.paths).expect("pending").is_empty());
        assert!(resolve_approval(&store, "apr-1", Decision::Approve, fixed_time()).is_err());
    }

    #[test]
    fn abort_fails_the_run_and_releases_the_sandbox() {
        let project = TempProject::new().expect("project");
        let store = suspended_run(&project);
        let sandbox = ScriptedSandbox::new();

        let (state, _) = abort_run(&store, &sandbox, "  ", fixed_time()).expect("abort");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.position, Position::Failed);
        assert_eq!(state.terminal_reason.as_deref(), Some("aborted: aborted by operator"));
        assert_eq!(sandbox.releases(), 1);
        let outcome = store.read_outcome().expect("read").expect("outcome");
        assert_eq!(outcome.status, RunStatus::Failed);

        let err = abort_run(&store, &sandbox, "again", fixed_time()).unwrap_err();
        assert!(err.downcast_ref::<RunFinishedError>().is_some());
    }

    #[test]
    fn summary_lists_work_items_by_path() {
        let project = TempProject::new().expect("project");
        let store = suspended_run(&project);
        let state = store.load(CheckpointRef::Latest).expect("load");
        let summary = summarize(&state);
        assert_eq!(summary.pending_approval.as_deref(), Some("apr-1"));
        assert_eq!(summary.items.len(), 1);
        assert_eq!(summary.items[0].path, "p1/t1");
        assert_eq!(summary.design, "todo@v1");
        assert_eq!(latest_run(&project.paths).expect("latest"), "todo-1");
    }
}
