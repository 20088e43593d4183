//! Integration: ask for approval, then commit and push the item's changes.
//!
//! Nothing reaches version control before a human approves the exact diff.
//! A rejection (or an expired request) blocks the item and rolls the loop
//! back to the Architect.

use anyhow::anyhow;
use serde_json::json;
use tracing::info;

use crate::core::types::{
    ApprovalPayload, ErrorKind, NodeKind, NodeOutcome, Resolution, StateDelta, Transition, Update,
};
use crate::error::NodeError;
use crate::gate;
use crate::roadmap::ItemStatus;
use crate::state::RunState;

use super::{NodeEnv, current_task, record};

pub fn run(state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    let task_id = current_task(state, NodeKind::Integration)?;

    if let Some(request) = gate::resolution_for(state, NodeKind::Integration) {
        let mut delta = StateDelta {
            approval: Update::Clear,
            current_task: Update::Clear,
            ..StateDelta::default()
        };

        if let Resolution::Approved { edited, .. } = &request.resolution {
            let ApprovalPayload::Push {
                branch,
                message,
                diff,
            } = &request.payload
            else {
                return Err(anyhow!("approval {} does not carry a push", request.id).into());
            };
            let message = edited
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(message);
            let commit = env.caps.vcs.commit(message, diff)?;
            env.caps.vcs.push(branch)?;
            info!(task = %task_id, commit = %commit, branch = %branch, "changes integrated");
            let output = record(
                state,
                NodeKind::Integration,
                format!("pushed {commit} to {branch}"),
                json!({
                    "approval": request.id,
                    "commit": commit,
                    "branch": branch,
                    "message": message,
                    "files": diff.files.len(),
                }),
            );
            return Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue));
        }

        let kind = match request.resolution {
            Resolution::Expired { .. } => ErrorKind::ApprovalTimeout,
            _ => ErrorKind::ApprovalRejected,
        };
        let reason = gate::rejection_reason(&request.resolution).unwrap_or_default();
        info!(task = %task_id, request_id = %request.id, %reason, "integration not approved");
        delta.item(&task_id, ItemStatus::Blocked, true);
        delta.error(kind, format!("{task_id}: integration not approved: {reason}"));
        let output = record(
            state,
            NodeKind::Integration,
            format!("{} not approved", request.id),
            json!({ "approval": request.id, "reason": reason }),
        );
        return Ok(NodeOutcome::new(
            delta.with_output(output),
            Transition::Rejected {
                rollback_to: NodeKind::Architect,
            },
        ));
    }

    let diff = env
        .caps
        .sandbox
        .diff()
        .map_err(|err| NodeError::Other(err.into()))?;
    if diff.is_empty() {
        info!(task = %task_id, "no changes to integrate");
        let delta = StateDelta {
            current_task: Update::Clear,
            ..StateDelta::default()
        };
        let output = record(state, NodeKind::Integration, "no changes", json!({ "files": 0 }));
        return Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue));
    }

    let title = state
        .roadmap
        .get(&task_id)
        .map_or(task_id.as_str(), |item| item.title.as_str());
    let message = format!("{task_id}: {title}");
    let request = gate::request(
        state,
        NodeKind::Integration,
        format!("push {} file(s) for {task_id}", diff.files.len()),
        ApprovalPayload::Push {
            branch: env.cfg.integration.branch.clone(),
            message: message.clone(),
            diff: diff.clone(),
        },
        NodeKind::Architect,
        env.caps.clock.now(),
    );
    info!(task = %task_id, request_id = %request.id, files = diff.files.len(), "integration awaiting approval");
    let output = record(
        state,
        NodeKind::Integration,
        "waiting for push approval",
        json!({ "approval": request.id, "message": message, "diff": diff.render() }),
    );
    let delta = StateDelta {
        approval: Update::Set(request),
        ..StateDelta::default()
    };
    Ok(NodeOutcome::new(delta.with_output(output), Transition::Suspended))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Decision;
    use crate::test_support::{
        NodeHarness, ScriptedLlm, design_doc, diff_of, fixed_time, phase, roadmap_of, task,
    };

    fn tested() -> RunState {
        let mut state = RunState::new("run-1", design_doc());
        state.roadmap = roadmap_of(vec![phase("p1", 0), task("t1", "p1", 0)]);
        state.roadmap.get_mut("t1").expect("t1").status = ItemStatus::Done;
        state.iteration = 1;
        state.current_task = Some("t1".to_string());
        state
    }

    fn suspend(state: &mut RunState, harness: &NodeHarness<'_>) {
        let outcome = run(state, &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::Suspended);
        let Update::Set(request) = outcome.delta.approval else {
            panic!("expected an approval request");
        };
        state.pending_approval = Some(request);
        state.approvals_issued += 1;
    }

    #[test]
    fn requests_approval_before_touching_version_control() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        harness.sandbox.set_diff(diff_of(&["src/todo.rs"]));
        let mut state = tested();
        suspend(&mut state, &harness);

        let request = state.pending_approval.as_ref().expect("request");
        assert!(harness.vcs.commits().is_empty());
        assert_eq!(request.rollback_to, NodeKind::Architect);
        let ApprovalPayload::Push { branch, message, diff } = &request.payload else {
            panic!("expected a push payload");
        };
        assert_eq!(branch, "main");
        assert_eq!(message, "t1: Task t1");
        assert_eq!(diff.files.len(), 1);
    }

    #[test]
    fn approved_push_commits_with_edited_message() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        harness.sandbox.set_diff(diff_of(&["src/todo.rs"]));
        let mut state = tested();
        suspend(&mut state, &harness);
        gate::resolve(
            &mut state,
            "apr-1",
            Decision::Edit {
                payload: "feat: todo model".to_string(),
            },
            fixed_time(),
        )
        .expect("resolve");

        let outcome = run(&state, &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::Continue);
        assert_eq!(outcome.delta.approval, Update::Clear);
        assert_eq!(outcome.delta.current_task, Update::Clear);
        let commits = harness.vcs.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, "feat: todo model");
        assert_eq!(harness.vcs.pushes(), vec!["main"]);
    }

    #[test]
    fn failed_push_is_a_node_error_and_keeps_the_approval() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        harness.sandbox.set_diff(diff_of(&["src/todo.rs"]));
        harness.vcs.fail_pushes(true);
        let mut state = tested();
        suspend(&mut state, &harness);
        gate::resolve(&mut state, "apr-1", Decision::Approve, fixed_time()).expect("resolve");

        let err = run(&state, &harness.env()).unwrap_err();
        assert!(matches!(err, NodeError::Other(_)));
        assert!(err.to_string().contains("remote rejected"));
    }

    #[test]
    fn rejection_blocks_the_item_and_rolls_back() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        harness.sandbox.set_diff(diff_of(&["src/todo.rs"]));
        let mut state = tested();
        suspend(&mut state, &harness);
        gate::resolve(
            &mut state,
            "apr-1",
            Decision::Reject {
                reason: "missing tests".to_string(),
            },
            fixed_time(),
        )
        .expect("resolve");

        let outcome = run(&state, &harness.env()).expect("run");
        assert_eq!(
            outcome.transition,
            Transition::Rejected {
                rollback_to: NodeKind::Architect
            }
        );
        let update = &outcome.delta.item_updates[0];
        assert_eq!(update.status, ItemStatus::Blocked);
        assert!(update.bump_attempts);
        assert_eq!(outcome.delta.errors[0].kind, ErrorKind::ApprovalRejected);
        assert!(harness.vcs.commits().is_empty());
    }

    #[test]
    fn empty_diff_skips_approval() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        let outcome = run(&tested(), &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::Continue);
        assert_eq!(outcome.delta.approval, Update::Keep);
    }
}
