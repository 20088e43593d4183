//! Tester: run the configured test commands against the workspace.

use serde_json::json;
use tracing::{info, warn};

use crate::core::types::{ErrorKind, NodeKind, NodeOutcome, StateDelta, Transition};
use crate::error::NodeError;
use crate::roadmap::ItemStatus;
use crate::state::RunState;

use super::{NodeEnv, current_task, record, run_commands};

pub fn run(state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    let task_id = current_task(state, NodeKind::Tester)?;
    let commands = &env.cfg.tester.commands;
    let results = run_commands(env, commands);
    let failed = results
        .iter()
        .find(|r| !r.success())
        .map(|r| r.command.clone());
    let passed = failed.is_none() && results.len() == commands.len();

    let detail = json!({
        "commands": commands,
        "passed": passed,
        "duration_ms": results.iter().map(|r| r.duration_ms).sum::<u64>(),
        "truncated": results.iter().any(|r| r.truncated),
    });
    let mut delta = StateDelta {
        results: Some(results),
        ..StateDelta::default()
    };

    if passed {
        info!(task = %task_id, "tests passed");
        delta.item(&task_id, ItemStatus::Done, false);
        let output = record(state, NodeKind::Tester, "tests passed", detail);
        return Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue));
    }

    let failed = failed.unwrap_or_default();
    warn!(task = %task_id, command = %failed, "tests failed");
    delta.item(&task_id, ItemStatus::Failed, true);
    delta.error(ErrorKind::ExecutionFailure, format!("{task_id}: tests failed at `{failed}`"));
    let output = record(state, NodeKind::Tester, format!("`{failed}` failed"), detail);
    Ok(NodeOutcome::new(delta.with_output(output), Transition::TaskFailed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        NodeHarness, ScriptedLlm, design_doc, exec_failed, phase, roadmap_of, task, test_config,
    };

    fn in_progress() -> RunState {
        let mut state = RunState::new("run-1", design_doc());
        state.roadmap = roadmap_of(vec![phase("p1", 0), task("t1", "p1", 0)]);
        state.roadmap.get_mut("t1").expect("t1").status = ItemStatus::InProgress;
        state.iteration = 1;
        state.current_task = Some("t1".to_string());
        state
    }

    #[test]
    fn passing_tests_mark_the_item_done() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        let outcome = run(&in_progress(), &harness.env()).expect("run");

        assert_eq!(outcome.transition, Transition::Continue);
        assert_eq!(outcome.delta.item_updates[0].status, ItemStatus::Done);
        assert!(outcome.delta.results.expect("results").iter().all(|r| r.success()));
        assert_eq!(harness.sandbox.commands(), vec!["run-tests"]);
    }

    #[test]
    fn failing_tests_fail_the_item_and_skip_the_rest() {
        let llm = ScriptedLlm::default();
        let mut cfg = test_config();
        cfg.tester.commands = vec!["cargo test".to_string(), "cargo clippy".to_string()];
        let harness = NodeHarness::with_config(&llm, cfg);
        harness
            .sandbox
            .queue(exec_failed("cargo test", "test todo::adds ... FAILED"));

        let outcome = run(&in_progress(), &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::TaskFailed);
        let update = &outcome.delta.item_updates[0];
        assert_eq!(update.status, ItemStatus::Failed);
        assert!(update.bump_attempts);
        assert_eq!(harness.sandbox.commands(), vec!["cargo test"]);
        assert!(outcome.delta.errors[0].message.contains("cargo test"));
    }
}
