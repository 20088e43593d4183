//! Architect: pick the next actionable work item and sketch an approach.

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::core::selector::next_actionable;
use crate::core::types::{NodeKind, NodeOutcome, RetryCounters, StateDelta, Transition, Update};
use crate::error::NodeError;
use crate::io::llm::{CompletionRequest, Constraints, OutputSchema, complete_json};
use crate::io::prompt::{ItemContext, roadmap_summary};
use crate::roadmap::ItemStatus;
use crate::state::RunState;

use super::{NodeEnv, record};

#[derive(Debug, Deserialize)]
struct ApproachNote {
    approach: String,
    #[serde(default)]
    files: Vec<String>,
}

pub fn run(state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    let Some(item) = next_actionable(&state.roadmap) else {
        info!(iteration = state.iteration, "no actionable work item");
        let delta = StateDelta {
            current_task: Update::Clear,
            ..StateDelta::default()
        };
        let output = record(state, NodeKind::Architect, "nothing to select", json!({}));
        return Ok(NodeOutcome::new(delta.with_output(output), Transition::LoopDone));
    };

    let context = ItemContext::new(&state.roadmap, item);
    let hint = state.remediation_hint.as_deref();
    let prompt = env.prompts.architect(
        &state.design,
        &context,
        &roadmap_summary(&state.roadmap),
        hint,
    )?;
    let request = CompletionRequest {
        node: NodeKind::Architect,
        context: prompt,
        constraints: Constraints {
            schema: OutputSchema::Approach,
            strict: false,
            timeout: env.cfg.llm_timeout(),
        },
    };
    let note: ApproachNote = complete_json(env.caps.llm, &request, env.llm_policy())?;
    info!(item = %item.id, path = %context.path, files = note.files.len(), "work item selected");

    let mut delta = StateDelta {
        current_task: Update::Set(item.id.clone()),
        retries: Some(RetryCounters {
            coder: 0,
            ..state.retries
        }),
        remediation_hint: Update::Clear,
        results: Some(Vec::new()),
        ..StateDelta::default()
    };
    delta.item(&item.id, ItemStatus::InProgress, false);

    let mut output = record(
        state,
        NodeKind::Architect,
        format!("selected {}", context.path),
        json!({
            "approach": note.approach,
            "files": note.files,
            "hint": hint,
        }),
    );
    output.task_id = Some(item.id.clone());
    Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue))
}

/// Approach text the Architect recorded for the current iteration.
pub fn approach_for(state: &RunState) -> Option<String> {
    state
        .output(NodeKind::Architect, state.iteration)
        .filter(|rec| rec.task_id == state.current_task)
        .and_then(|rec| rec.detail.get("approach"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::test_support::{NodeHarness, ScriptedLlm, design_doc, phase, roadmap_of, task};
    use serde_json::json;

    fn state_with_two_tasks() -> RunState {
        let mut state = RunState::new("run-1", design_doc());
        state.roadmap = roadmap_of(vec![phase("p1", 0), task("t1", "p1", 0), task("t2", "p1", 1)]);
        state.iteration = 1;
        state
    }

    #[test]
    fn selects_first_actionable_item_and_records_approach() {
        let llm = ScriptedLlm::new(vec![Ok(json!({
            "approach": "add a Todo struct",
            "files": ["src/todo.rs"]
        }))]);
        let harness = NodeHarness::new(&llm);
        let mut state = state_with_two_tasks();
        state.remediation_hint = Some("check imports".to_string());
        state.retries.coder = 2;

        let outcome = run(&state, &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::Continue);
        assert_eq!(outcome.delta.current_task, Update::Set("t1".to_string()));
        assert_eq!(outcome.delta.remediation_hint, Update::Clear);
        assert_eq!(outcome.delta.retries.map(|r| r.coder), Some(0));
        assert_eq!(outcome.delta.item_updates[0].status, ItemStatus::InProgress);
        assert!(!outcome.delta.item_updates[0].bump_attempts);

        let output = outcome.delta.output.expect("output");
        assert_eq!(output.task_id.as_deref(), Some("t1"));
        assert_eq!(output.detail["approach"], "add a Todo struct");
        assert_eq!(output.detail["hint"], "check imports");

        let prompt = &llm.requests()[0].context;
        assert!(prompt.contains("<item path=\"p1/t1\""));
        assert!(prompt.contains("check imports"));
    }

    #[test]
    fn loop_done_when_nothing_is_actionable() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        let mut state = state_with_two_tasks();
        for id in ["t1", "t2"] {
            state.roadmap.get_mut(id).expect("item").status = ItemStatus::Done;
        }
        let outcome = run(&state, &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::LoopDone);
        assert_eq!(outcome.delta.current_task, Update::Clear);
        assert!(llm.requests().is_empty());
    }

    #[test]
    fn malformed_answers_surface_after_retries() {
        let llm = ScriptedLlm::new(vec![
            Ok(json!({ "files": [] })),
            Ok(json!("not an object")),
            Ok(json!({ "approach": "" })),
        ]);
        let harness = NodeHarness::new(&llm);
        let err = run(&state_with_two_tasks(), &harness.env()).unwrap_err();
        assert!(matches!(err, NodeError::Llm(LlmError::MalformedResponse(_))));
        assert_eq!(llm.requests().len(), 3);
    }
}
