//! Planner: turn the design document into a validated roadmap.

use serde_json::json;
use tracing::{info, warn};

use crate::core::budget::next_retry;
use crate::core::invariants::validate_roadmap;
use crate::core::types::{
    ErrorKind, NodeKind, NodeOutcome, RetryCounters, StateDelta, Transition,
};
use crate::error::{LlmError, NodeError};
use crate::io::llm::{CompletionRequest, Constraints, OutputSchema, complete_json};
use crate::roadmap::{PlannedRoadmap, Roadmap};
use crate::state::RunState;

use super::{NodeEnv, record};

pub fn run(state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    let attempt = state.retries.planner;
    let previous_problems = previous_problems(state);
    let prompt = env.prompts.planner(&state.design, &previous_problems)?;
    let request = CompletionRequest {
        node: NodeKind::Planner,
        context: prompt,
        constraints: Constraints {
            schema: OutputSchema::Roadmap,
            strict: attempt > 0,
            timeout: env.cfg.llm_timeout(),
        },
    };

    let problems = match complete_json::<PlannedRoadmap>(env.caps.llm, &request, env.llm_policy()) {
        Ok(plan) => match build_roadmap(&plan, env.cfg.task_max_attempts) {
            Ok(roadmap) => {
                let work = roadmap.work_items().len();
                info!(items = roadmap.items.len(), work, "roadmap planned");
                let delta = StateDelta {
                    roadmap: Some(roadmap),
                    retries: Some(RetryCounters {
                        planner: 0,
                        ..state.retries
                    }),
                    ..StateDelta::default()
                };
                let output = record(
                    state,
                    NodeKind::Planner,
                    format!("planned {work} work items"),
                    json!({ "attempt": attempt, "plan": plan }),
                );
                return Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue));
            }
            Err(problems) => problems,
        },
        Err(LlmError::MalformedResponse(msg)) => vec![msg],
        Err(err @ LlmError::Unavailable(_)) => return Err(err.into()),
    };

    let reason = problems.join("; ");
    warn!(attempt, problems = %reason, "planner output rejected");
    let mut delta = StateDelta::default();
    delta.error(ErrorKind::PlanningError, reason.clone());
    let detail = json!({ "attempt": attempt, "problems": problems });

    match next_retry(attempt, env.cfg.planner.retry_limit) {
        Some(next) => {
            delta.retries = Some(RetryCounters {
                planner: next,
                ..state.retries
            });
            let output = record(state, NodeKind::Planner, "roadmap rejected; retrying strictly", detail);
            Ok(NodeOutcome::new(delta.with_output(output), Transition::Retry))
        }
        None => {
            // A resumed run starts planning over with a fresh budget.
            delta.retries = Some(RetryCounters {
                planner: 0,
                ..state.retries
            });
            let output = record(state, NodeKind::Planner, "roadmap rejected", detail);
            Ok(NodeOutcome::new(
                delta.with_output(output),
                Transition::Halt {
                    kind: ErrorKind::PlanningError,
                    reason,
                },
            ))
        }
    }
}

fn build_roadmap(plan: &PlannedRoadmap, max_attempts: u32) -> Result<Roadmap, Vec<String>> {
    let roadmap = Roadmap::from_plan(plan, max_attempts)?;
    let errors = validate_roadmap(&roadmap);
    if !errors.is_empty() {
        return Err(errors);
    }
    if roadmap.work_items().is_empty() {
        return Err(vec!["roadmap has no work items".to_string()]);
    }
    Ok(roadmap)
}

/// Problems recorded by the previous rejected attempt in this planning pass.
fn previous_problems(state: &RunState) -> Vec<String> {
    if state.retries.planner == 0 {
        return Vec::new();
    }
    state
        .output(NodeKind::Planner, state.iteration)
        .and_then(|rec| rec.detail.get("problems"))
        .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
        .unwrap_or_else(|| vec!["previous answer was not a valid roadmap".to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roadmap::ItemStatus;
    use crate::test_support::{NodeHarness, ScriptedLlm, design_doc};
    use serde_json::json;

    fn plan_with(tasks: serde_json::Value) -> serde_json::Value {
        json!({ "phases": [{ "id": "p1", "title": "Core", "tasks": tasks }] })
    }

    #[test]
    fn valid_plan_replaces_the_roadmap() {
        let llm = ScriptedLlm::new(vec![Ok(plan_with(json!([
            { "id": "t1", "title": "Model" },
            { "id": "t2", "title": "Api", "depends_on": ["t1"] }
        ])))]);
        let harness = NodeHarness::new(&llm);
        let state = RunState::new("run-1", design_doc());

        let outcome = run(&state, &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::Continue);
        let roadmap = outcome.delta.roadmap.expect("roadmap");
        assert_eq!(roadmap.work_items().len(), 2);
        assert_eq!(roadmap.get("t2").expect("t2").status, ItemStatus::Pending);
        assert_eq!(roadmap.get("t2").expect("t2").max_attempts, 3);
    }

    #[test]
    fn cyclic_plan_retries_once_then_halts() {
        let cyclic = plan_with(json!([
            { "id": "t1", "title": "A", "depends_on": ["t2"] },
            { "id": "t2", "title": "B", "depends_on": ["t1"] }
        ]));
        let llm = ScriptedLlm::new(vec![Ok(cyclic.clone()), Ok(cyclic)]);
        let harness = NodeHarness::new(&llm);
        let mut state = RunState::new("run-1", design_doc());

        let first = run(&state, &harness.env()).expect("run");
        assert_eq!(first.transition, Transition::Retry);
        assert_eq!(first.delta.retries.map(|r| r.planner), Some(1));
        assert!(first.delta.roadmap.is_none());

        state.retries.planner = 1;
        let output = first.delta.output.expect("output");
        state.outputs.insert(output.key(), output);
        let second = run(&state, &harness.env()).expect("run");
        assert!(matches!(
            second.transition,
            Transition::Halt {
                kind: ErrorKind::PlanningError,
                ..
            }
        ));
        let requests = llm.requests();
        assert!(!requests[0].constraints.strict);
        assert!(requests[1].constraints.strict);
        assert!(requests[1].context.contains("dependency cycle"));
    }

    #[test]
    fn unavailable_model_is_a_node_error() {
        let llm = ScriptedLlm::new(vec![Err(LlmError::Unavailable("down".to_string()))]);
        let harness = NodeHarness::new(&llm);
        let state = RunState::new("run-1", design_doc());
        let err = run(&state, &harness.env()).unwrap_err();
        assert!(matches!(err, NodeError::Llm(LlmError::Unavailable(_))));
    }
}
