//! Coder: turn the approach into shell commands and run them in the sandbox.
//!
//! Commands matching `approval.sensitive_commands` are not run until a human
//! approves them. A failing command ends the attempt; the Coder retries up to
//! `coder.retry_limit` times before handing the item to the Log-Analyst.

use anyhow::anyhow;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::core::budget::next_retry;
use crate::core::types::{
    ApprovalPayload, ErrorKind, ExecutionResult, NodeKind, NodeOutcome, Resolution, RetryCounters,
    StateDelta, Transition, Update,
};
use crate::error::NodeError;
use crate::gate;
use crate::io::llm::{CompletionRequest, Constraints, OutputSchema, complete_json};
use crate::io::prompt::ItemContext;
use crate::roadmap::ItemStatus;
use crate::state::RunState;

use super::architect::approach_for;
use super::{NodeEnv, current_task, record, run_commands};

#[derive(Debug, Deserialize)]
struct CoderPlan {
    plan: String,
    commands: Vec<String>,
}

pub fn run(state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    let task_id = current_task(state, NodeKind::Coder)?;
    let mut delta = StateDelta::default();

    let (plan, commands) = match gate::resolution_for(state, NodeKind::Coder) {
        Some(request) => {
            delta.approval = Update::Clear;
            let (edited, kind) = match &request.resolution {
                Resolution::Approved { edited, .. } => (edited, None),
                Resolution::Expired { .. } => (&None, Some(ErrorKind::ApprovalTimeout)),
                _ => (&None, Some(ErrorKind::ApprovalRejected)),
            };
            if let Some(kind) = kind {
                let reason = gate::rejection_reason(&request.resolution).unwrap_or_default();
                info!(request_id = %request.id, %reason, "commands not approved");
                delta.error(kind, format!("commands for {task_id} not approved: {reason}"));
                let output = record(
                    state,
                    NodeKind::Coder,
                    "commands not approved",
                    json!({ "approval": request.id, "reason": reason }),
                );
                return Ok(failed_attempt(state, env, &task_id, delta.with_output(output)));
            }
            let commands = match (edited, &request.payload) {
                (Some(text), _) => text
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect(),
                (None, ApprovalPayload::Commands { commands }) => commands.clone(),
                (None, ApprovalPayload::Push { .. }) => {
                    return Err(anyhow!("approval {} does not carry commands", request.id).into());
                }
            };
            (format!("approved via {}", request.id), commands)
        }
        None => {
            let planned = plan_commands(state, env, &task_id)?;
            if let Some(command) = first_sensitive(env.sensitive, &planned.commands) {
                let request = gate::request(
                    state,
                    NodeKind::Coder,
                    format!("run sensitive command for {task_id}: {command}"),
                    ApprovalPayload::Commands {
                        commands: planned.commands.clone(),
                    },
                    NodeKind::Coder,
                    env.caps.clock.now(),
                );
                info!(request_id = %request.id, %command, "sensitive command needs approval");
                let output = record(
                    state,
                    NodeKind::Coder,
                    "waiting for command approval",
                    json!({
                        "plan": planned.plan,
                        "commands": planned.commands,
                        "approval": request.id,
                    }),
                );
                delta.approval = Update::Set(request);
                return Ok(NodeOutcome::new(delta.with_output(output), Transition::Suspended));
            }
            (planned.plan, planned.commands)
        }
    };

    let results = run_commands(env, &commands);
    let passed = results.len() == commands.len() && results.iter().all(ExecutionResult::success);
    let detail = json!({
        "plan": plan,
        "commands": commands,
        "exit_codes": results.iter().map(|r| r.exit_code).collect::<Vec<_>>(),
    });
    delta.results = Some(results);

    if passed {
        info!(task = %task_id, commands = commands.len(), "coder commands succeeded");
        let output = record(state, NodeKind::Coder, format!("ran {} command(s)", commands.len()), detail);
        return Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue));
    }

    let failed = delta
        .results
        .as_ref()
        .and_then(|results| results.iter().find(|r| !r.success()))
        .map(|r| r.command.clone())
        .unwrap_or_default();
    warn!(task = %task_id, command = %failed, "coder command failed");
    delta.error(ErrorKind::ExecutionFailure, format!("{task_id}: `{failed}` failed"));
    let output = record(state, NodeKind::Coder, format!("`{failed}` failed"), detail);
    Ok(failed_attempt(state, env, &task_id, delta.with_output(output)))
}

/// Ask the model for the commands implementing the current item.
fn plan_commands(state: &RunState, env: &NodeEnv<'_>, task_id: &str) -> Result<CoderPlan, NodeError> {
    let item = state
        .roadmap
        .get(task_id)
        .ok_or_else(|| anyhow!("current task {task_id} is not in the roadmap"))?;
    let retry = state.retries.coder;
    let failure = (retry > 0)
        .then(|| state.last_results.iter().find(|r| !r.success()))
        .flatten()
        .map(|r| r.failure_tail(env.cfg.coder.failure_context_bytes));
    let approach = approach_for(state);
    let prompt = env.prompts.coder(
        &state.design,
        &ItemContext::new(&state.roadmap, item),
        approach.as_deref(),
        failure.as_deref(),
        retry,
    )?;
    let request = CompletionRequest {
        node: NodeKind::Coder,
        context: prompt,
        constraints: Constraints {
            schema: OutputSchema::CoderPlan,
            strict: false,
            timeout: env.cfg.llm_timeout(),
        },
    };
    Ok(complete_json(env.caps.llm, &request, env.llm_policy())?)
}

fn first_sensitive<'c>(patterns: &[Regex], commands: &'c [String]) -> Option<&'c str> {
    commands
        .iter()
        .find(|command| patterns.iter().any(|re| re.is_match(command)))
        .map(String::as_str)
}

/// Retry while the coder budget lasts, then fail the item.
fn failed_attempt(state: &RunState, env: &NodeEnv<'_>, task_id: &str, mut delta: StateDelta) -> NodeOutcome {
    match next_retry(state.retries.coder, env.cfg.coder.retry_limit) {
        Some(next) => {
            delta.retries = Some(RetryCounters {
                coder: next,
                ..state.retries
            });
            NodeOutcome::new(delta, Transition::Retry)
        }
        None => {
            delta.item(task_id, ItemStatus::Failed, true);
            NodeOutcome::new(delta, Transition::TaskFailed)
        }
    }
}
