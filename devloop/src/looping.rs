//! Multi-step driver for `devloop run`.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::{info, warn};

use crate::control::abort_run;
use crate::core::types::{Position, RunStatus};
use crate::engine::{Engine, StepOutcome};
use crate::error::{DeltaRejectedError, TopologyError};
use crate::io::checkpoint::{CheckpointId, CheckpointRef, Checkpointer};
use crate::state::RunState;

/// Audit reason recorded when the abort flag ends a run.
pub const ABORT_SIGNAL_REASON: &str = "abort signal received";

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Completed,
    Failed { reason: String },
    /// Waiting for a decision on this approval request.
    Suspended { request_id: String },
    /// Halted or degraded; `advance` resumes it.
    Halted { status: RunStatus, node: Position },
    /// `max_steps` advances were executed.
    StepLimit,
    /// A node proposed an invalid delta or edge; the run is halted.
    Rejected { message: String },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub steps_executed: u32,
    pub stop: LoopStop,
    pub state: RunState,
}

/// Limits for one `run_loop` invocation.
#[derive(Debug, Default)]
pub struct LoopControl<'a> {
    /// Stop after this many advances (`None` runs until the run stops itself).
    pub max_steps: Option<u32>,
    /// Checked between advances; once raised the run is aborted (Failed).
    pub abort: Option<&'a AtomicBool>,
}

/// Advance the run from its latest checkpoint until it finishes, suspends,
/// halts, or a limit in `control` is hit.
///
/// A halted or suspended run is advanced once before stopping, which
/// resumes it (or expires a stale approval). Checkpoints written by another
/// process between steps (`devloop abort`, `devloop resolve`) are picked up
/// before the next advance. Any error other than a rejected delta or edge is
/// returned as-is.
pub fn run_loop<F: FnMut(&StepOutcome)>(
    engine: &Engine<'_>,
    control: &LoopControl<'_>,
    mut on_step: F,
) -> Result<LoopOutcome> {
    let mut state = engine.store().load(CheckpointRef::Latest)?;
    let mut seen = latest_checkpoint(engine)?;
    let run_id = state.run_id.clone();
    let mut steps_executed = 0u32;

    loop {
        let latest = latest_checkpoint(engine)?;
        if latest != seen {
            info!(run_id = %run_id, "run changed outside this loop; reloading");
            state = engine.store().load(CheckpointRef::Latest)?;
            seen = latest;
        }
        if state.status.is_terminal()
            && let Some(stop) = stop_for(&state)
        {
            return Ok(finish(run_id, steps_executed, stop, state));
        }
        if control.abort.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            warn!(run_id = %run_id, "abort flag raised");
            let caps = engine.capabilities();
            let (aborted, _) = abort_run(engine.store(), caps.sandbox, ABORT_SIGNAL_REASON, caps.clock.now())?;
            let stop = LoopStop::Failed {
                reason: aborted.terminal_reason.clone().unwrap_or_default(),
            };
            return Ok(finish(run_id, steps_executed, stop, aborted));
        }
        if control.max_steps.is_some_and(|max| steps_executed >= max) {
            return Ok(finish(run_id, steps_executed, LoopStop::StepLimit, state));
        }

        match engine.advance(state.clone()) {
            Ok(step) if !step.moved() => {
                // Still waiting on an approval.
                let stop = stop_for(&step.state).unwrap_or(LoopStop::StepLimit);
                return Ok(finish(run_id, steps_executed, stop, step.state));
            }
            Ok(step) => {
                steps_executed += 1;
                on_step(&step);
                seen = step.checkpoint;
                state = step.state;
                if let Some(stop) = stop_for(&state) {
                    return Ok(finish(run_id, steps_executed, stop, state));
                }
            }
            Err(err) => {
                let rejected = err.downcast_ref::<DeltaRejectedError>().is_some()
                    || err.downcast_ref::<TopologyError>().is_some();
                if !rejected {
                    return Err(err);
                }
                warn!(run_id = %run_id, err = %err, "step rejected");
                let halted = engine.store().load(CheckpointRef::Latest)?;
                let stop = LoopStop::Rejected {
                    message: err.to_string(),
                };
                return Ok(finish(run_id, steps_executed + 1, stop, halted));
            }
        }
    }
}

fn latest_checkpoint(engine: &Engine<'_>) -> Result<Option<CheckpointId>> {
    Ok(engine.store().checkpoints().list()?.last().copied())
}

/// Stop condition implied by the state alone, before advancing again.
fn stop_for(state: &RunState) -> Option<LoopStop> {
    match state.status {
        RunStatus::Completed => Some(LoopStop::Completed),
        RunStatus::Failed => Some(LoopStop::Failed {
            reason: state.terminal_reason.clone().unwrap_or_default(),
        }),
        RunStatus::Suspended => Some(LoopStop::Suspended {
            request_id: state
                .pending_approval
                .as_ref()
                .map(|req| req.id.clone())
                .unwrap_or_default(),
        }),
        RunStatus::Halted | RunStatus::Degraded => Some(LoopStop::Halted {
            status: state.status,
            node: state.position,
        }),
        RunStatus::Running => None,
    }
}

fn finish(run_id: String, steps_executed: u32, stop: LoopStop, state: RunState) -> LoopOutcome {
    info!(run_id = %run_id, steps = steps_executed, stop = ?stop, "loop stopped");
    LoopOutcome {
        run_id,
        steps_executed,
        stop,
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::start::start_run;
    use crate::state::AuditKind;
    use crate::test_support::{TestRig, design_doc, fixed_time};
    use serde_json::json;

    fn one_task_plan() -> serde_json::Value {
        json!({ "phases": [{ "id": "p1", "title": "Core", "tasks": [{ "id": "t1", "title": "Model" }] }] })
    }

    #[test]
    fn loop_runs_until_completion_without_changes() {
        let rig = TestRig::new().expect("rig");
        let started = start_run(&rig.project.paths, design_doc(), fixed_time()).expect("start");
        rig.llm.push(Ok(one_task_plan()));
        rig.llm.push(Ok(json!({ "approach": "add model" })));
        rig.llm.push(Ok(json!({ "plan": "p", "commands": ["touch model.rs"] })));
        let engine = rig.engine(&started.state.run_id).expect("engine");

        let mut seen = Vec::new();
        let outcome = run_loop(&engine, &LoopControl::default(), |step| seen.push(step.to)).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Completed);
        assert_eq!(
            seen,
            vec![
                Position::Planner,
                Position::Architect,
                Position::Coder,
                Position::Tester,
                Position::Integration,
                Position::End,
            ]
        );
        assert_eq!(outcome.steps_executed, 6);
    }

    #[test]
    fn loop_respects_step_limit_and_abort_flag() {
        let rig = TestRig::new().expect("rig");
        let started = start_run(&rig.project.paths, design_doc(), fixed_time()).expect("start");
        let engine = rig.engine(&started.state.run_id).expect("engine");

        let control = LoopControl {
            max_steps: Some(1),
            abort: None,
        };
        let outcome = run_loop(&engine, &control, |_| {}).expect("loop");
        assert_eq!(outcome.stop, LoopStop::StepLimit);
        assert_eq!(outcome.state.position, Position::Planner);

        let flag = AtomicBool::new(true);
        let control = LoopControl {
            max_steps: None,
            abort: Some(&flag),
        };
        let outcome = run_loop(&engine, &control, |_| {}).expect("loop");
        assert_eq!(outcome.steps_executed, 0);
        assert!(matches!(&outcome.stop, LoopStop::Failed { reason } if reason.contains(ABORT_SIGNAL_REASON)));
        assert_eq!(outcome.state.status, RunStatus::Failed);
        assert_eq!(outcome.state.position, Position::Failed);
        assert_eq!(rig.sandbox.releases(), 1);

        let audit = engine.store().read_audit().expect("audit");
        assert!(audit.iter().any(|e| matches!(
            &e.kind,
            AuditKind::RunAborted { reason } if reason == ABORT_SIGNAL_REASON
        )));
        let persisted = engine.store().load(CheckpointRef::Latest).expect("load");
        assert_eq!(persisted.status, RunStatus::Failed);
    }

    #[test]
    fn loop_picks_up_an_abort_written_between_steps() {
        let rig = TestRig::new().expect("rig");
        let started = start_run(&rig.project.paths, design_doc(), fixed_time()).expect("start");
        let engine = rig.engine(&started.state.run_id).expect("engine");
        let store = rig.store(&started.state.run_id);

        let outcome = run_loop(&engine, &LoopControl::default(), |_| {
            abort_run(&store, &rig.sandbox, "stop", fixed_time()).expect("abort");
        })
        .expect("loop");
        assert_eq!(outcome.steps_executed, 1);
        assert!(matches!(&outcome.stop, LoopStop::Failed { reason } if reason == "aborted: stop"));
        assert_eq!(outcome.state.status, RunStatus::Failed);
        assert!(rig.llm.requests().is_empty(), "the planner never runs");
    }

    #[test]
    fn loop_stops_when_approval_is_needed() {
        let rig = TestRig::new().expect("rig");
        rig.sandbox.set_diff(crate::test_support::diff_of(&["model.rs"]));
        let started = start_run(&rig.project.paths, design_doc(), fixed_time()).expect("start");
        rig.llm.push(Ok(one_task_plan()));
        rig.llm.push(Ok(json!({ "approach": "add model" })));
        rig.llm.push(Ok(json!({ "plan": "p", "commands": ["touch model.rs"] })));
        let engine = rig.engine(&started.state.run_id).expect("engine");

        let outcome = run_loop(&engine, &LoopControl::default(), |_| {}).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Suspended {
                request_id: "apr-1".to_string()
            }
        );
        assert_eq!(outcome.state.position, Position::Integration);

        let again = run_loop(&engine, &LoopControl::default(), |_| {}).expect("loop");
        assert_eq!(again.steps_executed, 0);
        assert_eq!(again.stop, outcome.stop);
    }
}
