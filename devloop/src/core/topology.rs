//! The fixed workflow topology and the `Continue?` decision.
//!
//! Edges are a closed table over `(node, transition)`. Everything that moves
//! the run (iteration counter, run status, terminal reason) is computed here
//! so the engine only commits the resulting [`Route`].

use serde::{Deserialize, Serialize};

use crate::core::selector::{is_actionable, is_stuck};
use crate::core::types::{ErrorKind, NodeKind, Position, RunStatus, Transition};
use crate::error::TopologyError;
use crate::roadmap::Roadmap;

/// Stricter loop-continuation rules layered over the default decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuePolicy {
    /// End the run as soon as any work item has exhausted its attempts.
    pub fail_fast: bool,
    /// Fail with `roadmap stalled` when nothing is actionable, instead of
    /// looping back to the Architect until the iteration ceiling.
    pub stop_when_stalled: bool,
}

/// Outcome of evaluating `Continue?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueDecision {
    End,
    Architect,
    Fail { kind: ErrorKind, reason: String },
}

/// Decide whether the loop goes back to the Architect, ends, or fails.
///
/// `iteration` is the iteration that just finished.
pub fn evaluate_continue(
    roadmap: &Roadmap,
    iteration: u32,
    max_iterations: u32,
    policy: ContinuePolicy,
) -> ContinueDecision {
    if roadmap.all_work_done() {
        return ContinueDecision::End;
    }
    let work = roadmap.work_items();
    if policy.fail_fast
        && let Some(item) = work.iter().find(|item| is_stuck(item))
    {
        return ContinueDecision::Fail {
            kind: ErrorKind::ExecutionFailure,
            reason: format!("{} exhausted {} attempts", item.id, item.max_attempts),
        };
    }
    if iteration >= max_iterations {
        return ceiling_reached(max_iterations);
    }
    if policy.stop_when_stalled && !work.iter().any(|item| is_actionable(roadmap, item)) {
        return ContinueDecision::Fail {
            kind: ErrorKind::RoadmapStalled,
            reason: "roadmap stalled".to_string(),
        };
    }
    ContinueDecision::Architect
}

fn ceiling_reached(max_iterations: u32) -> ContinueDecision {
    ContinueDecision::Fail {
        kind: ErrorKind::LoopBudgetExceeded,
        reason: format!("iteration ceiling of {max_iterations} reached"),
    }
}

/// Where the run goes after a node returned `transition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub to: Position,
    pub status: RunStatus,
    pub iteration: u32,
    /// Audit reason for the transition.
    pub reason: String,
    /// Error kind when the route halts or fails the run.
    pub error: Option<ErrorKind>,
}

/// Loop bounds needed to resolve edges into the Architect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopBounds {
    pub iteration: u32,
    pub max_iterations: u32,
    pub policy: ContinuePolicy,
}

enum Target {
    Node(NodeKind),
    Continue,
    Stay(RunStatus),
}

fn target(from: NodeKind, transition: &Transition) -> Option<Target> {
    use NodeKind as N;
    use Transition as T;

    let target = match (from, transition) {
        (N::Documentation, T::Continue) => Target::Node(N::Planner),
        (N::Planner, T::Continue) => Target::Node(N::Architect),
        (N::Planner, T::Retry) => Target::Node(N::Planner),
        (N::Architect, T::Continue) => Target::Node(N::Coder),
        (N::Architect, T::LoopDone) => Target::Continue,
        (N::Coder, T::Continue) => Target::Node(N::Tester),
        (N::Coder, T::Retry) => Target::Node(N::Coder),
        (N::Coder | N::Tester, T::TaskFailed) => Target::Node(N::LogAnalyst),
        (N::Tester, T::Continue) => Target::Node(N::Integration),
        (N::Integration | N::LogAnalyst, T::Continue) => Target::Continue,
        (
            _,
            T::Rejected {
                rollback_to: rollback @ (N::Architect | N::Coder),
            },
        ) => Target::Node(*rollback),
        (_, T::Suspended) => Target::Stay(RunStatus::Suspended),
        (_, T::Halt { .. }) => Target::Stay(RunStatus::Halted),
        _ => return None,
    };
    Some(target)
}

/// Resolve a node's transition against the fixed topology.
///
/// Entering the Architect from anywhere but the Planner starts a new
/// iteration, so the ceiling is checked before the counter moves.
pub fn route(
    from: NodeKind,
    transition: &Transition,
    roadmap: &Roadmap,
    bounds: LoopBounds,
) -> Result<Route, TopologyError> {
    let target = target(from, transition).ok_or_else(|| TopologyError {
        node: from.as_str().to_string(),
        edge: transition.label().to_string(),
    })?;
    let iteration = bounds.iteration;
    let label = transition.label();

    let route = match target {
        Target::Stay(status) => {
            let (reason, error) = match transition {
                Transition::Halt { kind, reason } => (reason.clone(), Some(*kind)),
                _ => (label.to_string(), None),
            };
            Route {
                to: from.into(),
                status,
                iteration,
                reason,
                error,
            }
        }
        Target::Node(NodeKind::Architect) if from == NodeKind::Planner => {
            running(NodeKind::Architect, iteration + 1, label)
        }
        Target::Node(NodeKind::Architect) => {
            if iteration >= bounds.max_iterations {
                failed(iteration, ceiling_reached(bounds.max_iterations))
            } else {
                running(NodeKind::Architect, iteration + 1, label)
            }
        }
        Target::Node(node) => running(node, iteration, label),
        Target::Continue => {
            match evaluate_continue(roadmap, iteration, bounds.max_iterations, bounds.policy) {
                ContinueDecision::End => Route {
                    to: Position::End,
                    status: RunStatus::Completed,
                    iteration,
                    reason: "all work items done".to_string(),
                    error: None,
                },
                ContinueDecision::Architect => {
                    running(NodeKind::Architect, iteration + 1, "continue: work remains")
                }
                decision @ ContinueDecision::Fail { .. } => failed(iteration, decision),
            }
        }
    };
    Ok(route)
}

fn running(node: NodeKind, iteration: u32, reason: &str) -> Route {
    Route {
        to: node.into(),
        status: RunStatus::Running,
        iteration,
        reason: reason.to_string(),
        error: None,
    }
}

fn failed(iteration: u32, decision: ContinueDecision) -> Route {
    let (kind, reason) = match decision {
        ContinueDecision::Fail { kind, reason } => (kind, reason),
        ContinueDecision::End | ContinueDecision::Architect => {
            (ErrorKind::RoadmapStalled, "roadmap stalled".to_string())
        }
    };
    Route {
        to: Position::Failed,
        status: RunStatus::Failed,
        iteration,
        reason,
        error: Some(kind),
    }
}
