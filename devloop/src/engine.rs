//! Graph engine: advance a run by exactly one node invocation.
//!
//! `advance` is the only place deltas are committed. Each call dispatches the
//! node at the current position, applies its delta to a copy of the state,
//! resolves the edge against the fixed topology and persists one checkpoint
//! holding both the delta and the new position.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::state_update::apply_delta;
use crate::core::topology::{LoopBounds, route};
use crate::core::types::{ErrorKind, NodeKind, NodeOutcome, Position, RunStatus};
use crate::error::{DeltaRejectedError, NodeError, RunFinishedError, WorkflowError};
use crate::gate;
use crate::io::checkpoint::CheckpointId;
use crate::io::config::EngineConfig;
use crate::io::prompt::PromptBuilder;
use crate::io::run_store::RunStore;
use crate::nodes::{self, Capabilities, NodeEnv, uses_sandbox};
use crate::state::{AuditKind, RunState};

/// Result of one `advance`.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: RunState,
    pub from: Position,
    pub to: Position,
    /// `None` when nothing changed (a run still waiting on approval).
    pub checkpoint: Option<CheckpointId>,
}

impl StepOutcome {
    pub fn moved(&self) -> bool {
        self.checkpoint.is_some()
    }
}

pub struct Engine<'a> {
    cfg: EngineConfig,
    prompts: PromptBuilder,
    sensitive: Vec<Regex>,
    caps: Capabilities<'a>,
    store: RunStore,
    workspace: PathBuf,
}

impl<'a> Engine<'a> {
    pub fn new(
        cfg: EngineConfig,
        caps: Capabilities<'a>,
        store: RunStore,
        workspace: impl Into<PathBuf>,
    ) -> Result<Self> {
        cfg.validate()?;
        let sensitive = cfg.sensitive_patterns()?;
        let prompts = PromptBuilder::new(cfg.llm.prompt_budget_bytes);
        Ok(Self {
            cfg,
            prompts,
            sensitive,
            caps,
            store,
            workspace: workspace.into(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn capabilities(&self) -> Capabilities<'a> {
        self.caps
    }

    fn env(&self) -> NodeEnv<'_> {
        NodeEnv {
            caps: self.caps,
            cfg: &self.cfg,
            prompts: &self.prompts,
            sensitive: &self.sensitive,
        }
    }

    /// Run the node at the current position and commit its outcome.
    ///
    /// A suspended run with an unresolved, unexpired approval is returned
    /// unchanged. Degraded and halted runs are resumed at the node that
    /// stopped them.
    #[instrument(skip_all, fields(run_id = %state.run_id, position = %state.position, iteration = state.iteration))]
    pub fn advance(&self, mut state: RunState) -> Result<StepOutcome> {
        let from = state.position;
        let node = match from.node() {
            Some(node) if !state.status.is_terminal() => node,
            _ => {
                return Err(RunFinishedError {
                    run_id: state.run_id.clone(),
                    status: state.status,
                }
                .into());
            }
        };
        let now = self.caps.clock.now();

        match state.status {
            RunStatus::Suspended => {
                if !gate::expire_if_stale(&mut state, now, self.cfg.approval.timeout_secs) {
                    debug!("waiting for approval");
                    return Ok(StepOutcome {
                        state,
                        from,
                        to: from,
                        checkpoint: None,
                    });
                }
            }
            RunStatus::Degraded | RunStatus::Halted => {
                info!(status = state.status.as_str(), "resuming run");
                let from_status = state.status;
                state.record(now, AuditKind::RunResumed { from_status });
                state.status = RunStatus::Running;
            }
            RunStatus::Running | RunStatus::Completed | RunStatus::Failed => {}
        }

        if uses_sandbox(node) {
            self.caps
                .sandbox
                .mount(&self.workspace)
                .with_context(|| format!("mount sandbox at {}", self.workspace.display()))?;
        }

        let outcome = match nodes::dispatch(node, &state, &self.env()) {
            Ok(outcome) => outcome,
            Err(NodeError::Llm(err)) => {
                let kind = WorkflowError::from(err.clone()).kind();
                return self.halt(state, node, RunStatus::Degraded, kind, err.to_string(), now);
            }
            Err(NodeError::Other(err)) => {
                let message = format!("{err:#}");
                return self.halt(state, node, RunStatus::Halted, ErrorKind::ExecutionFailure, message, now);
            }
        };
        self.commit(state, node, outcome, now)
    }

    fn commit(
        &self,
        state: RunState,
        node: NodeKind,
        outcome: NodeOutcome,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let from = state.position;
        let NodeOutcome { delta, transition } = outcome;

        let mut next = state.clone();
        let applied = match apply_delta(&mut next, node, delta, now) {
            Ok(applied) => applied,
            Err(errors) => {
                let err = DeltaRejectedError {
                    node: node.as_str().to_string(),
                    errors,
                };
                self.halt(state, node, RunStatus::Halted, ErrorKind::ExecutionFailure, err.to_string(), now)?;
                return Err(err.into());
            }
        };
        debug!(
            updated = applied.updated_items.len(),
            derived = applied.derived_items.len(),
            "delta applied"
        );

        let bounds = LoopBounds {
            iteration: next.iteration,
            max_iterations: self.cfg.max_iterations,
            policy: self.cfg.continue_policy,
        };
        let routed = match route(node, &transition, &next.roadmap, bounds) {
            Ok(routed) => routed,
            Err(err) => {
                self.halt(state, node, RunStatus::Halted, ErrorKind::ExecutionFailure, err.to_string(), now)?;
                return Err(err.into());
            }
        };

        next.position = routed.to;
        next.status = routed.status;
        next.iteration = routed.iteration;
        next.record(
            now,
            AuditKind::Transition {
                from,
                to: routed.to,
                reason: routed.reason.clone(),
            },
        );
        match routed.status {
            RunStatus::Halted => {
                warn!(node = %node, reason = %routed.reason, "run halted");
                next.record(
                    now,
                    AuditKind::RunHalted {
                        status: RunStatus::Halted,
                        kind: routed.error.unwrap_or(ErrorKind::ExecutionFailure),
                        message: routed.reason.clone(),
                    },
                );
            }
            RunStatus::Completed | RunStatus::Failed => {
                info!(status = routed.status.as_str(), reason = %routed.reason, "run finished");
                next.terminal_reason = Some(routed.reason.clone());
                next.record(
                    now,
                    AuditKind::RunFinished {
                        status: routed.status,
                        reason: routed.reason.clone(),
                    },
                );
                if let Err(err) = self.caps.sandbox.release() {
                    warn!(err = %err, "could not release sandbox");
                }
            }
            RunStatus::Running | RunStatus::Suspended | RunStatus::Degraded => {}
        }

        let checkpoint = self.store.persist(&next)?;
        info!(
            from = %from,
            to = %routed.to,
            edge = transition.label(),
            checkpoint = checkpoint.0,
            "advanced"
        );
        Ok(StepOutcome {
            state: next,
            from,
            to: routed.to,
            checkpoint: Some(checkpoint),
        })
    }

    /// Stop the run in place without committing the node's work.
    fn halt(
        &self,
        mut state: RunState,
        node: NodeKind,
        status: RunStatus,
        kind: ErrorKind,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        warn!(node = %node, status = status.as_str(), kind = kind.as_str(), %message, "node error");
        state.record(
            now,
            AuditKind::NodeError {
                node,
                kind,
                message: message.clone(),
            },
        );
        state.status = status;
        state.record(now, AuditKind::RunHalted { status, kind, message });
        let checkpoint = self.store.persist(&state)?;
        let from = state.position;
        Ok(StepOutcome {
            state,
            from,
            to: from,
            checkpoint: Some(checkpoint),
        })
    }
}
