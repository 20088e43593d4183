//! Engine-owned application of node deltas to the run state.
//!
//! Nodes only propose changes; this module decides which of them a node is
//! allowed to make, applies them and re-checks the roadmap invariants. The
//! caller applies onto a copy and discards it on error.

use chrono::{DateTime, Utc};

use crate::core::invariants::validate_roadmap;
use crate::core::types::{NodeKind, StateDelta, Update};
use crate::roadmap::ItemKind;
use crate::state::{AuditKind, RunState};

/// What a successfully applied delta changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedDelta {
    /// Work items whose status was set by the node.
    pub updated_items: Vec<String>,
    /// Parent items whose derived status changed as a result.
    pub derived_items: Vec<String>,
    pub design_revised: bool,
    pub roadmap_replaced: bool,
    pub approval_requested: Option<String>,
}

/// Apply `delta` proposed by `node` to `state`, recording audit events at `at`.
///
/// Returns stable, sorted error messages if the delta breaks an ownership
/// rule or leaves the roadmap invalid. `state` is partially modified in that
/// case and must be discarded.
pub fn apply_delta(
    state: &mut RunState,
    node: NodeKind,
    delta: StateDelta,
    at: DateTime<Utc>,
) -> Result<AppliedDelta, Vec<String>> {
    let mut errors = Vec::new();
    let mut applied = AppliedDelta::default();

    for note in &delta.errors {
        state.record(
            at,
            AuditKind::NodeError {
                node,
                kind: note.kind,
                message: note.message.clone(),
            },
        );
    }

    if let Some(revision) = delta.design_revision {
        if node != NodeKind::Documentation {
            errors.push(format!("{node} may not revise the design document"));
        } else if revision.id != state.design.id {
            errors.push(format!(
                "design revision changes id '{}' to '{}'",
                state.design.id, revision.id
            ));
        } else if revision.version != state.design.version + 1 {
            errors.push(format!(
                "design revision must be version {}, got {}",
                state.design.version + 1,
                revision.version
            ));
        } else {
            state.record(
                at,
                AuditKind::DesignRevised {
                    version: revision.version,
                    digest: revision.digest(),
                },
            );
            state.design = revision;
            applied.design_revised = true;
        }
    }

    if let Some(roadmap) = delta.roadmap {
        if node == NodeKind::Planner {
            state.roadmap = roadmap;
            applied.roadmap_replaced = true;
        } else {
            errors.push(format!("{node} may not replace the roadmap"));
        }
    }

    for update in delta.item_updates {
        let is_work_item = state
            .roadmap
            .get(&update.id)
            .is_some_and(|item| item.kind != ItemKind::Phase)
            && !state.roadmap.has_children(&update.id);
        let Some(item) = state.roadmap.get_mut(&update.id) else {
            errors.push(format!("unknown roadmap item '{}'", update.id));
            continue;
        };
        if !is_work_item {
            errors.push(format!("{}: status is derived from its children", update.id));
            continue;
        }
        item.status = update.status;
        if update.bump_attempts && item.attempts < item.max_attempts {
            item.attempts += 1;
        }
        applied.updated_items.push(update.id);
    }

    delta.current_task.apply_to(&mut state.current_task);
    delta.remediation_hint.apply_to(&mut state.remediation_hint);
    if let Some(retries) = delta.retries {
        state.retries = retries;
    }
    if let Some(results) = delta.results {
        state.last_results = results;
    }

    if let Some(output) = delta.output {
        if output.node == node {
            state.outputs.insert(output.key(), output);
        } else {
            errors.push(format!("{node} may not record output for {}", output.node));
        }
    }

    match delta.approval {
        Update::Keep => {}
        Update::Clear => state.pending_approval = None,
        Update::Set(request) => {
            let replaces_pending = state
                .pending_approval
                .as_ref()
                .is_some_and(|current| current.is_pending() && current.id != request.id);
            if replaces_pending {
                errors.push("an approval request is already pending".to_string());
            } else {
                if request.is_pending() {
                    state.approvals_issued += 1;
                    state.record(
                        at,
                        AuditKind::ApprovalRequested {
                            request_id: request.id.clone(),
                            node,
                        },
                    );
                    applied.approval_requested = Some(request.id.clone());
                }
                state.pending_approval = Some(request);
            }
        }
    }

    applied.derived_items = state.roadmap.derive_parent_statuses();
    errors.extend(validate_roadmap(&state.roadmap));

    if errors.is_empty() {
        applied.updated_items.sort();
        Ok(applied)
    } else {
        errors.sort();
        Err(errors)
    }
}
