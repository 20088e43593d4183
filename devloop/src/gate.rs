//! Approval gate: suspend points that need an external human decision.
//!
//! A node that needs approval builds an [`ApprovalRequest`] with [`request`]
//! and returns `Transition::Suspended`; the engine checkpoints and stops.
//! The only write path into a suspended run is [`resolve`], after which the
//! next `advance` re-enters the requesting node with the resolution visible
//! in `RunState::pending_approval`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::info;

use crate::core::types::{
    ApprovalPayload, ApprovalRequest, Decision, NodeKind, Resolution, RunStatus,
};
use crate::error::UnknownApprovalError;
use crate::state::{AuditKind, RunState};

/// Build the next approval request for `state`.
///
/// Ids are derived from the run's request counter, so replaying the same
/// run produces the same ids.
pub fn request(
    state: &RunState,
    requested_by: NodeKind,
    summary: impl Into<String>,
    payload: ApprovalPayload,
    rollback_to: NodeKind,
    now: DateTime<Utc>,
) -> ApprovalRequest {
    ApprovalRequest {
        id: format!("apr-{}", state.approvals_issued + 1),
        requested_by,
        task_id: state.current_task.clone(),
        summary: summary.into(),
        payload,
        rollback_to,
        created_at: now,
        resolution: Resolution::Pending,
    }
}

/// Resolved request addressed to `node`, if one is waiting to be consumed.
pub fn resolution_for(state: &RunState, node: NodeKind) -> Option<&ApprovalRequest> {
    state
        .pending_approval
        .as_ref()
        .filter(|req| req.requested_by == node && !req.is_pending())
}

/// Record an external decision on the run's pending request and make the
/// run runnable again.
pub fn resolve(
    state: &mut RunState,
    request_id: &str,
    decision: Decision,
    now: DateTime<Utc>,
) -> Result<(), UnknownApprovalError> {
    let Some(request) = state
        .pending_approval
        .as_mut()
        .filter(|req| req.id == request_id && req.is_pending())
    else {
        return Err(UnknownApprovalError {
            run_id: state.run_id.clone(),
            request_id: request_id.to_string(),
        });
    };
    request.resolution = match decision {
        Decision::Approve => Resolution::Approved {
            at: now,
            edited: None,
        },
        Decision::Edit { payload } => Resolution::Approved {
            at: now,
            edited: Some(payload),
        },
        Decision::Reject { reason } => Resolution::Rejected { at: now, reason },
    };
    let label = request.resolution.label().to_string();
    info!(request_id, resolution = %label, "approval resolved");
    state.record(
        now,
        AuditKind::ApprovalResolved {
            request_id: request_id.to_string(),
            resolution: label,
        },
    );
    if state.status == RunStatus::Suspended {
        state.status = RunStatus::Running;
    }
    Ok(())
}

/// Expire the pending request once it is older than `timeout_secs` (`0` never
/// expires). Returns true if it expired; the run becomes runnable again.
pub fn expire_if_stale(state: &mut RunState, now: DateTime<Utc>, timeout_secs: u64) -> bool {
    if timeout_secs == 0 {
        return false;
    }
    let Some(request) = state.pending_approval.as_mut() else {
        return false;
    };
    let timeout = ChronoDuration::seconds(i64::try_from(timeout_secs).unwrap_or(i64::MAX));
    if !request.is_pending() || now.signed_duration_since(request.created_at) < timeout {
        return false;
    }
    request.resolution = Resolution::Expired { at: now };
    let request_id = request.id.clone();
    info!(request_id = %request_id, "approval request expired");
    state.record(
        now,
        AuditKind::ApprovalResolved {
            request_id,
            resolution: "expired".to_string(),
        },
    );
    state.status = RunStatus::Running;
    true
}

/// Human-readable reason for a rejected or expired request.
pub fn rejection_reason(resolution: &Resolution) -> Option<String> {
    match resolution {
        Resolution::Rejected { reason, .. } => Some(reason.clone()),
        Resolution::Expired { .. } => Some("timeout".to_string()),
        Resolution::Pending | Resolution::Approved { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{design_doc, fixed_time};

    fn suspended() -> RunState {
        let mut state = RunState::new("run-1", design_doc());
        let req = request(
            &state,
            NodeKind::Integration,
            "push t1",
            ApprovalPayload::Commands {
                commands: vec!["git push".to_string()],
            },
            NodeKind::Architect,
            fixed_time(),
        );
        assert_eq!(req.id, "apr-1");
        state.approvals_issued = 1;
        state.pending_approval = Some(req);
        state.status = RunStatus::Suspended;
        state
    }

    #[test]
    fn resolve_records_decision_and_resumes() {
        let mut state = suspended();
        resolve(
            &mut state,
            "apr-1",
            Decision::Edit {
                payload: "better message".to_string(),
            },
            fixed_time(),
        )
        .expect("resolve");
        assert_eq!(state.status, RunStatus::Running);
        let req = resolution_for(&state, NodeKind::Integration).expect("resolved");
        assert_eq!(
            req.resolution,
            Resolution::Approved {
                at: fixed_time(),
                edited: Some("better message".to_string()),
            }
        );
        assert!(resolution_for(&state, NodeKind::Coder).is_none());
    }

    #[test]
    fn resolve_rejects_unknown_or_already_resolved_ids() {
        let mut state = suspended();
        let err = resolve(&mut state, "apr-9", Decision::Approve, fixed_time()).unwrap_err();
        assert_eq!(err.request_id, "apr-9");

        resolve(&mut state, "apr-1", Decision::Approve, fixed_time()).expect("resolve");
        assert!(resolve(&mut state, "apr-1", Decision::Approve, fixed_time()).is_err());
    }

    #[test]
    fn stale_requests_expire_as_timeout_rejections() {
        let mut state = suspended();
        let later = fixed_time() + ChronoDuration::seconds(59);
        assert!(!expire_if_stale(&mut state, later, 60));
        assert!(!expire_if_stale(&mut state, later, 0));

        let later = fixed_time() + ChronoDuration::seconds(60);
        assert!(expire_if_stale(&mut state, later, 60));
        assert_eq!(state.status, RunStatus::Running);
        let req = state.pending_approval.as_ref().expect("request");
        assert_eq!(rejection_reason(&req.resolution).as_deref(), Some("timeout"));
    }
}
