//! Documentation: validate and normalize the design document.

use serde_json::json;

use crate::core::types::{ErrorKind, NodeKind, NodeOutcome, StateDelta, Transition};
use crate::design::{first_heading, normalize_body};
use crate::error::NodeError;
use crate::state::RunState;

use super::record;

pub fn run(state: &RunState) -> Result<NodeOutcome, NodeError> {
    let design = &state.design;
    let body = normalize_body(&design.body);
    let title = if design.title.trim().is_empty() {
        first_heading(&body).unwrap_or_default()
    } else {
        design.title.trim().to_string()
    };

    let mut problems = Vec::new();
    if body.trim().is_empty() {
        problems.push("design document body is empty");
    }
    if title.is_empty() {
        problems.push("design document has no title");
    }
    if !problems.is_empty() {
        let reason = problems.join("; ");
        let mut delta = StateDelta::default();
        delta.error(ErrorKind::InvalidDesign, reason.clone());
        let delta = delta.with_output(record(
            state,
            NodeKind::Documentation,
            "design document rejected",
            json!({ "problems": problems }),
        ));
        return Ok(NodeOutcome::new(
            delta,
            Transition::Halt {
                kind: ErrorKind::InvalidDesign,
                reason,
            },
        ));
    }

    let mut delta = StateDelta::default();
    let mut version = design.version;
    if body != design.body || title != design.title {
        let mut revised = design.revise(body);
        revised.title = title;
        version = revised.version;
        delta.design_revision = Some(revised);
    }
    let summary = if delta.design_revision.is_some() {
        format!("design normalized to version {version}")
    } else {
        format!("design version {version} validated")
    };
    let detail = json!({ "revised": delta.design_revision.is_some(), "version": version });
    let mut output = record(state, NodeKind::Documentation, summary, detail);
    if let Some(revised) = &delta.design_revision {
        output.design = revised.reference();
    }
    Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::DesignDocument;

    #[test]
    fn normalizes_into_an_audited_revision() {
        let state = RunState::new("run-1", DesignDocument::new("todo", "", "# Todo\r\nbody  \r\n"));
        let outcome = run(&state).expect("run");
        assert_eq!(outcome.transition, Transition::Continue);
        let revised = outcome.delta.design_revision.expect("revision");
        assert_eq!(revised.version, 2);
        assert_eq!(revised.title, "Todo");
        assert_eq!(revised.body, "# Todo\nbody\n");
        assert_eq!(outcome.delta.output.expect("output").design, revised.reference());
    }

    #[test]
    fn clean_document_is_not_revised() {
        let state = RunState::new("run-1", DesignDocument::new("todo", "Todo", "# Todo\nbody\n"));
        let outcome = run(&state).expect("run");
        assert!(outcome.delta.design_revision.is_none());
        let output = outcome.delta.output.expect("output");
        assert_eq!(output.design.version, 1);
    }

    #[test]
    fn empty_document_halts() {
        let state = RunState::new("run-1", DesignDocument::new("todo", "Todo", "  \n"));
        let outcome = run(&state).expect("run");
        assert!(matches!(
            outcome.transition,
            Transition::Halt {
                kind: ErrorKind::InvalidDesign,
                ..
            }
        ));
        assert_eq!(outcome.delta.errors.len(), 1);
    }
}
