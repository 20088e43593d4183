//! Log-Analyst: scan failure output and leave a remediation hint for the
//! next Architect pass.
//!
//! Classification is a fixed table of regex heuristics; the model is not
//! consulted. The item's status was already settled by the failing node.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::{info, warn};

use crate::core::types::{NodeKind, NodeOutcome, StateDelta, Transition, Update};
use crate::error::NodeError;
use crate::state::RunState;

use super::{NodeEnv, record};

/// Lines of evidence quoted in the hint.
const MAX_EVIDENCE: usize = 5;

struct Signature {
    label: &'static str,
    pattern: Regex,
    advice: &'static str,
}

fn signature(label: &'static str, pattern: &str, advice: &'static str) -> Signature {
    Signature {
        label,
        pattern: Regex::new(pattern).expect("log signature regex should be valid"),
        advice,
    }
}

static SIGNATURES: LazyLock<Vec<Signature>> = LazyLock::new(|| {
    vec![
        signature(
            "timeout",
            r"(?i)\btimed out\b",
            "a command timed out; split the work or avoid long-running commands",
        ),
        signature(
            "missing_command",
            r"(?i)command not found",
            "a tool is missing from the sandbox; use available tools or install it first",
        ),
        signature(
            "missing_file",
            r"(?i)no such file or directory",
            "a referenced path does not exist; create it or fix the path",
        ),
        signature(
            "panic",
            r"panicked at",
            "code panicked at runtime; check the reported location",
        ),
        signature(
            "test_failure",
            r"\bFAILED\b|test result: FAILED",
            "tests are failing; fix the behavior the failing tests describe",
        ),
        signature(
            "compile_error",
            r"(?m)^error(\[E\d+\])?:",
            "the build fails; fix the reported compiler errors before anything else",
        ),
    ]
});

pub fn run(state: &RunState, env: &NodeEnv<'_>) -> Result<NodeOutcome, NodeError> {
    let mut lines: Vec<String> = Vec::new();
    let mut commands = Vec::new();
    for result in state.last_results.iter().filter(|r| !r.success()) {
        commands.push(result.command.clone());
        if result.timed_out {
            lines.push(format!("{} timed out", result.command));
        }
        lines.extend(result.stdout.lines().map(str::to_string));
        lines.extend(result.stderr.lines().map(str::to_string));
    }
    match env.caps.sandbox.stream_logs() {
        Ok(entries) => lines.extend(entries.map(|entry| entry.text)),
        Err(err) => warn!(err = %err, "could not read sandbox logs"),
    }

    let (matched, hint) = analyze(&lines);
    info!(task = ?state.current_task, matched = ?matched, "failure analyzed");
    let output = record(
        state,
        NodeKind::LogAnalyst,
        format!("{} signature(s) matched", matched.len()),
        json!({ "commands": commands, "matched": matched, "hint": hint }),
    );
    let delta = StateDelta {
        remediation_hint: Update::Set(hint),
        ..StateDelta::default()
    };
    Ok(NodeOutcome::new(delta.with_output(output), Transition::Continue))
}

/// Match labels and the rendered hint for a set of log lines.
fn analyze(lines: &[String]) -> (Vec<&'static str>, String) {
    let mut matched = Vec::new();
    let mut advice = Vec::new();
    let mut evidence: Vec<&str> = Vec::new();
    for sig in SIGNATURES.iter() {
        let hits: Vec<&str> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| sig.pattern.is_match(l))
            .collect();
        if hits.is_empty() {
            continue;
        }
        matched.push(sig.label);
        advice.push(format!("- {}", sig.advice));
        for hit in hits {
            if evidence.len() < MAX_EVIDENCE && !evidence.contains(&hit) {
                evidence.push(hit);
            }
        }
    }

    if matched.is_empty() {
        let tail: Vec<&str> = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .rev()
            .take(MAX_EVIDENCE)
            .collect();
        let mut hint = "The previous attempt failed without a recognized cause.".to_string();
        if !tail.is_empty() {
            hint.push_str("\nLast output:\n");
            for line in tail.into_iter().rev() {
                hint.push_str(&format!("> {line}\n"));
            }
        }
        return (matched, hint.trim_end().to_string());
    }

    let mut hint = advice.join("\n");
    hint.push_str("\nEvidence:\n");
    for line in evidence {
        hint.push_str(&format!("> {line}\n"));
    }
    (matched, hint.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogStream;
    use crate::test_support::{NodeHarness, ScriptedLlm, design_doc, exec_failed, exec_ok};

    #[test]
    fn compile_errors_produce_targeted_hint() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        let mut state = RunState::new("run-1", design_doc());
        state.current_task = Some("t1".to_string());
        state.last_results = vec![
            exec_ok("cargo fmt"),
            exec_failed("cargo build", "error[E0425]: cannot find value `x` in this scope"),
        ];

        let outcome = run(&state, &harness.env()).expect("run");
        assert_eq!(outcome.transition, Transition::Continue);
        let Update::Set(hint) = outcome.delta.remediation_hint else {
            panic!("expected a hint");
        };
        assert!(hint.contains("compiler errors"));
        assert!(hint.contains("> error[E0425]"));
        assert!(outcome.delta.item_updates.is_empty());
        assert!(llm.requests().is_empty());
    }

    #[test]
    fn sandbox_logs_are_scanned_too() {
        let llm = ScriptedLlm::default();
        let harness = NodeHarness::new(&llm);
        harness.sandbox.set_logs(&[
            (LogStream::Stdout, "running 3 tests"),
            (LogStream::Stderr, "thread 'main' panicked at src/main.rs:4:5"),
        ]);
        let state = RunState::new("run-1", design_doc());
        let outcome = run(&state, &harness.env()).expect("run");
        let output = outcome.delta.output.expect("output");
        assert_eq!(output.detail["matched"], json!(["panic"]));
    }

    #[test]
    fn unrecognized_failures_quote_the_tail() {
        let lines: Vec<String> = (1..=8).map(|i| format!("line {i}")).collect();
        let (matched, hint) = analyze(&lines);
        assert!(matched.is_empty());
        assert!(hint.ends_with("> line 8"));
        assert!(hint.contains("> line 4"));
        assert!(!hint.contains("> line 3"));
    }
}
