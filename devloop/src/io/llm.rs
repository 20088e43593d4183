//! Language-model client abstraction and its command-backed adapter.
//!
//! The [`LlmClient`] trait is the only way nodes reach a model. Tests use
//! scripted clients that return predetermined JSON without spawning
//! processes. Output validation and retry/backoff live here so every client
//! gets the same treatment.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use jsonschema::{Validator, validator_for};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::budget::backoff_delay;
use crate::core::types::NodeKind;
use crate::error::LlmError;
use crate::io::config::LlmConfig;
use crate::io::process::{TeePaths, run_command};

const ROADMAP_SCHEMA: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/schemas/roadmap.schema.json"));
const APPROACH_SCHEMA: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/schemas/approach.schema.json"));
const CODER_SCHEMA: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/schemas/coder.schema.json"));

fn compile(source: &str) -> Validator {
    let value: Value = serde_json::from_str(source).expect("embedded schema should be JSON");
    validator_for(&value).expect("embedded schema should compile")
}

static ROADMAP_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(ROADMAP_SCHEMA));
static APPROACH_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(APPROACH_SCHEMA));
static CODER_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(CODER_SCHEMA));

/// JSON shape a completion must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSchema {
    Roadmap,
    Approach,
    CoderPlan,
}

impl OutputSchema {
    pub fn source(self) -> &'static str {
        match self {
            OutputSchema::Roadmap => ROADMAP_SCHEMA,
            OutputSchema::Approach => APPROACH_SCHEMA,
            OutputSchema::CoderPlan => CODER_SCHEMA,
        }
    }

    fn validator(self) -> &'static Validator {
        match self {
            OutputSchema::Roadmap => &ROADMAP_VALIDATOR,
            OutputSchema::Approach => &APPROACH_VALIDATOR,
            OutputSchema::CoderPlan => &CODER_VALIDATOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraints {
    pub schema: OutputSchema,
    /// Set on retries after a malformed answer.
    pub strict: bool,
    pub timeout: Duration,
}

/// One stateless request to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub node: NodeKind,
    /// Rendered prompt.
    pub context: String,
    pub constraints: Constraints,
}

pub trait LlmClient {
    /// Return the model's answer as a JSON value.
    fn complete(&self, request: &CompletionRequest) -> Result<Value, LlmError>;
}

/// Bounded retry with exponential backoff for transient model failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Calls per request, including the first one.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }
}

/// Check a raw answer against the request's schema.
pub fn validate_output(schema: OutputSchema, value: &Value) -> Result<(), LlmError> {
    let validator = schema.validator();
    if validator.is_valid(value) {
        return Ok(());
    }
    let messages = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(LlmError::MalformedResponse(format!(
        "schema validation failed: {}",
        messages.join("; ")
    )))
}

/// Call the model, validate and deserialize its answer, retrying with backoff.
///
/// Both unavailable and malformed answers are retried; the last error is
/// returned once `policy.max_attempts` calls have failed.
#[instrument(skip_all, fields(node = %request.node, max_attempts = policy.max_attempts))]
pub fn complete_json<T: DeserializeOwned>(
    client: &dyn LlmClient,
    request: &CompletionRequest,
    policy: RetryPolicy,
) -> Result<T, LlmError> {
    let mut last_err = LlmError::Unavailable("no attempts made".to_string());
    for attempt in 0..policy.max_attempts.max(1) {
        if attempt > 0 {
            let delay = backoff_delay(policy.backoff_base, policy.backoff_max, attempt - 1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying llm call");
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        let result = client.complete(request).and_then(|value| {
            validate_output(request.constraints.schema, &value)?;
            serde_json::from_value::<T>(value)
                .map_err(|err| LlmError::MalformedResponse(format!("deserialize: {err}")))
        });
        match result {
            Ok(parsed) => return Ok(parsed),
            Err(err) => {
                warn!(attempt, err = %err, "llm call failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Client that runs a configured command: prompt on stdin, JSON object on stdout.
#[derive(Debug, Clone)]
pub struct CommandLlmClient {
    command: Vec<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
}

impl CommandLlmClient {
    pub fn new(cfg: &LlmConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: cfg.command.clone(),
            workdir: workdir.into(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl LlmClient for CommandLlmClient {
    #[instrument(skip_all, fields(node = %request.node, strict = request.constraints.strict))]
    fn complete(&self, request: &CompletionRequest) -> Result<Value, LlmError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(LlmError::Unavailable("llm.command is empty".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("DEVLOOP_NODE", request.node.as_str())
            .env("DEVLOOP_STRICT", if request.constraints.strict { "1" } else { "0" });

        let output = run_command(
            cmd,
            Some(request.context.as_bytes()),
            request.constraints.timeout,
            self.output_limit_bytes,
            &TeePaths::default(),
        )
        .map_err(|err| LlmError::Unavailable(format!("{err:#}")))?;

        if output.timed_out {
            return Err(LlmError::Unavailable(format!(
                "timed out after {:?}",
                request.constraints.timeout
            )));
        }
        if !output.status.success() {
            return Err(LlmError::Unavailable(format!(
                "exited with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            )));
        }
        if output.stdout_truncated > 0 {
            return Err(LlmError::MalformedResponse(
                "response exceeded the output limit".to_string(),
            ));
        }
        parse_json_object(&output.stdout_lossy())
    }
}

/// Parse the JSON object in `text`, tolerating prose or fences around it.
fn parse_json_object(text: &str) -> Result<Value, LlmError> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end)
        && start < end
        && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&trimmed[start..=end])
    {
        return Ok(value);
    }
    Err(LlmError::MalformedResponse(
        "response is not a JSON object".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::cell::RefCell;

    struct Replay {
        answers: RefCell<Vec<Result<Value, LlmError>>>,
    }

    impl LlmClient for Replay {
        fn complete(&self, _request: &CompletionRequest) -> Result<Value, LlmError> {
            self.answers.borrow_mut().remove(0)
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Approach {
        approach: String,
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            node: NodeKind::Architect,
            context: "ctx".to_string(),
            constraints: Constraints {
                schema: OutputSchema::Approach,
                strict: false,
                timeout: Duration::from_secs(1),
            },
        }
    }

    #[test]
    fn retries_until_a_valid_answer() {
        let client = Replay {
            answers: RefCell::new(vec![
                Err(LlmError::Unavailable("down".to_string())),
                Ok(json!({"wrong": true})),
                Ok(json!({"approach": "do it"})),
            ]),
        };
        let parsed: Approach =
            complete_json(&client, &request(), RetryPolicy::immediate(3)).expect("answer");
        assert_eq!(parsed.approach, "do it");
    }

    #[test]
    fn returns_last_error_when_attempts_run_out() {
        let client = Replay {
            answers: RefCell::new(vec![
                Err(LlmError::Unavailable("down".to_string())),
                Ok(json!({"approach": ""})),
            ]),
        };
        let err = complete_json::<Approach>(&client, &request(), RetryPolicy::immediate(2))
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }

    #[test]
    fn embedded_schemas_accept_their_examples() {
        let roadmap = json!({
            "phases": [{"id": "p1", "title": "Core", "tasks": [
                {"id": "t1", "title": "Model"},
                {"id": "t2", "title": "Api", "depends_on": ["t1"], "subtasks": [
                    {"id": "s1", "title": "Routes"}
                ]}
            ]}]
        });
        assert!(validate_output(OutputSchema::Roadmap, &roadmap).is_ok());
        assert!(validate_output(OutputSchema::Roadmap, &json!({"phases": []})).is_err());
        let plan = json!({"plan": "p", "commands": ["cargo fmt"]});
        assert!(validate_output(OutputSchema::CoderPlan, &plan).is_ok());
    }

    #[test]
    fn parses_object_wrapped_in_prose() {
        let value = parse_json_object("Sure:\n```json\n{\"a\": 1}\n```\n").expect("parse");
        assert_eq!(value, json!({"a": 1}));
        assert!(parse_json_object("[1, 2]").is_err());
    }

    #[test]
    fn command_client_reads_stdout_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = LlmConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat >/dev/null; echo '{\"approach\": \"x\"}'".to_string(),
            ],
            ..LlmConfig::default()
        };
        let client = CommandLlmClient::new(&cfg, temp.path());
        let value = client.complete(&request()).expect("complete");
        assert_eq!(value, json!({"approach": "x"}));

        let failing = CommandLlmClient::new(
            &LlmConfig {
                command: vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
                ..LlmConfig::default()
            },
            temp.path(),
        );
        assert!(matches!(
            failing.complete(&request()),
            Err(LlmError::Unavailable(_))
        ));
    }
}
