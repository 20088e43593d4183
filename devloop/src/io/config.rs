//! Engine configuration stored under `.devloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::topology::ContinuePolicy;

/// Engine configuration (TOML).
///
/// Edited by humans; missing sections and fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard ceiling on loop iterations (passes through the Architect).
    pub max_iterations: u32,

    /// Retry budget given to every roadmap item the planner creates.
    pub task_max_attempts: u32,

    #[serde(rename = "continue")]
    pub continue_policy: ContinuePolicy,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub planner: PlannerConfig,
    pub coder: CoderConfig,
    pub tester: TesterConfig,
    pub approval: ApprovalConfig,
    pub integration: IntegrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Command that reads a prompt on stdin and prints a JSON object.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Calls per request, including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub output_limit_bytes: usize,
    /// Prompts above this size shed droppable context sections.
    pub prompt_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Shell used to run commands, invoked as `<shell> -c <command>`.
    pub shell: String,
    /// Workspace directory, relative to the repository root.
    pub workspace: String,
    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    pub retry_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoderConfig {
    pub retry_limit: u32,
    /// Bytes of failure output appended to the retry context.
    pub failure_context_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TesterConfig {
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending requests older than this expire; `0` never expires.
    pub timeout_secs: u64,
    /// Regexes; a Coder command matching any of them needs approval.
    pub sensitive_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IntegrationConfig {
    pub remote: String,
    pub branch: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            task_max_attempts: 3,
            continue_policy: ContinuePolicy::default(),
            llm: LlmConfig::default(),
            sandbox: SandboxConfig::default(),
            planner: PlannerConfig::default(),
            coder: CoderConfig::default(),
            tester: TesterConfig::default(),
            approval: ApprovalConfig::default(),
            integration: IntegrationConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string(), "--json".to_string()],
            timeout_secs: 120,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            workspace: ".".to_string(),
            command_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { retry_limit: 1 }
    }
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            failure_context_bytes: 4_000,
        }
    }
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            commands: vec!["cargo test".to_string()],
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            sensitive_commands: vec![
                r"\brm\s+-rf\b".to_string(),
                r"\bgit\s+push\b".to_string(),
                r"\bcurl\b.*\|\s*(ba)?sh\b".to_string(),
            ],
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.task_max_attempts == 0 {
            return Err(anyhow!("task_max_attempts must be > 0"));
        }
        if self.llm.command.is_empty() || self.llm.command[0].trim().is_empty() {
            return Err(anyhow!("llm.command must be a non-empty array"));
        }
        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be > 0"));
        }
        if self.llm.max_attempts == 0 {
            return Err(anyhow!("llm.max_attempts must be > 0"));
        }
        if self.llm.backoff_max_ms < self.llm.backoff_base_ms {
            return Err(anyhow!("llm.backoff_max_ms must be >= llm.backoff_base_ms"));
        }
        if self.llm.output_limit_bytes == 0 {
            return Err(anyhow!("llm.output_limit_bytes must be > 0"));
        }
        if self.llm.prompt_budget_bytes == 0 {
            return Err(anyhow!("llm.prompt_budget_bytes must be > 0"));
        }
        if self.sandbox.shell.trim().is_empty() {
            return Err(anyhow!("sandbox.shell must not be empty"));
        }
        if self.sandbox.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.tester.commands.iter().any(|c| c.trim().is_empty()) || self.tester.commands.is_empty()
        {
            return Err(anyhow!("tester.commands must be a non-empty array of commands"));
        }
        for pattern in &self.approval.sensitive_commands {
            Regex::new(pattern)
                .with_context(|| format!("approval.sensitive_commands: invalid regex {pattern:?}"))?;
        }
        if self.integration.branch.trim().is_empty() || self.integration.remote.trim().is_empty() {
            return Err(anyhow!("integration.remote and integration.branch must be set"));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.command_timeout_secs)
    }

    /// Compiled sensitive-command patterns. Call after [`EngineConfig::validate`].
    pub fn sensitive_patterns(&self) -> Result<Vec<Regex>> {
        self.approval
            .sensitive_commands
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("compile regex {p:?}")))
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.coder.retry_limit, 2);
        assert_eq!(cfg.planner.retry_limit, 1);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.continue_policy.fail_fast = true;
        cfg.continue_policy.stop_when_stalled = true;
        cfg.approval.timeout_secs = 3600;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 4\n[tester]\ncommands = [\"make check\"]\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 4);
        assert_eq!(cfg.tester.commands, vec!["make check"]);
        assert_eq!(cfg.llm, LlmConfig::default());
    }

    #[test]
    fn validate_rejects_bad_regex_and_zero_limits() {
        let mut cfg = EngineConfig::default();
        cfg.approval.sensitive_commands = vec!["(".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.max_iterations = 0;
        let err = cfg.validate().expect_err("zero ceiling");
        assert!(err.to_string().contains("max_iterations"));
    }
}
