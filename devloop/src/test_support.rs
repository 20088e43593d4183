//! Test-only builders and scripted fakes for the engine's capabilities.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

use crate::core::types::{
    ChangeKind, DiffSummary, ExecutionResult, FileChange, LogEntry, LogStream, NodeKind,
};
use crate::design::DesignDocument;
use crate::error::{LlmError, SandboxError};
use crate::io::clock::Clock;
use crate::io::config::EngineConfig;
use crate::io::git::VersionControl;
use crate::io::init::{EnginePaths, InitOptions, init_engine};
use crate::io::llm::{CompletionRequest, LlmClient};
use crate::io::prompt::PromptBuilder;
use crate::io::sandbox::{LogIter, SandboxClient};
use crate::engine::Engine;
use crate::io::run_store::RunStore;
use crate::nodes::{Capabilities, NodeEnv};
use crate::roadmap::{ItemKind, ItemStatus, Roadmap, RoadmapItem};

fn item(id: &str, kind: ItemKind, parent: Option<&str>, order: i64, title: String) -> RoadmapItem {
    RoadmapItem {
        id: id.to_string(),
        kind,
        order,
        title,
        description: String::new(),
        status: ItemStatus::Pending,
        owner_role: if kind == ItemKind::Phase {
            NodeKind::Architect
        } else {
            NodeKind::Coder
        },
        parent_id: parent.map(str::to_string),
        depends_on: Vec::new(),
        attempts: 0,
        max_attempts: 3,
    }
}

pub fn phase(id: &str, order: i64) -> RoadmapItem {
    item(id, ItemKind::Phase, None, order, format!("Phase {id}"))
}

pub fn task(id: &str, parent: &str, order: i64) -> RoadmapItem {
    item(id, ItemKind::Task, Some(parent), order, format!("Task {id}"))
}

pub fn subtask(id: &str, parent: &str, order: i64) -> RoadmapItem {
    item(id, ItemKind::Subtask, Some(parent), order, format!("Subtask {id}"))
}

pub fn roadmap_of(items: Vec<RoadmapItem>) -> Roadmap {
    Roadmap {
        items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
    }
}

pub fn design_doc() -> DesignDocument {
    DesignDocument::new(
        "todo",
        "Todo",
        "# Todo\n\nA command line todo list with add, list and done.\n",
    )
}

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Config with instant LLM retries, suitable for tests.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.llm.backoff_base_ms = 0;
    cfg.llm.backoff_max_ms = 0;
    cfg.tester.commands = vec!["run-tests".to_string()];
    cfg
}

pub fn exec_ok(command: &str) -> ExecutionResult {
    ExecutionResult {
        command: command.to_string(),
        exit_code: Some(0),
        timed_out: false,
        stdout: format!("{command}: ok"),
        stderr: String::new(),
        truncated: false,
        diff: DiffSummary::default(),
        duration_ms: 1,
    }
}

pub fn exec_failed(command: &str, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
        ..exec_ok(command)
    }
}

pub fn diff_of(paths: &[&str]) -> DiffSummary {
    DiffSummary {
        files: paths
            .iter()
            .map(|p| FileChange {
                path: p.to_string(),
                change: ChangeKind::Modified,
            })
            .collect(),
    }
}

/// Returns queued answers in order; `Unavailable` once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: RefCell<VecDeque<Result<Value, LlmError>>>,
    requests: RefCell<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Result<Value, LlmError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<Value, LlmError>) {
        self.responses.borrow_mut().push_back(response);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.borrow().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, request: &CompletionRequest) -> Result<Value, LlmError> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Unavailable("script exhausted".to_string())))
    }
}

/// Sandbox whose commands succeed unless a result was queued for them.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    queued: RefCell<HashMap<String, VecDeque<ExecutionResult>>>,
    always_fail: RefCell<HashSet<String>>,
    diff: RefCell<DiffSummary>,
    logs: RefCell<Vec<LogEntry>>,
    mounted: RefCell<Option<PathBuf>>,
    mounts: Cell<u32>,
    releases: Cell<u32>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one result for the next run of `command`.
    pub fn queue(&self, result: ExecutionResult) {
        self.queued
            .borrow_mut()
            .entry(result.command.clone())
            .or_default()
            .push_back(result);
    }

    pub fn always_fail(&self, command: &str) {
        self.always_fail.borrow_mut().insert(command.to_string());
    }

    pub fn set_diff(&self, diff: DiffSummary) {
        *self.diff.borrow_mut() = diff;
    }

    pub fn set_logs(&self, lines: &[(LogStream, &str)]) {
        *self.logs.borrow_mut() = lines
            .iter()
            .enumerate()
            .map(|(i, (stream, text))| LogEntry {
                seq: i as u64 + 1,
                stream: *stream,
                text: text.to_string(),
            })
            .collect();
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.borrow().is_some()
    }

    pub fn mounts(&self) -> u32 {
        self.mounts.get()
    }

    pub fn releases(&self) -> u32 {
        self.releases.get()
    }
}

impl SandboxClient for ScriptedSandbox {
    fn mount(&self, workspace: &Path) -> Result<(), SandboxError> {
        self.mounts.set(self.mounts.get() + 1);
        *self.mounted.borrow_mut() = Some(workspace.to_path_buf());
        Ok(())
    }

    fn run(&self, command: &str, _timeout: Duration) -> Result<ExecutionResult, SandboxError> {
        if !self.is_mounted() {
            return Err(SandboxError::NotMounted);
        }
        self.commands.borrow_mut().push(command.to_string());
        if self.always_fail.borrow().contains(command) {
            return Ok(exec_failed(command, "error: scripted failure"));
        }
        let queued = self
            .queued
            .borrow_mut()
            .get_mut(command)
            .and_then(VecDeque::pop_front);
        let mut result = queued.unwrap_or_else(|| exec_ok(command));
        result.diff = self.diff.borrow().clone();
        Ok(result)
    }

    fn diff(&self) -> Result<DiffSummary, SandboxError> {
        if !self.is_mounted() {
            return Err(SandboxError::NotMounted);
        }
        Ok(self.diff.borrow().clone())
    }

    fn stream_logs(&self) -> Result<LogIter<'_>, SandboxError> {
        let logs = self.logs.borrow().clone();
        Ok(Box::new(logs.into_iter()))
    }

    fn release(&self) -> Result<(), SandboxError> {
        self.releases.set(self.releases.get() + 1);
        *self.mounted.borrow_mut() = None;
        Ok(())
    }
}

/// Records commits and pushes instead of touching a repository.
#[derive(Debug, Default)]
pub struct RecordingVcs {
    commits: RefCell<Vec<(String, DiffSummary)>>,
    pushes: RefCell<Vec<String>>,
    fail_push: Cell<bool>,
}

impl RecordingVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_pushes(&self, fail: bool) {
        self.fail_push.set(fail);
    }

    pub fn commits(&self) -> Vec<(String, DiffSummary)> {
        self.commits.borrow().clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.borrow().clone()
    }
}

impl VersionControl for RecordingVcs {
    fn commit(&self, message: &str, diff: &DiffSummary) -> Result<String> {
        let mut commits = self.commits.borrow_mut();
        commits.push((message.to_string(), diff.clone()));
        Ok(format!("sha-{}", commits.len()))
    }

    fn push(&self, branch: &str) -> Result<()> {
        if self.fail_push.get() {
            bail!("remote rejected push to {branch}");
        }
        self.pushes.borrow_mut().push(branch.to_string());
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.now.set(self.now.get() + ChronoDuration::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(fixed_time())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Owns everything a node needs so node tests can build a [`NodeEnv`].
pub struct NodeHarness<'a> {
    pub llm: &'a ScriptedLlm,
    pub sandbox: ScriptedSandbox,
    pub vcs: RecordingVcs,
    pub clock: ManualClock,
    pub cfg: EngineConfig,
    prompts: PromptBuilder,
    sensitive: Vec<Regex>,
}

impl<'a> NodeHarness<'a> {
    pub fn new(llm: &'a ScriptedLlm) -> Self {
        Self::with_config(llm, test_config())
    }

    pub fn with_config(llm: &'a ScriptedLlm, cfg: EngineConfig) -> Self {
        let sandbox = ScriptedSandbox::new();
        // Mounting the fake cannot fail.
        let _ = sandbox.mount(Path::new("/workspace"));
        let sensitive = cfg.sensitive_patterns().unwrap_or_default();
        Self {
            llm,
            sandbox,
            vcs: RecordingVcs::new(),
            clock: ManualClock::default(),
            prompts: PromptBuilder::new(cfg.llm.prompt_budget_bytes),
            sensitive,
            cfg,
        }
    }

    pub fn env(&self) -> NodeEnv<'_> {
        NodeEnv {
            caps: Capabilities {
                llm: self.llm,
                sandbox: &self.sandbox,
                vcs: &self.vcs,
                clock: &self.clock,
            },
            cfg: &self.cfg,
            prompts: &self.prompts,
            sensitive: &self.sensitive,
        }
    }
}

/// Temporary project root scaffolded by `init_engine`.
pub struct TempProject {
    dir: tempfile::TempDir,
    pub paths: EnginePaths,
}

impl TempProject {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let paths = init_engine(dir.path(), &InitOptions { force: false })?;
        Ok(Self { dir, paths })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// A scaffolded project plus scripted capabilities for driving an [`Engine`].
pub struct TestRig {
    pub project: TempProject,
    pub llm: ScriptedLlm,
    pub sandbox: ScriptedSandbox,
    pub vcs: RecordingVcs,
    pub clock: ManualClock,
    pub cfg: EngineConfig,
}

impl TestRig {
    pub fn new() -> Result<Self> {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Result<Self> {
        let mut cfg = test_config();
        adjust(&mut cfg);
        Ok(Self {
            project: TempProject::new()?,
            llm: ScriptedLlm::default(),
            sandbox: ScriptedSandbox::new(),
            vcs: RecordingVcs::new(),
            clock: ManualClock::default(),
            cfg,
        })
    }

    pub fn caps(&self) -> Capabilities<'_> {
        Capabilities {
            llm: &self.llm,
            sandbox: &self.sandbox,
            vcs: &self.vcs,
            clock: &self.clock,
        }
    }

    pub fn store(&self, run_id: &str) -> RunStore {
        RunStore::new(self.project.paths.run(run_id))
    }

    pub fn engine(&self, run_id: &str) -> Result<Engine<'_>> {
        Engine::new(
            self.cfg.clone(),
            self.caps(),
            self.store(run_id),
            self.project.root(),
        )
    }
}
