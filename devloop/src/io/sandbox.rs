//! Execution sandbox abstraction and the local-workspace adapter.
//!
//! The [`SandboxClient`] trait decouples nodes from where commands run.
//! Isolation technology is out of scope: [`LocalSandbox`] runs commands
//! through a shell inside a mounted workspace directory.

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{DiffSummary, ExecutionResult, LogEntry, LogStream};
use crate::error::SandboxError;
use crate::io::git::Git;
use crate::io::process::{TeePaths, run_command};

pub type LogIter<'a> = Box<dyn Iterator<Item = LogEntry> + 'a>;

pub trait SandboxClient {
    fn mount(&self, workspace: &Path) -> Result<(), SandboxError>;

    /// Run one shell command. Non-zero exits and timeouts are reported in the
    /// result; `Err` means the sandbox itself failed.
    fn run(&self, command: &str, timeout: Duration) -> Result<ExecutionResult, SandboxError>;

    fn diff(&self) -> Result<DiffSummary, SandboxError>;

    /// Log lines of the most recent command, read lazily.
    fn stream_logs(&self) -> Result<LogIter<'_>, SandboxError>;

    fn release(&self) -> Result<(), SandboxError>;
}

/// Runs commands with `<shell> -c` in a local workspace directory.
///
/// Each command's output is mirrored to `NNNN.stdout.log` and
/// `NNNN.stderr.log` under `logs_dir`, numbered after the highest sequence
/// already on disk so a later process never overwrites earlier logs.
#[derive(Debug)]
pub struct LocalSandbox {
    shell: String,
    logs_dir: PathBuf,
    output_limit_bytes: usize,
    workspace: RefCell<Option<PathBuf>>,
}

impl LocalSandbox {
    pub fn new(shell: impl Into<String>, logs_dir: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            shell: shell.into(),
            logs_dir: logs_dir.into(),
            output_limit_bytes,
            workspace: RefCell::new(None),
        }
    }

    fn workspace(&self) -> Result<PathBuf, SandboxError> {
        self.workspace.borrow().clone().ok_or(SandboxError::NotMounted)
    }

    fn tee_paths(&self, seq: u64) -> TeePaths {
        TeePaths {
            stdout: Some(self.logs_dir.join(format!("{seq:04}.stdout.log"))),
            stderr: Some(self.logs_dir.join(format!("{seq:04}.stderr.log"))),
        }
    }
}

impl SandboxClient for LocalSandbox {
    #[instrument(skip_all, fields(workspace = %workspace.display()))]
    fn mount(&self, workspace: &Path) -> Result<(), SandboxError> {
        if !workspace.is_dir() {
            return Err(SandboxError::MissingWorkspace(workspace.display().to_string()));
        }
        let mut slot = self.workspace.borrow_mut();
        if slot.as_deref() != Some(workspace) {
            debug!("mounting workspace");
            *slot = Some(workspace.to_path_buf());
        }
        Ok(())
    }

    #[instrument(skip_all, fields(command, timeout_secs = timeout.as_secs()))]
    fn run(&self, command: &str, timeout: Duration) -> Result<ExecutionResult, SandboxError> {
        let workspace = self.workspace()?;
        let seq = latest_log_seq(&self.logs_dir)? + 1;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).current_dir(&workspace);
        let output = run_command(cmd, None, timeout, self.output_limit_bytes, &self.tee_paths(seq))?;

        let diff = self.diff().unwrap_or_else(|err| {
            warn!(err = %err, "could not compute workspace diff");
            DiffSummary::default()
        });
        let result = ExecutionResult {
            command: command.to_string(),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            truncated: output.truncated(),
            diff,
            duration_ms: output.duration.as_millis() as u64,
        };
        info!(exit_code = ?result.exit_code, timed_out = result.timed_out, "sandbox command finished");
        Ok(result)
    }

    fn diff(&self) -> Result<DiffSummary, SandboxError> {
        let workspace = self.workspace()?;
        Ok(Git::new(workspace, "origin").status_changes()?)
    }

    fn stream_logs(&self) -> Result<LogIter<'_>, SandboxError> {
        self.workspace()?;
        let seq = latest_log_seq(&self.logs_dir)?;
        if seq == 0 {
            return Ok(Box::new(std::iter::empty()));
        }
        let tee = self.tee_paths(seq);
        let stdout = open_lines(tee.stdout, LogStream::Stdout);
        let stderr = open_lines(tee.stderr, LogStream::Stderr);
        let entries = stdout
            .chain(stderr)
            .enumerate()
            .map(|(i, (stream, text))| LogEntry {
                seq: i as u64 + 1,
                stream,
                text,
            });
        Ok(Box::new(entries))
    }

    fn release(&self) -> Result<(), SandboxError> {
        if self.workspace.borrow_mut().take().is_some() {
            debug!("released sandbox workspace");
        }
        Ok(())
    }
}

/// Highest `NNNN` among `NNNN.*.log` files in `dir`; 0 when there are none.
fn latest_log_seq(dir: &Path) -> Result<u64, SandboxError> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let entries = fs::read_dir(dir).with_context(|| format!("read log dir {}", dir.display()))?;
    let mut latest = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("read log dir {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str().filter(|n| n.ends_with(".log")) else {
            continue;
        };
        if let Some(seq) = name.split('.').next().and_then(|prefix| prefix.parse::<u64>().ok()) {
            latest = latest.max(seq);
        }
    }
    Ok(latest)
}

fn open_lines(path: Option<PathBuf>, stream: LogStream) -> impl Iterator<Item = (LogStream, String)> {
    let lines: Option<Lines<BufReader<File>>> = path
        .and_then(|p| File::open(p).ok())
        .map(|f| BufReader::new(f).lines());
    lines
        .into_iter()
        .flatten()
        .map_while(Result::ok)
        .map(move |line| (stream, line))
}
