//! Git adapter: workspace diffs for the sandbox and the version-control
//! collaborator used by the Integration node.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::types::{ChangeKind, DiffSummary, FileChange};

/// Version-control collaborator invoked after an approved integration.
pub trait VersionControl {
    /// Commit the workspace changes summarized by `diff`; returns the commit id.
    fn commit(&self, message: &str, diff: &DiffSummary) -> Result<String>;

    fn push(&self, branch: &str) -> Result<()>;
}

/// `git` subprocesses in one working tree, pushing to `remote`.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    remote: String,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            remote: remote.into(),
        }
    }

    /// Working-tree changes, untracked files included, sorted by path.
    pub fn status_changes(&self) -> Result<DiffSummary> {
        let porcelain = self.git(&["status", "--porcelain=v1", "-uall"])?;
        let mut files = porcelain
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect::<Result<Vec<_>>>()?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(DiffSummary { files })
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn head_message(&self) -> Result<String> {
        Ok(self.git(&["log", "-1", "--format=%B"])?.trim().to_string())
    }

    fn staged_paths(&self) -> Result<Vec<String>> {
        let names = self.git(&["diff", "--cached", "--name-only"])?;
        Ok(names.lines().map(str::to_string).collect())
    }

    /// Run `git <args>` and return stdout; a non-zero exit is an error
    /// carrying stderr.
    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} exited with {:?}: {}",
                args.join(" "),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VersionControl for Git {
    #[instrument(skip_all, fields(workdir = %self.workdir.display(), files = diff.files.len()))]
    fn commit(&self, message: &str, diff: &DiffSummary) -> Result<String> {
        self.git(&["add", "-A"])?;
        let staged = self.staged_paths()?;
        if staged.is_empty() {
            // Already committed by an earlier attempt whose push failed.
            if self.head_message().is_ok_and(|head| head == message.trim()) {
                let sha = self.head_sha()?;
                debug!(commit = %sha, "HEAD already holds this commit");
                return Ok(sha);
            }
            return Err(anyhow!("no staged changes to commit in {}", self.workdir.display()));
        }
        self.git(&["commit", "-q", "-m", message])?;
        let sha = self.head_sha()?;
        info!(commit = %sha, staged = staged.len(), "committed");
        Ok(sha)
    }

    #[instrument(skip_all, fields(remote = %self.remote, branch))]
    fn push(&self, branch: &str) -> Result<()> {
        self.git(&["push", &self.remote, &format!("HEAD:refs/heads/{branch}")])?;
        info!("pushed");
        Ok(())
    }
}

/// Parse one `XY path` line of `git status --porcelain=v1`.
fn parse_status_line(line: &str) -> Result<FileChange> {
    let (code, rest) = match (line.get(..2), line.get(3..)) {
        (Some(code), Some(rest)) if !rest.trim().is_empty() => (code, rest),
        _ => return Err(anyhow!("malformed status line '{line}'")),
    };
    // Renames list `old -> new`; the new path is what was changed.
    let path = rest.rsplit(" -> ").next().unwrap_or(rest).trim().to_string();
    let change = match code.trim() {
        "??" => ChangeKind::Untracked,
        c if c.contains('R') => ChangeKind::Renamed,
        c if c.contains('D') => ChangeKind::Deleted,
        c if c.contains('A') => ChangeKind::Added,
        _ => ChangeKind::Modified,
    };
    Ok(FileChange { path, change })
}
