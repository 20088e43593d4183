//! Scaffolding and canonical paths for `.devloop/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};
use crate::core::types::NodeKind;

/// Canonical paths within `.devloop/` for a project root.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub devloop_dir: PathBuf,
    pub config_path: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub design_path: PathBuf,
}

impl EnginePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let devloop_dir = root.join(".devloop");
        Self {
            root: root.clone(),
            config_path: devloop_dir.join("config.toml"),
            runs_dir: devloop_dir.join("runs"),
            gitignore_path: devloop_dir.join(".gitignore"),
            design_path: root.join("DESIGN.md"),
            devloop_dir,
        }
    }

    pub fn run(&self, run_id: &str) -> RunPaths {
        RunPaths::new(self.runs_dir.join(run_id))
    }

    /// Ids of existing runs, sorted.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        if !self.runs_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)
            .with_context(|| format!("read runs dir {}", self.runs_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read entry in {}", self.runs_dir.display()))?;
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                runs.push(name.to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Files owned by one run under `.devloop/runs/<run-id>/`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub audit_path: PathBuf,
    pub outputs_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub outcome_path: PathBuf,
}

impl RunPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            checkpoints_dir: dir.join("checkpoints"),
            audit_path: dir.join("audit.jsonl"),
            outputs_dir: dir.join("outputs"),
            sandbox_dir: dir.join("sandbox"),
            outcome_path: dir.join("outcome.json"),
            dir,
        }
    }

    pub fn output_path(&self, node: NodeKind, iteration: u32) -> PathBuf {
        self.outputs_dir.join(format!("{node}-{iteration}.json"))
    }
}

/// Options for `init_engine`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the config and design placeholder.
    pub force: bool,
}

/// Create `.devloop/` scaffolding in `root` plus a `DESIGN.md` placeholder.
///
/// Fails if `.devloop/` already exists unless `options.force` is set. An
/// existing design document is never overwritten.
pub fn init_engine(root: &Path, options: &InitOptions) -> Result<EnginePaths> {
    let paths = EnginePaths::new(root);
    if paths.devloop_dir.exists() && !paths.devloop_dir.is_dir() {
        return Err(anyhow!("devloop init: .devloop exists but is not a directory"));
    }
    if paths.devloop_dir.exists() && !options.force {
        return Err(anyhow!(
            "devloop init: .devloop already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.runs_dir)
        .with_context(|| format!("create directory {}", paths.runs_dir.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;
    fs::write(&paths.gitignore_path, DEVLOOP_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    if !paths.design_path.exists() {
        fs::write(&paths.design_path, DESIGN_PLACEHOLDER)
            .with_context(|| format!("write file {}", paths.design_path.display()))?;
    }
    Ok(paths)
}

const DEVLOOP_GITIGNORE: &str = "runs/\n";
const DESIGN_PLACEHOLDER: &str = "---\nid: project\n---\n# Project\n\nDescribe what to build: behavior, interfaces, constraints.\n";
