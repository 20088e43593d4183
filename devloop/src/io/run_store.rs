//! Per-run persistence: checkpoints, the audit log, node outputs and the
//! terminal outcome archive under `.devloop/runs/<run-id>/`.
//!
//! The checkpoint is the source of truth. The audit file and output records
//! are derived views re-synchronized from it after every save, so a crash
//! between the two is repaired by the next save.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::checkpoint::{CheckpointId, CheckpointRef, Checkpointer, FileCheckpointer};
use super::init::RunPaths;
use crate::core::types::RunStatus;
use crate::state::{AuditEvent, RunState};

/// Summary written to `outcome.json` when a run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub iteration: u32,
    pub reason: Option<String>,
    /// Work items per status.
    pub items: BTreeMap<String, usize>,
    pub checkpoint: CheckpointId,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    paths: RunPaths,
    checkpoints: FileCheckpointer,
}

impl RunStore {
    pub fn new(paths: RunPaths) -> Self {
        let checkpoints = FileCheckpointer::new(paths.checkpoints_dir.clone());
        Self { paths, checkpoints }
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn checkpoints(&self) -> &FileCheckpointer {
        &self.checkpoints
    }

    pub fn exists(&self) -> bool {
        self.paths.checkpoints_dir.is_dir()
    }

    /// Save a checkpoint, then bring the derived files in line with it.
    #[instrument(skip_all, fields(run_id = %state.run_id, position = %state.position))]
    pub fn persist(&self, state: &RunState) -> Result<CheckpointId> {
        let id = self.checkpoints.save(state)?;
        let appended = sync_audit(&self.paths.audit_path, &state.audit)?;
        self.write_outputs(state)?;
        if state.status.is_terminal() {
            self.write_outcome(state, id)?;
        }
        debug!(checkpoint = id.0, appended, "run persisted");
        Ok(id)
    }

    pub fn load(&self, at: CheckpointRef) -> Result<RunState> {
        self.checkpoints.load(at)
    }

    pub fn read_audit(&self) -> Result<Vec<AuditEvent>> {
        read_audit(&self.paths.audit_path)
    }

    pub fn read_outcome(&self) -> Result<Option<RunOutcome>> {
        let path = &self.paths.outcome_path;
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let outcome = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(outcome))
    }

    fn write_outputs(&self, state: &RunState) -> Result<()> {
        for record in state.outputs.values() {
            let path = self.paths.output_path(record.node, record.iteration);
            let mut buf = serde_json::to_string_pretty(record).context("serialize node output")?;
            buf.push('\n');
            if fs::read_to_string(&path).is_ok_and(|existing| existing == buf) {
                continue;
            }
            write_atomic(&path, &buf)?;
        }
        Ok(())
    }

    fn write_outcome(&self, state: &RunState, checkpoint: CheckpointId) -> Result<()> {
        let outcome = RunOutcome {
            run_id: state.run_id.clone(),
            status: state.status,
            iteration: state.iteration,
            reason: state.terminal_reason.clone(),
            items: state
                .roadmap
                .status_counts()
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
            checkpoint,
        };
        let mut buf = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
        buf.push('\n');
        write_atomic(&self.paths.outcome_path, &buf)?;
        info!(status = state.status.as_str(), "run archived");
        Ok(())
    }
}

/// Append the events the audit file does not hold yet. Returns how many were appended.
pub fn sync_audit(path: &Path, events: &[AuditEvent]) -> Result<usize> {
    repair_torn_tail(path)?;
    let last_seq = read_audit(path)?.last().map(|e| e.seq).unwrap_or(0);
    let pending: Vec<&AuditEvent> = events.iter().filter(|e| e.seq > last_seq).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = String::new();
    for event in &pending {
        buf.push_str(&serde_json::to_string(event).context("serialize audit event")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append audit log {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync audit log {}", path.display()))?;
    Ok(pending.len())
}

/// Drop a partially written final line left by a crash mid-append.
fn repair_torn_tail(path: &Path) -> Result<()> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Ok(());
    };
    if contents.is_empty() || contents.ends_with('\n') {
        return Ok(());
    }
    let keep = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
    fs::write(path, &contents[..keep])
        .with_context(|| format!("repair audit log {}", path.display()))
}

/// Read every complete event from a JSONL audit file. A torn final line is skipped.
pub fn read_audit(path: &Path) -> Result<Vec<AuditEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut events = Vec::new();
    let mut lines = contents.lines().filter(|l| !l.trim().is_empty()).peekable();
    while let Some(line) = lines.next() {
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            Err(_) if lines.peek().is_none() && !contents.ends_with('\n') => break,
            Err(err) => {
                return Err(err).with_context(|| format!("parse audit line in {}", path.display()));
            }
        }
    }
    Ok(events)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Position;
    use crate::state::AuditKind;
    use crate::test_support::{design_doc, fixed_time};

    fn store(root: &Path) -> RunStore {
        RunStore::new(RunPaths::new(root.join("run-1")))
    }

    #[test]
    fn audit_file_follows_checkpoints_without_duplicates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut state = RunState::new("run-1", design_doc());
        state.record(
            fixed_time(),
            AuditKind::RunStarted {
                design_id: "todo".to_string(),
                design_version: 1,
            },
        );
        store.persist(&state).expect("persist");
        state.record(
            fixed_time(),
            AuditKind::Transition {
                from: Position::Documentation,
                to: Position::Planner,
                reason: "continue".to_string(),
            },
        );
        store.persist(&state).expect("persist");
        store.persist(&state).expect("persist again");

        let events = store.read_audit().expect("audit");
        assert_eq!(events, state.audit);
    }

    #[test]
    fn torn_last_line_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit.jsonl");
        let mut state = RunState::new("run-1", design_doc());
        state.record(
            fixed_time(),
            AuditKind::RunAborted {
                reason: "x".to_string(),
            },
        );
        sync_audit(&path, &state.audit).expect("sync");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"seq\": 2, \"at\"").expect("write");
        assert_eq!(read_audit(&path).expect("read").len(), 1);

        state.record(
            fixed_time(),
            AuditKind::RunAborted {
                reason: "y".to_string(),
            },
        );
        assert_eq!(sync_audit(&path, &state.audit).expect("sync"), 1);
        assert_eq!(read_audit(&path).expect("read"), state.audit);
    }

    #[test]
    fn terminal_runs_are_archived() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut state = RunState::new("run-1", design_doc());
        assert!(store.read_outcome().expect("outcome").is_none());

        state.status = RunStatus::Failed;
        state.position = Position::Failed;
        state.terminal_reason = Some("aborted".to_string());
        let id = store.persist(&state).expect("persist");

        let outcome = store.read_outcome().expect("outcome").expect("archived");
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("aborted"));
        assert_eq!(outcome.checkpoint, id);
    }
}
