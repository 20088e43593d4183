//! Sequence-numbered, immutable run snapshots.
//!
//! Each checkpoint is a complete [`RunState`] serialized to
//! `<seq:08>.json`. Writes go to a temp file that is flushed and synced
//! before the rename, so a crash never leaves a partial checkpoint under a
//! final name, and existing checkpoints are never overwritten.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::state::RunState;

/// Monotonic checkpoint sequence number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointRef {
    Latest,
    Id(CheckpointId),
}

/// Storage backend for run checkpoints.
pub trait Checkpointer {
    fn save(&self, state: &RunState) -> Result<CheckpointId>;
    fn load(&self, at: CheckpointRef) -> Result<RunState>;
    /// Existing checkpoint ids in ascending order.
    fn list(&self) -> Result<Vec<CheckpointId>>;
}

/// Checkpoints stored as JSON files in one directory per run.
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    dir: PathBuf,
}

impl FileCheckpointer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: CheckpointId) -> PathBuf {
        self.dir.join(format!("{:08}.json", id.0))
    }
}

impl Checkpointer for FileCheckpointer {
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    fn save(&self, state: &RunState) -> Result<CheckpointId> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create checkpoint dir {}", self.dir.display()))?;
        let next = CheckpointId(self.list()?.last().map(|id| id.0 + 1).unwrap_or(1));
        let path = self.path_for(next);
        if path.exists() {
            return Err(anyhow!("checkpoint {} already exists", path.display()));
        }

        let mut buf = serde_json::to_string_pretty(state).context("serialize checkpoint")?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("open temp checkpoint {}", tmp_path.display()))?;
            file.write_all(buf.as_bytes())
                .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("sync temp checkpoint {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("publish checkpoint {}", path.display()))?;
        debug!(checkpoint = next.0, "checkpoint saved");
        Ok(next)
    }

    fn load(&self, at: CheckpointRef) -> Result<RunState> {
        let id = match at {
            CheckpointRef::Id(id) => id,
            CheckpointRef::Latest => *self
                .list()?
                .last()
                .ok_or_else(|| anyhow!("no checkpoints in {}", self.dir.display()))?,
        };
        let path = self.path_for(id);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse checkpoint {}", path.display()))
    }

    fn list(&self) -> Result<Vec<CheckpointId>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read checkpoint dir {}", self.dir.display()))?
        {
            let entry = entry.context("read checkpoint dir entry")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".json")
                && let Ok(seq) = stem.parse::<u64>()
            {
                ids.push(CheckpointId(seq));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Position;
    use crate::test_support::design_doc;

    #[test]
    fn save_assigns_increasing_ids_and_load_latest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointer::new(temp.path().join("checkpoints"));
        let mut state = RunState::new("run-1", design_doc());

        assert_eq!(store.save(&state).expect("save"), CheckpointId(1));
        state.position = Position::Planner;
        assert_eq!(store.save(&state).expect("save"), CheckpointId(2));

        assert_eq!(store.load(CheckpointRef::Latest).expect("load"), state);
        let first = store.load(CheckpointRef::Id(CheckpointId(1))).expect("load");
        assert_eq!(first.position, Position::Documentation);
        assert_eq!(store.list().expect("list"), vec![CheckpointId(1), CheckpointId(2)]);
    }

    #[test]
    fn load_ignores_partial_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("checkpoints");
        let store = FileCheckpointer::new(&dir);
        let state = RunState::new("run-1", design_doc());
        store.save(&state).expect("save");
        fs::write(dir.join("00000002.json.tmp"), "{\"run_id\": ").expect("write partial");

        assert_eq!(store.list().expect("list"), vec![CheckpointId(1)]);
        assert_eq!(store.load(CheckpointRef::Latest).expect("load"), state);
        assert_eq!(store.save(&state).expect("save"), CheckpointId(2));
    }

    #[test]
    fn load_latest_without_checkpoints_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointer::new(temp.path());
        let err = store.load(CheckpointRef::Latest).unwrap_err();
        assert!(err.to_string().contains("no checkpoints"));
    }
}
