//! Orchestration for starting a new run.
//!
//! A run is one execution of the workflow over a design document, identified
//! by `<design-id>-<n>`. Starting a run writes its first checkpoint at the
//! Documentation node; nothing else happens until the first `advance`.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::design::DesignDocument;
use crate::io::checkpoint::CheckpointId;
use crate::io::design_doc::validate_id;
use crate::io::init::EnginePaths;
use crate::io::run_store::RunStore;
use crate::state::{AuditKind, RunState};

/// Upper bound on `<design-id>-<n>` suffixes tried before giving up.
const MAX_RUN_SUFFIX: u32 = 9_999;

/// Outcome of `devloop start`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub state: RunState,
    pub store: RunStore,
    pub checkpoint: CheckpointId,
}

/// Create a run for `design` under `paths.runs_dir` and persist its initial state.
pub fn start_run(paths: &EnginePaths, design: DesignDocument, now: DateTime<Utc>) -> Result<StartOutcome> {
    validate_id(&design.id)?;
    if !paths.runs_dir.is_dir() {
        return Err(anyhow!(
            "missing {} (run `devloop init` first)",
            paths.runs_dir.display()
        ));
    }
    let run_id = next_run_id(paths, &design.id)?;
    let store = RunStore::new(paths.run(&run_id));

    let mut state = RunState::new(&run_id, design);
    state.record(
        now,
        AuditKind::RunStarted {
            design_id: state.design.id.clone(),
            design_version: state.design.version,
        },
    );
    let checkpoint = store
        .persist(&state)
        .with_context(|| format!("persist initial checkpoint for {run_id}"))?;

    info!(run_id = %run_id, design = %state.design.id, "run started");
    Ok(StartOutcome {
        state,
        store,
        checkpoint,
    })
}

/// Smallest `<design-id>-<n>` (n >= 1) with no run directory yet.
fn next_run_id(paths: &EnginePaths, design_id: &str) -> Result<String> {
    for n in 1..=MAX_RUN_SUFFIX {
        let id = format!("{design_id}-{n}");
        if !paths.run(&id).dir.exists() {
            debug!(run_id = %id, "allocated run id");
            return Ok(id);
        }
    }
    Err(anyhow!("no free run id for design '{design_id}'"))
}
