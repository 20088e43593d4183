//! Deterministic selection logic for the roadmap.

use crate::roadmap::{ItemStatus, Roadmap, RoadmapItem};

/// True if the Architect may pick this work item now.
///
/// Pending items qualify once their prerequisites are done; failed or blocked
/// items qualify again while they still have retry budget.
pub fn is_actionable(roadmap: &Roadmap, item: &RoadmapItem) -> bool {
    let status_ok = match item.status {
        ItemStatus::Pending => true,
        ItemStatus::Failed | ItemStatus::Blocked => item.has_budget(),
        ItemStatus::InProgress | ItemStatus::Done => false,
    };
    status_ok && roadmap.prerequisites_done(&item.id)
}

/// Find the first actionable work item in roadmap order.
///
/// Returns `None` if nothing can be worked on right now.
pub fn next_actionable(roadmap: &Roadmap) -> Option<&RoadmapItem> {
    roadmap
        .work_items()
        .into_iter()
        .find(|item| is_actionable(roadmap, item))
}

/// Returns true if an item is stuck (failed or blocked with attempts exhausted).
pub fn is_stuck(item: &RoadmapItem) -> bool {
    matches!(item.status, ItemStatus::Failed | ItemStatus::Blocked) && !item.has_budget()
}
