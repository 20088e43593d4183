//! Roadmap data model: a phase → task → subtask breakdown keyed by id.
//!
//! Items are stored flat (keyed by id) with a `parent_id` link and an `order`
//! used to derive a stable traversal. Work happens on *work items*: subtasks,
//! and tasks that have no subtasks. Phases and tasks with subtasks derive
//! their status from their children.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::types::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Phase,
    Task,
    Subtask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Blocked,
    Done,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoadmapItem {
    pub id: String,
    pub kind: ItemKind,
    pub order: i64,
    pub title: String,
    pub description: String,
    pub status: ItemStatus,
    pub owner_role: NodeKind,
    pub parent_id: Option<String>,
    /// Prerequisite item ids declared by the planner.
    pub depends_on: Vec<String>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl RoadmapItem {
    /// True while the item still has retry budget left.
    pub fn has_budget(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roadmap {
    pub items: BTreeMap<String, RoadmapItem>,
}

impl Roadmap {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&RoadmapItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RoadmapItem> {
        self.items.get_mut(id)
    }

    /// Direct children of `parent` (or the phases when `None`), sorted by `(order, id)`.
    pub fn children(&self, parent: Option<&str>) -> Vec<&RoadmapItem> {
        let mut children: Vec<&RoadmapItem> = self
            .items
            .values()
            .filter(|item| item.parent_id.as_deref() == parent)
            .collect();
        children.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// All item ids in depth-first roadmap order (phase, its tasks, their subtasks, ...).
    pub fn ordered_ids(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut visited = HashSet::new();
        self.walk(None, &mut out, &mut visited);
        out
    }

    fn walk(&self, parent: Option<&str>, out: &mut Vec<String>, visited: &mut HashSet<String>) {
        for child in self.children(parent) {
            if !visited.insert(child.id.clone()) {
                continue;
            }
            out.push(child.id.clone());
            self.walk(Some(&child.id), out, visited);
        }
    }

    pub fn has_children(&self, id: &str) -> bool {
        self.items
            .values()
            .any(|item| item.parent_id.as_deref() == Some(id))
    }

    /// Subtasks, and tasks without subtasks, in roadmap order.
    pub fn work_items(&self) -> Vec<&RoadmapItem> {
        self.ordered_ids()
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(|item| item.kind != ItemKind::Phase && !self.has_children(&item.id))
            .collect()
    }

    /// Declared prerequisites plus those inherited from ancestors.
    pub fn effective_prerequisites(&self, id: &str) -> Vec<String> {
        let mut prereqs = Vec::new();
        let mut cursor = self.items.get(id);
        let mut seen = HashSet::new();
        while let Some(item) = cursor {
            if !seen.insert(item.id.clone()) {
                break;
            }
            for dep in &item.depends_on {
                if !prereqs.contains(dep) {
                    prereqs.push(dep.clone());
                }
            }
            cursor = item.parent_id.as_deref().and_then(|p| self.items.get(p));
        }
        prereqs
    }

    pub fn prerequisites_done(&self, id: &str) -> bool {
        self.effective_prerequisites(id).iter().all(|dep| {
            self.items
                .get(dep)
                .is_some_and(|item| item.status == ItemStatus::Done)
        })
    }

    /// True when the roadmap has work items and all of them are done.
    pub fn all_work_done(&self) -> bool {
        let work = self.work_items();
        !work.is_empty() && work.iter().all(|item| item.status == ItemStatus::Done)
    }

    /// Recompute statuses of phases and tasks that have children.
    ///
    /// Returns the ids whose status changed, sorted.
    pub fn derive_parent_statuses(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        // Reverse DFS order visits children before their parents.
        for id in self.ordered_ids().into_iter().rev() {
            if !self.has_children(&id) {
                continue;
            }
            let derived = derive_status(
                self.children(Some(&id))
                    .iter()
                    .map(|child| child.status)
                    .collect::<Vec<_>>()
                    .as_slice(),
            );
            if let Some(item) = self.items.get_mut(&id)
                && item.status != derived
            {
                item.status = derived;
                changed.push(id);
            }
        }
        changed.sort();
        changed
    }

    /// Count of work items per status, in a stable order.
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for item in self.work_items() {
            *counts.entry(item.status.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

fn derive_status(children: &[ItemStatus]) -> ItemStatus {
    if children.iter().all(|s| *s == ItemStatus::Done) {
        ItemStatus::Done
    } else if children.contains(&ItemStatus::Failed) {
        ItemStatus::Failed
    } else if children.contains(&ItemStatus::Blocked) {
        ItemStatus::Blocked
    } else if children
        .iter()
        .any(|s| matches!(s, ItemStatus::InProgress | ItemStatus::Done))
    {
        ItemStatus::InProgress
    } else {
        ItemStatus::Pending
    }
}

/// Planner output: the nested shape the model is asked to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRoadmap {
    pub phases: Vec<PlannedPhase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner_role: Option<NodeKind>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<PlannedTask>,
}

impl Roadmap {
    /// Flatten planner output into a keyed roadmap with every item `pending`.
    ///
    /// Duplicate ids are reported here, since keying would silently drop them.
    /// Structural checks (parents, dependencies, cycles) are left to
    /// [`crate::core::invariants::validate_roadmap`].
    pub fn from_plan(plan: &PlannedRoadmap, max_attempts: u32) -> Result<Roadmap, Vec<String>> {
        let mut roadmap = Roadmap::default();
        let mut errors = Vec::new();

        let mut insert = |item: RoadmapItem, errors: &mut Vec<String>| {
            if roadmap.items.contains_key(&item.id) {
                errors.push(format!("duplicate id '{}'", item.id));
                return;
            }
            roadmap.items.insert(item.id.clone(), item);
        };

        for (phase_order, phase) in plan.phases.iter().enumerate() {
            insert(
                RoadmapItem {
                    id: phase.id.clone(),
                    kind: ItemKind::Phase,
                    order: phase_order as i64,
                    title: phase.title.clone(),
                    description: phase.description.clone(),
                    status: ItemStatus::Pending,
                    owner_role: NodeKind::Architect,
                    parent_id: None,
                    depends_on: Vec::new(),
                    attempts: 0,
                    max_attempts,
                },
                &mut errors,
            );
            for (task_order, task) in phase.tasks.iter().enumerate() {
                insert(
                    planned_item(task, ItemKind::Task, task_order, &phase.id, max_attempts),
                    &mut errors,
                );
                for (sub_order, sub) in task.subtasks.iter().enumerate() {
                    if !sub.subtasks.is_empty() {
                        errors.push(format!(
                            "subtask '{}' must not declare nested subtasks",
                            sub.id
                        ));
                    }
                    insert(
                        planned_item(sub, ItemKind::Subtask, sub_order, &task.id, max_attempts),
                        &mut errors,
                    );
                }
            }
        }

        if errors.is_empty() {
            Ok(roadmap)
        } else {
            Err(errors)
        }
    }
}

fn planned_item(
    task: &PlannedTask,
    kind: ItemKind,
    order: usize,
    parent: &str,
    max_attempts: u32,
) -> RoadmapItem {
    RoadmapItem {
        id: task.id.clone(),
        kind,
        order: order as i64,
        title: task.title.clone(),
        description: task.description.clone(),
        status: ItemStatus::Pending,
        owner_role: task.owner_role.unwrap_or(NodeKind::Coder),
        parent_id: Some(parent.to_string()),
        depends_on: task.depends_on.clone(),
        attempts: 0,
        max_attempts,
    }
}
