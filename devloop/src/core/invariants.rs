//! Roadmap invariants not expressible via JSON Schema.

use std::collections::HashMap;

use crate::roadmap::{ItemKind, ItemStatus, Roadmap};

/// Check structural and status invariants of a roadmap:
/// - Phases have no parent; tasks sit under phases; subtasks under tasks
/// - Every phase holds at least one task
/// - Dependency targets exist, are tasks/subtasks, and form no cycle
/// - `max_attempts > 0` and `attempts <= max_attempts`
/// - A `done` item has every effective prerequisite `done`
///
/// Returns stable, sorted error messages (empty on success).
pub fn validate_roadmap(roadmap: &Roadmap) -> Vec<String> {
    let mut errors = Vec::new();

    for (id, item) in &roadmap.items {
        if *id != item.id {
            errors.push(format!("{id}: keyed under a different id '{}'", item.id));
        }
        if item.id.trim().is_empty() {
            errors.push("item id must not be empty".to_string());
        }

        let parent_kind = item
            .parent_id
            .as_deref()
            .map(|p| roadmap.get(p).map(|parent| parent.kind));
        match (item.kind, parent_kind) {
            (ItemKind::Phase, None) => {}
            (ItemKind::Phase, Some(_)) => errors.push(format!("{id}: phase must not have a parent")),
            (ItemKind::Task, Some(Some(ItemKind::Phase))) => {}
            (ItemKind::Subtask, Some(Some(ItemKind::Task))) => {}
            (_, None) => errors.push(format!("{id}: missing parent_id")),
            (_, Some(None)) => errors.push(format!(
                "{id}: unknown parent '{}'",
                item.parent_id.as_deref().unwrap_or_default()
            )),
            (kind, Some(Some(parent))) => errors.push(format!(
                "{id}: {kind:?} cannot be a child of {parent:?}"
            )),
        }

        if item.kind == ItemKind::Phase && !roadmap.has_children(id) {
            errors.push(format!("{id}: phase has no tasks"));
        }

        for dep in &item.depends_on {
            match roadmap.get(dep) {
                None => errors.push(format!("{id}: unknown dependency '{dep}'")),
                Some(target) if target.kind == ItemKind::Phase => {
                    errors.push(format!("{id}: dependency '{dep}' is a phase"))
                }
                Some(_) if dep == id => errors.push(format!("{id}: depends on itself")),
                Some(_) => {}
            }
        }

        if item.max_attempts == 0 {
            errors.push(format!("{id}: max_attempts must be > 0"));
        }
        if item.attempts > item.max_attempts {
            errors.push(format!(
                "{id}: attempts {} exceeds max_attempts {}",
                item.attempts, item.max_attempts
            ));
        }

        if item.status == ItemStatus::Done && !roadmap.prerequisites_done(id) {
            errors.push(format!("{id}: done before its prerequisites"));
        }
    }

    if let Some(cycle) = find_dependency_cycle(roadmap) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors.sort();
    errors
}

/// Return one dependency cycle (as an id path) if the graph has any.
///
/// Edges run from an item to its prerequisites; a subtask also reaches its
/// parent's prerequisites, so cycles through inherited edges are caught too.
pub fn find_dependency_cycle(roadmap: &Roadmap) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        roadmap: &Roadmap,
        id: &str,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| s == id).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(id.to_string(), Mark::Visiting);
        stack.push(id.to_string());
        for dep in roadmap.effective_prerequisites(id) {
            if roadmap.get(&dep).is_none() {
                continue;
            }
            if let Some(cycle) = visit(roadmap, &dep, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(id.to_string(), Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for id in roadmap.items.keys() {
        if let Some(cycle) = visit(roadmap, id, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}
