//! Helpers for rendering deterministic roadmap item paths.

use crate::roadmap::Roadmap;

/// Return the `/`-separated id path from the phase down to `target_id`.
pub fn item_path(roadmap: &Roadmap, target_id: &str) -> Option<String> {
    let mut path = Vec::new();
    let mut cursor = roadmap.get(target_id);
    while let Some(item) = cursor {
        if path.contains(&item.id) {
            return None;
        }
        path.push(item.id.clone());
        cursor = match item.parent_id.as_deref() {
            Some(parent) => Some(roadmap.get(parent)?),
            None => None,
        };
    }
    if path.is_empty() {
        return None;
    }
    path.reverse();
    Some(path.join("/"))
}
