//! Loading the design document from a markdown file.
//!
//! The document is human-facing markdown with optional YAML-style
//! frontmatter carrying a stable `id` (and optionally `title`) that ties
//! runs to the document.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::design::{DesignDocument, first_heading, slugify};

/// Read a design document from `path`.
///
/// The id comes from frontmatter, else a slug of the title. The title comes
/// from frontmatter, else the first `# ` heading, else the file stem.
pub fn load_design(path: &Path) -> Result<DesignDocument> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let (frontmatter, body) = match split_frontmatter(&contents) {
        Some((frontmatter, rest)) => (Some(frontmatter), rest),
        None => (None, contents.as_str()),
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("design")
        .to_string();
    let title = frontmatter
        .and_then(|fm| frontmatter_value(fm, "title"))
        .or_else(|| first_heading(body))
        .unwrap_or(stem);
    let id = match frontmatter.and_then(|fm| frontmatter_value(fm, "id")) {
        Some(id) => id,
        None => slugify(&title),
    };
    validate_id(&id).with_context(|| format!("design id in {}", path.display()))?;

    Ok(DesignDocument::new(id, title, body.trim_start_matches('\n')))
}

/// Check that `id` can name a run directory: `[A-Za-z0-9._-]`, not
/// starting with a dot.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("design id is empty"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("design id '{id}' starts with '.'"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
    {
        return Err(anyhow!("design id '{id}' contains {bad:?} (allowed: A-Z a-z 0-9 . _ -)"));
    }
    Ok(())
}

fn frontmatter_value(frontmatter: &str, wanted: &str) -> Option<String> {
    for line in frontmatter.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        if key.trim() != wanted {
            continue;
        }
        let v = value.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);
        return (!v.is_empty()).then(|| v.to_string());
    }
    None
}

/// Split a document into (frontmatter, rest). Returns None without frontmatter.
fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents.strip_prefix("---\n")?;
    let end = after.find("\n---\n")?;
    Some((&after[..end], &after[end + 5..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_id_and_title_from_frontmatter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("DESIGN.md");
        fs::write(&path, "---\nid: \"todo\"\ntitle: Todo API\n---\n\n# Heading\n\nBody\n")
            .expect("write");
        let doc = load_design(&path).expect("load");
        assert_eq!(doc.id, "todo");
        assert_eq!(doc.title, "Todo API");
        assert_eq!(doc.version, 1);
        assert_eq!(doc.body, "# Heading\n\nBody\n");
    }

    #[test]
    fn falls_back_to_heading_slug() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("todo.md");
        fs::write(&path, "# Todo App\n\nBody\n").expect("write");
        let doc = load_design(&path).expect("load");
        assert_eq!(doc.id, "todo-app");
        assert_eq!(doc.title, "Todo App");
    }

    #[test]
    fn ids_must_be_safe_directory_names() {
        assert!(validate_id("todo-v2.1_beta").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        let err = validate_id("bad/id").unwrap_err();
        assert!(err.to_string().contains("'/'"));
    }
}
