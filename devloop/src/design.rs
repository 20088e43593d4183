//! Design document: the functional and technical description a run builds from.
//!
//! Workers never copy the document into their outputs; they record a
//! [`DesignRef`] (id, version, content digest) instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignDocument {
    pub id: String,
    pub title: String,
    /// Starts at 1; bumped only by an audited revision.
    pub version: u32,
    pub body: String,
}

/// Reference to a specific revision of the design document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignRef {
    pub id: String,
    pub version: u32,
    pub digest: String,
}

impl DesignDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            version: 1,
            body: body.into(),
        }
    }

    /// Hex-encoded SHA-256 of the body.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn reference(&self) -> DesignRef {
        DesignRef {
            id: self.id.clone(),
            version: self.version,
            digest: self.digest(),
        }
    }

    /// Produce the next revision with a new body.
    pub fn revise(&self, body: String) -> DesignDocument {
        DesignDocument {
            id: self.id.clone(),
            title: self.title.clone(),
            version: self.version + 1,
            body,
        }
    }
}

/// Normalize line endings and trailing whitespace; ensure a single trailing newline.
pub fn normalize_body(body: &str) -> String {
    let unified = body.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// First `# ` heading of a markdown body, if any.
pub fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Lowercase `[a-z0-9-]` slug suitable for run ids.
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tracks_body_changes() {
        let doc = DesignDocument::new("doc", "Doc", "# Doc\n");
        let revised = doc.revise("# Doc\n\nMore\n".to_string());
        assert_eq!(revised.version, 2);
        assert_ne!(doc.digest(), revised.digest());
        assert_eq!(doc.digest().len(), 64);
    }

    #[test]
    fn normalize_body_strips_trailing_space_and_crlf() {
        let body = "\r\n# Title  \r\nline\t\r\n\r\n\r\n";
        assert_eq!(normalize_body(body), "# Title\nline\n");
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Todo App: v2!"), "todo-app-v2");
        assert_eq!(first_heading("intro\n#  Todo App \n"), Some("Todo App".to_string()));
    }
}
