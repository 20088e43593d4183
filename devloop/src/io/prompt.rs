//! Prompt rendering for the model-backed nodes.
//!
//! Templates are minijinja markdown with XML-tagged sections. Each section
//! is preceded by a `<!-- section:KEY required|droppable -->` marker so that
//! oversized prompts can shed low-value context first.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::path::item_path;
use crate::design::DesignDocument;
use crate::io::llm::OutputSchema;
use crate::roadmap::{Roadmap, RoadmapItem};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const ARCHITECT_TEMPLATE: &str = include_str!("prompts/architect.md");
const CODER_TEMPLATE: &str = include_str!("prompts/coder.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

/// Drop order when a prompt is over budget.
const DROP_ORDER: [&str; 4] = ["roadmap", "design", "hint", "failure"];

#[derive(Debug, Clone, Serialize)]
struct DesignContext<'a> {
    id: &'a str,
    version: u32,
    title: &'a str,
    body: &'a str,
}

impl<'a> DesignContext<'a> {
    fn new(design: &'a DesignDocument) -> Self {
        Self {
            id: &design.id,
            version: design.version,
            title: &design.title,
            body: design.body.trim(),
        }
    }
}

/// Work item as shown to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ItemContext {
    pub path: String,
    pub id: String,
    pub title: String,
    pub description: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl ItemContext {
    pub fn new(roadmap: &Roadmap, item: &RoadmapItem) -> Self {
        Self {
            path: item_path(roadmap, &item.id).unwrap_or_else(|| item.id.clone()),
            id: item.id.clone(),
            title: item.title.clone(),
            description: item.description.trim().to_string(),
            attempts: item.attempts,
            max_attempts: item.max_attempts,
        }
    }
}

/// Renders node prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .expect("planner template should be valid");
        env.add_template("architect", ARCHITECT_TEMPLATE)
            .expect("architect template should be valid");
        env.add_template("coder", CODER_TEMPLATE)
            .expect("coder template should be valid");
        Self { env, budget_bytes }
    }

    /// Planner prompt; non-empty `problems` switches to the strict variant.
    pub fn planner(&self, design: &DesignDocument, problems: &[String]) -> Result<String> {
        let rendered = self.env.get_template("planner")?.render(context! {
            schema => OutputSchema::Roadmap.source().trim(),
            strict => !problems.is_empty(),
            problems => problems,
            design => DesignContext::new(design),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn architect(
        &self,
        design: &DesignDocument,
        item: &ItemContext,
        roadmap: &str,
        hint: Option<&str>,
    ) -> Result<String> {
        let rendered = self.env.get_template("architect")?.render(context! {
            schema => OutputSchema::Approach.source().trim(),
            item => item,
            hint => hint.map(str::trim).filter(|s| !s.is_empty()),
            roadmap => roadmap.trim(),
            design => DesignContext::new(design),
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn coder(
        &self,
        design: &DesignDocument,
        item: &ItemContext,
        approach: Option<&str>,
        failure: Option<&str>,
        retry: u32,
    ) -> Result<String> {
        let rendered = self.env.get_template("coder")?.render(context! {
            schema => OutputSchema::CoderPlan.source().trim(),
            item => item,
            approach => approach.map(str::trim).filter(|s| !s.is_empty()),
            failure => failure.map(str::trim).filter(|s| !s.is_empty()),
            retry => retry,
            design => DesignContext::new(design),
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// One line per roadmap item, indented by depth: `- [status] id: title`.
pub fn roadmap_summary(roadmap: &Roadmap) -> String {
    let mut lines = Vec::new();
    for id in roadmap.ordered_ids() {
        let Some(item) = roadmap.get(&id) else {
            continue;
        };
        let depth = item_path(roadmap, &id).map_or(0, |p| p.matches('/').count());
        lines.push(format!(
            "{}- [{}] {}: {}",
            "  ".repeat(depth),
            item.status.as_str(),
            item.id,
            item.title
        ));
    }
    lines.join("\n")
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| secs.iter().map(|s| s.content.len()).sum::<usize>();
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, bytes = sections[idx].content.len(), "dropped prompt section");
            sections.remove(idx);
        }
    }
}
