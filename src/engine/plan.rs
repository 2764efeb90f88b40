//! Pulls components, files, and steps out of planner markdown.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;

use crate::session::Plan;

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:#{1,6}\s*(.+?)\s*#*\s*$|\*\*(.+?)\*\*:?\s*$|([A-Za-z][A-Za-z /&-]{2,40}):\s*$)")
        .unwrap()
});

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+)$").unwrap());

static PASCAL_CASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][a-z0-9]+(?:[A-Z][a-z0-9]*)*)\b").unwrap()
});

static SOURCE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s`'(])((?:\.{0,2}/)?(?:[\w@\[\]().-]+/)*[\w\[\].-]+\.(?:tsx|ts|jsx|js|mjs|cjs|css|scss|json|html|md))\b")
        .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Components,
    Files,
    Steps,
    Other,
}

fn classify_heading(title: &str) -> Section {
    let title = title.to_lowercase();
    if title.contains("component") {
        Section::Components
    } else if title.contains("file") {
        Section::Files
    } else if title.contains("step") || title.contains("implementation") || title.contains("tasks") {
        Section::Steps
    } else {
        Section::Other
    }
}

/// Structured parts of a plan before it is persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanDraft {
    pub components: Vec<String>,
    pub files: Vec<String>,
    pub steps: Vec<String>,
}

impl PlanDraft {
    /// Extract the plan structure. Files fall back to every path-like token in
    /// the text; steps fall back to the request itself as a single step.
    pub fn from_text(request: &str, text: &str) -> Self {
        let mut draft = Self::default();
        let mut section = Section::Other;

        for line in text.lines() {
            if let Some(caps) = HEADING.captures(line) {
                let title = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                section = classify_heading(title);
                continue;
            }
            let Some(item) = LIST_ITEM.captures(line).and_then(|c| c.get(1)) else {
                continue;
            };
            let item = item.as_str().trim();
            match section {
                Section::Components => {
                    let cleaned = item.replace(['`', '*'], "");
                    if let Some(name) = PASCAL_CASE.captures(&cleaned).and_then(|c| c.get(1)) {
                        push_unique(&mut draft.components, name.as_str());
                    }
                }
                Section::Files => {
                    for path in extract_paths(item) {
                        push_unique(&mut draft.files, &path);
                    }
                }
                Section::Steps => {
                    let step = item.replace("**", "");
                    if !step.trim().is_empty() {
                        draft.steps.push(step.trim().to_string());
                    }
                }
                Section::Other => {}
            }
        }

        if draft.files.is_empty() {
            for path in extract_paths(text) {
                push_unique(&mut draft.files, &path);
            }
        }
        if draft.steps.is_empty() {
            draft.steps.push(request.trim().to_string());
        }
        draft
    }

    pub fn into_plan(self, request: &str, text: &str) -> Plan {
        Plan {
            request: request.to_string(),
            text: text.to_string(),
            components: self.components,
            files: self.files,
            steps: self.steps,
            approved: false,
            created_at: Utc::now(),
        }
    }
}

fn extract_paths(text: &str) -> Vec<String> {
    SOURCE_PATH
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_start_matches("./").to_string())
        .filter(|p| !p.starts_with("node_modules/"))
        .collect()
}

fn push_unique(items: &mut Vec<String>, item: &str) {
    if !items.iter().any(|i| i == item) {
        items.push(item.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "\
Here is the plan for your todo app.

## Components
- `TodoList` - renders all todos
- **TodoItem**: a single row
- AddTodoForm

## Files
- `app/page.tsx`
- components/TodoList.tsx
- ./components/TodoItem.tsx

## Steps
1. Create the **TodoItem** component
2. Create TodoList using TodoItem
3. Wire the page with local state
";

    #[test]
    fn test_extracts_all_sections() {
        let draft = PlanDraft::from_text("Create a todo app", PLAN);
        assert_eq!(draft.components, vec!["TodoList", "TodoItem", "AddTodoForm"]);
        assert_eq!(
            draft.files,
            vec!["app/page.tsx", "components/TodoList.tsx", "components/TodoItem.tsx"]
        );
        assert_eq!(draft.steps.len(), 3);
        assert_eq!(draft.steps[0], "Create the TodoItem component");
    }

    #[test]
    fn test_unstructured_text_becomes_single_step() {
        let draft = PlanDraft::from_text("Create a todo app", "Sounds good, I will build it in app/page.tsx.");
        assert_eq!(draft.steps, vec!["Create a todo app"]);
        assert_eq!(draft.files, vec!["app/page.tsx"]);
        assert!(draft.components.is_empty());
    }

    #[test]
    fn test_bold_and_colon_headings() {
        let text = "**Implementation Steps**\n- Scaffold layout\n- Add styles\nFiles:\n- src/App.tsx\n";
        let draft = PlanDraft::from_text("x", text);
        assert_eq!(draft.steps, vec!["Scaffold layout", "Add styles"]);
        assert_eq!(draft.files, vec!["src/App.tsx"]);
    }

    #[test]
    fn test_into_plan_is_pending() {
        let plan = PlanDraft::from_text("Create a todo app", PLAN).into_plan("Create a todo app", PLAN);
        assert!(plan.is_pending());
        assert_eq!(plan.request, "Create a todo app");
        assert_eq!(plan.steps.len(), 3);
    }
}
