//! System prompts and request builders for each kind of generation call.

use crate::preview::Framework;

/// Planner: produces the markdown plan parsed by `PlanDraft::from_text`.
pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are planning a web application before any code is written.

Reply with a markdown plan using exactly these headings:

## Components
- One PascalCase component name per bullet

## Files
- One project-relative file path per bullet

## Steps
1. One self-contained implementation step per numbered item

Do not write code. Keep the plan to at most 8 steps."#;

/// Coder: runs one plan step with write access to the workspace.
pub const CODER_SYSTEM_PROMPT: &str = r#"You are implementing one step of an approved plan inside an existing project.

Work directly in the current directory using your file and shell tools.
Only touch files needed for this step. Keep the project buildable.
When you are done, summarize what you changed in one short paragraph."#;

/// Fast mode: one request straight to code, no plan.
pub const FAST_SYSTEM_PROMPT: &str = r#"You are making a change to a web project directly, without a separate planning phase.

Work in the current directory using your file and shell tools.
Make the smallest complete change that satisfies the request and keep the project buildable.
Finish with a short summary of what you changed."#;

/// Repair: one corrective pass over build or runtime errors.
pub const REPAIR_SYSTEM_PROMPT: &str = r#"You are fixing errors in a web project.

You are given the project manifest, the files mentioned in the errors, and the raw error output.
Fix the root cause using your file and shell tools. Install missing packages if an import cannot be resolved.
Do not rewrite unrelated code. Finish with a one-line summary of the fix."#;

pub fn planning_request(prompt: &str, framework: Framework) -> String {
    format!(
        "Framework: {}\n\nPlan the following request:\n\n{}",
        framework_label(framework),
        prompt.trim()
    )
}

pub fn step_instruction(
    index: usize,
    total: usize,
    step: &str,
    plan_summary: &str,
    framework: Framework,
) -> String {
    format!(
        "Framework: {}\n\n{}\n\nImplement step {} of {}:\n{}",
        framework_label(framework),
        plan_summary,
        index + 1,
        total,
        step.trim()
    )
}

pub fn fast_request(message: &str, framework: Framework) -> String {
    format!("Framework: {}\n\n{}", framework_label(framework), message.trim())
}

/// Context files are `(path, content)` pairs.
pub fn repair_request(
    manifest: Option<&str>,
    files: &[(String, String)],
    errors: &str,
    framework: Framework,
) -> String {
    let mut out = format!("Framework: {}\n\n", framework_label(framework));
    if let Some(manifest) = manifest {
        out.push_str("## package.json\n```json\n");
        out.push_str(manifest.trim());
        out.push_str("\n```\n\n");
    }
    for (path, content) in files {
        out.push_str(&format!("## {}\n```\n{}\n```\n\n", path, content.trim_end()));
    }
    out.push_str("## Errors\n```\n");
    out.push_str(errors.trim());
    out.push_str("\n```\n");
    out
}

fn framework_label(framework: Framework) -> &'static str {
    match framework {
        Framework::NextJs => "Next.js (App Router, TypeScript)",
        Framework::Vite => "Vite + React (TypeScript)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_instruction_is_one_based() {
        let text = step_instruction(1, 3, "Add the list", "Request: todo", Framework::NextJs);
        assert!(text.contains("step 2 of 3"));
        assert!(text.contains("Request: todo"));
        assert!(text.contains("Next.js"));
    }

    #[test]
    fn test_repair_request_sections() {
        let files = vec![("app/page.tsx".to_string(), "export default 1".to_string())];
        let text = repair_request(Some("{}"), &files, "error TS2304", Framework::Vite);
        assert!(text.contains("## package.json"));
        assert!(text.contains("## app/page.tsx"));
        assert!(text.ends_with("error TS2304\n```\n"));
    }
}
