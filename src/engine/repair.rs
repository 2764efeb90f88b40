//! Repair Loop and background verification.
//!
//! [`RepairLoop::run`] is a single corrective pass: it never retries on its
//! own. Callers decide whether to rebuild and run it again.

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::diagnostics::{self, DiagnosticEntry, DiagnosticSource, RuntimeLog};
use crate::generation::{GenerationRequest, Generator};
use crate::preview::{Framework, FrameworkProfile};
use crate::prompts;
use crate::session::Message;
use crate::workspace::Workspace;

use super::events::EventSink;
use super::executor::generate_with_chunks;

/// Files pulled into one repair request at most.
pub const MAX_CONTEXT_FILES: usize = 12;
/// Bytes kept from any single context file.
pub const MAX_FILE_BYTES: usize = 24 * 1024;

static ERROR_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:^|[\s'"`(])((?:/|\./|\.\./)?(?:[\w@\[\].-][\w@\[\]().-]*/(?:[\w@\[\]().-]+/)*)?[\w\[\].-]+\.(?:tsx|ts|jsx|js|mjs|cjs|css|scss|json|vue|svelte|html))\b"#,
    )
    .unwrap()
});

/// Project files named in `text`, as workspace-relative paths.
///
/// Absolute paths are kept only when they lie under `root`. Dependency and
/// build output paths are skipped. Order of first appearance, no duplicates.
pub fn extract_error_paths(text: &str, root: &Path) -> Vec<String> {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches('/');
    let mut paths: Vec<String> = Vec::new();

    for m in ERROR_PATH.captures_iter(text).filter_map(|c| c.get(1)) {
        let raw = m.as_str();
        let relative = if raw.starts_with('/') {
            match raw.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
                Some(r) => r.to_string(),
                None => continue,
            }
        } else {
            raw.trim_start_matches("./").to_string()
        };
        if relative.is_empty()
            || relative.starts_with("../")
            || relative.starts_with("node_modules/")
            || relative.starts_with(".next/")
            || relative.starts_with("dist/")
            || relative.contains("/node_modules/")
        {
            continue;
        }
        if !paths.contains(&relative) {
            paths.push(relative);
        }
    }
    paths
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairOutcome {
    pub success: bool,
    pub summary: String,
    pub changed_files: Vec<String>,
    /// Files handed to the model as context
    pub context_files: Vec<String>,
}

impl RepairOutcome {
    fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            changed_files: Vec::new(),
            context_files: Vec::new(),
        }
    }
}

/// Run the build and gather diagnostics: build errors when the build fails,
/// otherwise whatever the runtime log holds for the session.
pub async fn collect_diagnostics(
    workspace: &dyn Workspace,
    profile: &FrameworkProfile,
    runtime: &RuntimeLog,
    session: &str,
) -> Vec<DiagnosticEntry> {
    match workspace.run_command(&profile.build).await {
        Ok(out) if out.success() => runtime.entries(session),
        Ok(out) => {
            let combined = out.combined();
            let mut entries = diagnostics::parse_build_output(&combined);
            if entries.is_empty() {
                // Unrecognized failure format: hand over the tail verbatim.
                let lines: Vec<&str> = combined.lines().collect();
                let tail = lines[lines.len().saturating_sub(30)..].join("\n");
                let text = if tail.trim().is_empty() {
                    format!("Build failed with exit code {:?}", out.exit_code)
                } else {
                    tail
                };
                entries.push(DiagnosticEntry::new(text, DiagnosticSource::Build));
            }
            entries
        }
        Err(e) => vec![DiagnosticEntry::new(
            format!("Build command could not run: {}", e),
            DiagnosticSource::Build,
        )],
    }
}

pub struct RepairLoop {
    generator: Arc<dyn Generator>,
}

impl RepairLoop {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    /// One corrective generation over `diagnostics`. Never returns an error;
    /// a failed attempt comes back as `success: false`.
    pub async fn run(
        &self,
        session: &str,
        workspace: &dyn Workspace,
        profile: &FrameworkProfile,
        framework: Framework,
        diagnostics: &[DiagnosticEntry],
        sink: &EventSink,
    ) -> RepairOutcome {
        if diagnostics.is_empty() {
            return RepairOutcome {
                success: true,
                summary: "No errors to repair".to_string(),
                changed_files: Vec::new(),
                context_files: Vec::new(),
            };
        }

        let errors = diagnostics::render_all(diagnostics);
        let manifest = workspace.read_file(&profile.manifest).await.ok();

        let mut files = Vec::new();
        for path in extract_error_paths(&errors, workspace.root())
            .into_iter()
            .filter(|p| *p != profile.manifest)
            .take(MAX_CONTEXT_FILES)
        {
            if let Ok(content) = workspace.read_file(&path).await {
                files.push((path, truncate(content, MAX_FILE_BYTES)));
            }
        }
        let context_files: Vec<String> = files.iter().map(|(p, _)| p.clone()).collect();

        info!(
            session,
            errors = diagnostics.len(),
            context_files = context_files.len(),
            "running repair"
        );
        sink.status(format!(
            "Repairing {} error(s) using {} file(s) of context",
            diagnostics.len(),
            context_files.len()
        ));

        let request_text = prompts::repair_request(manifest.as_deref(), &files, &errors, framework);
        let request = GenerationRequest::new(
            prompts::REPAIR_SYSTEM_PROMPT,
            vec![Message::user(request_text)],
        )
        .with_tools(workspace.root());

        match generate_with_chunks(self.generator.as_ref(), request, sink).await {
            Ok(generation) => {
                let changed_files = generation.changed_files();
                sink.changes(&changed_files);
                RepairOutcome {
                    success: true,
                    summary: generation.text,
                    changed_files,
                    context_files,
                }
            }
            Err(e) => {
                warn!(session, error = %e, "repair generation failed");
                RepairOutcome {
                    context_files,
                    ..RepairOutcome::failed(e.to_string())
                }
            }
        }
    }
}

/// Inputs for a detached verification pass.
pub struct Verification {
    pub session: String,
    pub framework: Framework,
    pub profile: FrameworkProfile,
    pub settle: Duration,
}

/// Settle, rebuild, collect diagnostics, and repair once if anything is wrong.
/// Returns `None` when the project was clean.
pub async fn verify_and_repair(
    verification: Verification,
    workspace: &dyn Workspace,
    runtime: &RuntimeLog,
    repair: &RepairLoop,
) -> Option<RepairOutcome> {
    let Verification {
        session,
        framework,
        profile,
        settle,
    } = verification;

    tokio::time::sleep(settle).await;
    let found = collect_diagnostics(workspace, &profile, runtime, &session).await;
    if found.is_empty() {
        info!(session = %session, "verification clean");
        return None;
    }

    info!(session = %session, errors = found.len(), "verification found errors");
    let outcome = repair
        .run(&session, workspace, &profile, framework, &found, &EventSink::discard())
        .await;
    if outcome.success && found.iter().any(|e| e.source == DiagnosticSource::Runtime) {
        runtime.remove(&session, &found);
    }
    Some(outcome)
}

fn truncate(mut content: String, max: usize) -> String {
    if content.len() > max {
        let mut cut = max;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        content.truncate(cut);
        content.push_str("\n/* ... truncated ... */");
    }
    content
}
