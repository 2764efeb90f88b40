//! Build and runtime diagnostics.
//!
//! Build output is split into error blocks by [`parser`]; runtime errors
//! reported by the live preview are buffered per session by [`runtime`].

pub mod parser;
pub mod runtime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use parser::{parse_build_output, BuildOutputParser};
pub use runtime::{RuntimeErrorKind, RuntimeLog, RuntimeReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSource {
    Build,
    Runtime,
}

impl DiagnosticSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
        }
    }
}

/// One error block awaiting repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub text: String,
    pub source: DiagnosticSource,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticEntry {
    pub fn new(text: impl Into<String>, source: DiagnosticSource) -> Self {
        Self {
            text: text.into(),
            source,
            timestamp: Utc::now(),
        }
    }

    /// Rendered form used in repair prompts.
    pub fn render(&self) -> String {
        match self.source {
            DiagnosticSource::Build => self.text.clone(),
            DiagnosticSource::Runtime => format!(
                "[{}] {}",
                self.timestamp.format("%H:%M:%S"),
                self.text
            ),
        }
    }
}

/// Joined text of a diagnostics list, build errors first.
pub fn render_all(entries: &[DiagnosticEntry]) -> String {
    let mut ordered: Vec<&DiagnosticEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.source != DiagnosticSource::Build);
    ordered
        .iter()
        .map(|e| e.render())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_all_puts_build_errors_first() {
        let entries = vec![
            DiagnosticEntry::new("TypeError: x is undefined", DiagnosticSource::Runtime),
            DiagnosticEntry::new("error TS2304: Cannot find name 'y'", DiagnosticSource::Build),
        ];
        let text = render_all(&entries);
        let build = text.find("TS2304").unwrap();
        let runtime = text.find("TypeError").unwrap();
        assert!(build < runtime);
    }

    #[test]
    fn test_runtime_entries_render_with_timestamp() {
        let entry = DiagnosticEntry::new("boom", DiagnosticSource::Runtime);
        let rendered = entry.render();
        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("] boom"));
    }
}
