use std::collections::VecDeque;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DiagnosticEntry, DiagnosticSource};

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    #[default]
    #[serde(alias = "error", alias = "uncaught")]
    UncaughtException,
    #[serde(alias = "unhandledrejection", alias = "rejection")]
    UnhandledRejection,
    #[serde(alias = "console", alias = "console.error")]
    ConsoleError,
}

impl RuntimeErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UncaughtException => "Uncaught exception",
            Self::UnhandledRejection => "Unhandled promise rejection",
            Self::ConsoleError => "Console error",
        }
    }
}

/// Payload posted by the error-capture script injected into the preview.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeReport {
    #[serde(default, rename = "type")]
    pub kind: RuntimeErrorKind,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl RuntimeReport {
    /// Text compared for deduplication. The timestamp lives on the entry.
    pub fn format(&self) -> String {
        let mut text = format!("{}: {}", self.kind.label(), self.message.trim());
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            text.push_str(&format!(" (at {})", url));
        }
        if let Some(stack) = self.stack.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            text.push('\n');
            text.push_str(stack);
        }
        text
    }
}

/// Bounded, deduplicated runtime error buffers keyed by session.
///
/// Each session's buffer is guarded by its own map shard entry, so ingestion
/// for one session never waits on another.
#[derive(Debug)]
pub struct RuntimeLog {
    capacity: usize,
    buffers: DashMap<String, VecDeque<DiagnosticEntry>>,
}

impl Default for RuntimeLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RuntimeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffers: DashMap::new(),
        }
    }

    /// Append `report` unless identical text is already buffered.
    /// Returns whether the entry was added.
    pub fn ingest(&self, session: &str, report: &RuntimeReport) -> bool {
        self.ingest_text(session, report.format())
    }

    pub fn ingest_text(&self, session: &str, text: String) -> bool {
        let mut buffer = self.buffers.entry(session.to_string()).or_default();
        if buffer.iter().any(|e| e.text == text) {
            debug!(session = %session, "Duplicate runtime error ignored");
            return false;
        }
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(DiagnosticEntry::new(text, DiagnosticSource::Runtime));
        true
    }

    /// Buffered entries, oldest first.
    pub fn entries(&self, session: &str) -> Vec<DiagnosticEntry> {
        self.buffers
            .get(session)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, session: &str) -> usize {
        self.buffers.get(session).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, session: &str) -> bool {
        self.len(session) == 0
    }

    /// Drop the `consumed` entries for `session`. Anything ingested after
    /// they were read stays buffered. Returns how many were dropped.
    pub fn remove(&self, session: &str, consumed: &[DiagnosticEntry]) -> usize {
        let Some(mut buffer) = self.buffers.get_mut(session) else {
            return 0;
        };
        let before = buffer.len();
        buffer.retain(|e| !consumed.iter().any(|c| c.text == e.text));
        before - buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn report(message: &str) -> RuntimeReport {
        RuntimeReport {
            kind: RuntimeErrorKind::UncaughtException,
            message: message.to_string(),
            stack: Some("at App (app/page.tsx:4:11)".into()),
            url: None,
        }
    }

    #[test]
    fn test_same_error_twice_is_buffered_once() {
        let log = RuntimeLog::default();
        assert!(log.ingest("s1", &report("x is not defined")));
        assert!(!log.ingest("s1", &report("x is not defined")));
        assert_eq!(log.len("s1"), 1);
    }

    #[test]
    fn test_fifty_one_errors_evict_the_earliest() {
        let log = RuntimeLog::default();
        for i in 0..51 {
            log.ingest("s1", &report(&format!("error number {}", i)));
        }
        let entries = log.entries("s1");
        assert_eq!(entries.len(), 50);
        assert!(entries[0].text.contains("error number 1\n"));
        assert!(entries[49].text.contains("error number 50"));
        assert!(!entries.iter().any(|e| e.text.contains("error number 0\n")));
    }

    #[test]
    fn test_sessions_are_independent() {
        let log = RuntimeLog::default();
        log.ingest("a", &report("boom"));
        log.ingest("b", &report("boom"));
        assert_eq!(log.len("a"), 1);
        assert_eq!(log.len("b"), 1);
        assert!(log.is_empty("c"));
    }

    #[test]
    fn test_remove_drops_only_consumed_entries() {
        let log = RuntimeLog::default();
        log.ingest("s1", &report("boom"));
        let consumed = log.entries("s1");
        log.ingest("s1", &report("new error from the edited code"));

        assert_eq!(log.remove("s1", &consumed), 1);
        let left = log.entries("s1");
        assert_eq!(left.len(), 1);
        assert!(left[0].text.contains("new error from the edited code"));
        assert_eq!(log.remove("ghost", &consumed), 0);
    }

    #[test]
    fn test_format_includes_kind_and_stack() {
        let text = RuntimeReport {
            kind: RuntimeErrorKind::UnhandledRejection,
            message: "fetch failed".into(),
            stack: Some("at load (app/page.tsx:9:3)".into()),
            url: Some("/todos".into()),
        }
        .format();
        assert_eq!(
            text,
            "Unhandled promise rejection: fetch failed (at /todos)\nat load (app/page.tsx:9:3)"
        );
    }

    #[test]
    fn test_report_accepts_browser_event_names() {
        let r: RuntimeReport =
            serde_json::from_str(r#"{"type":"unhandledrejection","message":"nope"}"#).unwrap();
        assert_eq!(r.kind, RuntimeErrorKind::UnhandledRejection);
        let r: RuntimeReport = serde_json::from_str(r#"{"message":"plain"}"#).unwrap();
        assert_eq!(r.kind, RuntimeErrorKind::UncaughtException);
        assert!(r.stack.is_none());
    }

    #[test]
    fn test_concurrent_ingest_keeps_dedup() {
        let log = Arc::new(RuntimeLog::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        log.ingest("s1", &report(&format!("e{}", i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len("s1"), 10);
    }
}
