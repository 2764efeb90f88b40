//! Build output classification.
//!
//! A two-state automaton over the lines of a build log:
//!
//! ```text
//!            starts_block                 ends_block | starts_block
//! Outside ────────────────> Inside ──────────────────────────────────> flush
//!                             │ ^
//!                             └─┘ any other line is collected
//! ```
//!
//! A block ends on a blank line once it holds at least
//! [`MIN_LINES_BEFORE_BLANK`] lines, on a new report section heading, or when
//! it reaches [`MAX_BLOCK_LINES`]. A line that starts another error closes the
//! current block and opens a new one. Whatever is open at end of input is
//! flushed.

use std::sync::LazyLock;

use regex::Regex;

use super::{DiagnosticEntry, DiagnosticSource};

pub const MIN_LINES_BEFORE_BLANK: usize = 4;
pub const MAX_BLOCK_LINES: usize = 15;

/// Lines that open an error block.
static ERROR_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Compiler style: `src/a.ts(3,5): error TS2304: ...`, `error[E0425]:`
        r"\berror\s+[A-Z]{1,4}\d+\s*:",
        r"\berror\[[A-Z]+\d+\]:",
        // Bundler style: `[vite] Internal server error: ...`, `[plugin:vite:css] ... error`
        r"^\s*\[[\w:./@-]+\].*\berror\b",
        // Generic: `Error: Cannot find module`, `error - ./app/page.tsx`, `Type error: ...`
        r"(?i)^\s*(?:type\s+|syntax\s+|reference\s+|module\s+)?error\b",
        // Boxed / banner failures
        r"(?i)^\s*(?:✘\s*)?\[ERROR\]",
        r"(?i)^\s*failed to compile",
        r"(?i)^\s*(?:×|✖)\s",
        r"(?i)^\s*build failed\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Headings of unrelated report sections that must not bleed into a block.
static SECTION_HEADINGS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:import trace for requested module|warning\b|warn\b|info\b|> build\b|> [\w-]+@|▲ next\.js|route \((?:app|pages)\)|creating an optimized production build|npm (?:err!|error) (?:a complete log|code)|vite v\d)",
    )
    .ok()
});

/// Whether `line` opens a new error block.
pub fn starts_block(line: &str) -> bool {
    ERROR_SIGNATURES.iter().any(|re| re.is_match(line))
}

/// Whether `line` is the heading of an unrelated section.
pub fn is_new_section(line: &str) -> bool {
    SECTION_HEADINGS
        .as_ref()
        .is_some_and(|re| re.is_match(line))
}

#[derive(Debug)]
enum State {
    Outside,
    Inside(Vec<String>),
}

/// Incremental parser; feed lines, then `finish`.
#[derive(Debug)]
pub struct BuildOutputParser {
    state: State,
    blocks: Vec<String>,
}

impl Default for BuildOutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildOutputParser {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            blocks: Vec::new(),
        }
    }

    pub fn feed(&mut self, line: &str) {
        let line = line.trim_end();
        let state = std::mem::replace(&mut self.state, State::Outside);
        self.state = match state {
            State::Outside if starts_block(line) => State::Inside(vec![line.to_string()]),
            State::Outside => State::Outside,
            State::Inside(lines) => self.step_inside(lines, line),
        };
    }

    fn step_inside(&mut self, mut lines: Vec<String>, line: &str) -> State {
        if line.trim().is_empty() {
            if lines.len() >= MIN_LINES_BEFORE_BLANK {
                self.flush(lines);
                return State::Outside;
            }
            return State::Inside(lines);
        }
        if starts_block(line) {
            self.flush(lines);
            return State::Inside(vec![line.to_string()]);
        }
        if is_new_section(line) {
            self.flush(lines);
            return State::Outside;
        }
        lines.push(line.to_string());
        if lines.len() >= MAX_BLOCK_LINES {
            self.flush(lines);
            return State::Outside;
        }
        State::Inside(lines)
    }

    fn flush(&mut self, lines: Vec<String>) {
        let text = lines.join("\n").trim().to_string();
        if !text.is_empty() {
            self.blocks.push(text);
        }
    }

    pub fn finish(mut self) -> Vec<String> {
        if let State::Inside(lines) = std::mem::replace(&mut self.state, State::Outside) {
            self.flush(lines);
        }
        self.blocks
    }
}

/// Split raw build output into build diagnostics.
pub fn parse_build_output(output: &str) -> Vec<DiagnosticEntry> {
    let mut parser = BuildOutputParser::new();
    for line in output.lines() {
        parser.feed(line);
    }
    parser
        .finish()
        .into_iter()
        .map(|text| DiagnosticEntry::new(text, DiagnosticSource::Build))
        .collect()
}
