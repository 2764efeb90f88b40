//! Generation adapter.
//!
//! The engine only sees the [`Generator`] trait: a message history plus an
//! optional tool scope goes in, text and the tool calls made along the way
//! come out. [`claude::ClaudeCli`] drives the `claude` binary,
//! [`retry::Retrying`] wraps any generator with rate-limit backoff, and
//! [`ScriptedGenerator`] replays canned responses.

pub mod claude;
pub mod retry;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::GenerationError;
use crate::session::Message;

pub use claude::ClaudeCli;
pub use retry::Retrying;

/// A tool invocation the model made while producing a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    /// Target path of a file-mutating tool, if this is one.
    pub fn mutated_path(&self) -> Option<&str> {
        match self.name.as_str() {
            "Write" | "Edit" | "MultiEdit" | "write_file" | "edit_file" | "delete_file" => self
                .input
                .get("file_path")
                .or_else(|| self.input.get("path"))
                .and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<Message>,
    /// Directory the model may act on through tools. `None` means read-only.
    pub tools: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools: None,
        }
    }

    pub fn with_tools(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.tools = Some(working_dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Distinct file paths touched by tool calls, in first-seen order.
    pub fn changed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for path in self.tool_calls.iter().filter_map(ToolCall::mutated_path) {
            if !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        }
        files
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, GenerationError>;

    /// Like `generate`, forwarding text fragments to `chunks` as they
    /// arrive. A closed receiver does not stop generation.
    async fn generate_stream(
        &self,
        request: GenerationRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<Generation, GenerationError> {
        let generation = self.generate(request).await?;
        let _ = chunks.send(generation.text.clone());
        Ok(generation)
    }
}

/// Replays queued responses in order; once the queue is empty every call
/// returns the fallback text. Every request is recorded.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<Generation, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    fallback: String,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            fallback: "Done.".to_string(),
            ..Default::default()
        }
    }

    pub fn with_fallback(fallback: impl Into<String>) -> Self {
        Self {
            fallback: fallback.into(),
            ..Default::default()
        }
    }

    pub fn push(&self, generation: Generation) -> &Self {
        self.queue().push_back(Ok(generation));
        self
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(Generation::text(text))
    }

    pub fn push_error(&self, error: GenerationError) -> &Self {
        self.queue().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Generation, GenerationError>>> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, GenerationError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self.queue().pop_front();
        next.unwrap_or_else(|| Ok(Generation::text(self.fallback.clone())))
    }
}
