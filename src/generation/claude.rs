use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Generation, GenerationRequest, Generator};
use crate::errors::GenerationError;
use crate::session::Role;
use crate::stream::{StreamAccumulator, StreamUpdate};

/// Tools granted when the request carries a working directory.
pub const WRITE_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];
/// Tools granted otherwise.
pub const READ_TOOLS: &[&str] = &["Read", "Glob", "Grep"];

/// Runs the `claude` CLI in print mode with stream-json output.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    cmd: String,
}

impl ClaudeCli {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// CLI flags for `request`, excluding the prompt (sent on stdin).
    pub fn flags(request: &GenerationRequest) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if !request.system.is_empty() {
            flags.push("--append-system-prompt".to_string());
            flags.push(request.system.clone());
        }
        let tools = if request.tools.is_some() {
            flags.push("--permission-mode".to_string());
            flags.push("acceptEdits".to_string());
            WRITE_TOOLS
        } else {
            READ_TOOLS
        };
        flags.push("--allowedTools".to_string());
        flags.push(tools.join(","));
        flags
    }

    /// Flatten the history into one prompt. The last message is the request.
    pub fn render_prompt(request: &GenerationRequest) -> String {
        let Some((last, earlier)) = request.messages.split_last() else {
            return String::new();
        };
        if earlier.is_empty() {
            return last.content.clone();
        }
        let mut prompt = String::from("## Conversation so far\n\n");
        for message in earlier {
            let speaker = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            prompt.push_str(&format!("### {}\n{}\n\n", speaker, message.content.trim()));
        }
        prompt.push_str("## Current request\n\n");
        prompt.push_str(&last.content);
        prompt
    }

    async fn run(
        &self,
        request: GenerationRequest,
        chunks: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Generation, GenerationError> {
        let flags = Self::flags(&request);
        let prompt = Self::render_prompt(&request);

        let mut cmd = Command::new(&self.cmd);
        cmd.args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.tools {
            cmd.current_dir(dir);
        }

        debug!(cmd = %self.cmd, tools = request.tools.is_some(), prompt_len = prompt.len(), "Spawning generation");
        let mut child = cmd.spawn().map_err(GenerationError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let mut stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut acc = StreamAccumulator::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                for update in acc.push_line(&line) {
                    match update {
                        StreamUpdate::Text(text) => {
                            if let Some(tx) = &chunks {
                                let _ = tx.send(text);
                            }
                        }
                        StreamUpdate::Tool(call) => {
                            debug!(tool = %call.name, path = ?call.mutated_path(), "Tool call");
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if let Some(error) = acc.error() {
            return Err(classify_failure(error));
        }
        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("{} exited with {}", self.cmd, status)
            } else {
                stderr.trim().to_string()
            };
            warn!(cmd = %self.cmd, %status, "Generation process failed");
            return Err(classify_failure(&detail));
        }

        let (text, tool_calls) = acc.finish();
        Ok(Generation { text, tool_calls })
    }
}

/// Map provider failure text onto the error taxonomy.
pub fn classify_failure(text: &str) -> GenerationError {
    let lower = text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("429") {
        GenerationError::RateLimited(text.to_string())
    } else {
        GenerationError::Provider(text.to_string())
    }
}

#[async_trait]
impl Generator for ClaudeCli {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, GenerationError> {
        self.run(request, None).await
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<Generation, GenerationError> {
        self.run(request, Some(chunks)).await
    }
}
