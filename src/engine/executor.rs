//! Step Executor: runs an approved plan one step at a time.
//!
//! Steps run strictly in order because each step's request carries the
//! history produced by the steps before it. A step whose generation fails is
//! reported as a status event and recorded as unsuccessful; the next step
//! still runs.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::{GenerationError, OrchestratorError};
use crate::generation::{Generation, GenerationRequest, Generator};
use crate::preview::Framework;
use crate::prompts;
use crate::session::{Message, Plan, Role, SessionStore};

use super::events::EventSink;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub output: String,
    pub success: bool,
    pub changed_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<StepResult>,
    /// Every file touched across all steps, first-seen order
    pub changed_files: Vec<String>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Outputs of the successful steps, in order.
    pub fn text(&self) -> String {
        self.results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.output.trim())
            .filter(|o| !o.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Run one generation, forwarding text fragments to `sink` as chunks.
pub async fn generate_with_chunks(
    generator: &dyn Generator,
    request: GenerationRequest,
    sink: &EventSink,
) -> Result<Generation, GenerationError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let forward = async {
        while let Some(chunk) = rx.recv().await {
            sink.chunk(chunk);
        }
    };
    let (result, ()) = tokio::join!(generator.generate_stream(request, tx), forward);
    result
}

pub struct StepExecutor {
    generator: Arc<dyn Generator>,
    store: Arc<dyn SessionStore>,
}

impl StepExecutor {
    pub fn new(generator: Arc<dyn Generator>, store: Arc<dyn SessionStore>) -> Self {
        Self { generator, store }
    }

    pub async fn run(
        &self,
        session: &str,
        plan: &Plan,
        framework: Framework,
        workspace: &Path,
        sink: &EventSink,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let mut history = self
            .store
            .get_history(session)
            .await
            .map_err(OrchestratorError::Store)?;
        let summary = plan.summary();
        let total = plan.steps.len();
        let mut report = ExecutionReport::default();

        for (index, step) in plan.steps.iter().enumerate() {
            sink.status(format!("Step {}/{}: {}", index + 1, total, step));
            let instruction = prompts::step_instruction(index, total, step, &summary, framework);

            let mut messages = history.clone();
            messages.push(Message::user(instruction.clone()));
            let request = GenerationRequest::new(prompts::CODER_SYSTEM_PROMPT, messages)
                .with_tools(workspace);

            let result = generate_with_chunks(self.generator.as_ref(), request, sink).await;
            let user = Message::user(instruction);
            self.remember(session, &mut history, user).await?;

            match result {
                Ok(generation) => {
                    let changed = generation.changed_files();
                    for file in &changed {
                        if !report.changed_files.contains(file) {
                            report.changed_files.push(file.clone());
                        }
                    }
                    sink.changes(&changed);
                    sink.chunk(format!("\n\n✓ Step {}/{} complete\n\n", index + 1, total));
                    info!(session, step = index + 1, total, files = changed.len(), "step complete");

                    let reply = Message::assistant(generation.text.clone());
                    self.remember(session, &mut history, reply).await?;
                    report.results.push(StepResult {
                        index,
                        output: generation.text,
                        success: true,
                        changed_files: changed,
                        error: None,
                    });
                }
                Err(e) => {
                    let message = format!("Step {}/{} failed: {}", index + 1, total, e);
                    warn!(session, step = index + 1, total, error = %e, "step failed; continuing");
                    sink.status(message.clone());

                    let note = Message::new(Role::System, message);
                    self.remember(session, &mut history, note).await?;
                    report.results.push(StepResult {
                        index,
                        output: String::new(),
                        success: false,
                        changed_files: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn remember(
        &self,
        session: &str,
        history: &mut Vec<Message>,
        message: Message,
    ) -> Result<(), OrchestratorError> {
        self.store
            .add_message(session, message.clone())
            .await
            .map_err(OrchestratorError::Store)?;
        history.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::{self, StudioEvent};
    use crate::generation::{ScriptedGenerator, ToolCall};
    use crate::session::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn plan(steps: &[&str]) -> Plan {
        Plan {
            request: "Create a todo app".into(),
            text: String::new(),
            components: vec![],
            files: vec![],
            steps: steps.iter().map(|s| s.to_string()).collect(),
            approved: true,
            created_at: Utc::now(),
        }
    }

    fn write(path: &str) -> ToolCall {
        ToolCall {
            name: "Write".into(),
            input: json!({"file_path": path}),
        }
    }

    #[tokio::test]
    async fn test_failing_middle_step_does_not_stop_the_last() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator
            .push(Generation {
                text: "made list".into(),
                tool_calls: vec![write("components/TodoList.tsx")],
            })
            .push_error(GenerationError::Provider("malformed tool call".into()))
            .push(Generation {
                text: "wired page".into(),
                tool_calls: vec![write("app/page.tsx")],
            });
        let store = Arc::new(MemoryStore::new());
        let executor = StepExecutor::new(generator.clone(), store.clone());
        let (sink, stream) = events::channel();

        let report = executor
            .run(
                "s1",
                &plan(&["list", "item", "page"]),
                Framework::NextJs,
                Path::new("/tmp/ws"),
                &sink,
            )
            .await
            .unwrap();
        sink.complete("done", None);

        assert_eq!(report.results.len(), 3);
        assert!(report.results[0].success);
        assert!(!report.results[1].success);
        assert!(report.results[2].success);
        assert_eq!(report.results[2].output, "wired page");
        assert_eq!(report.changed_files, vec!["components/TodoList.tsx", "app/page.tsx"]);
        assert_eq!(report.succeeded(), 2);

        let events = stream.collect().await;
        assert!(events.iter().any(|e| matches!(
            e,
            StudioEvent::Status { message } if message.contains("Step 2/3 failed")
        )));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_each_step_sees_prior_steps_in_history() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_text("first output").push_text("second output");
        let store = Arc::new(MemoryStore::new());
        let executor = StepExecutor::new(generator.clone(), store.clone());

        executor
            .run(
                "s1",
                &plan(&["one", "two"]),
                Framework::Vite,
                Path::new("/tmp/ws"),
                &EventSink::discard(),
            )
            .await
            .unwrap();

        let requests = generator.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].tools.is_some());
        let second: Vec<_> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert!(second.contains(&"first output"));
        assert!(requests[1].messages.last().unwrap().content.contains("step 2 of 2"));

        let history = store.get_history("s1").await.unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn test_step_chunks_and_completion_markers_are_emitted() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_text("alpha").push_text("beta");
        let executor = StepExecutor::new(generator, Arc::new(MemoryStore::new()));
        let (sink, stream) = events::channel();
        executor
            .run("s1", &plan(&["a", "b"]), Framework::NextJs, Path::new("/tmp"), &sink)
            .await
            .unwrap();
        sink.complete("", None);

        let chunks: Vec<String> = stream
            .collect()
            .await
            .into_iter()
            .filter_map(|e| match e {
                StudioEvent::Chunk { content } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], "alpha");
        assert!(chunks[1].contains("Step 1/2 complete"));
    }
}
