//! Orchestration Engine: the planning, coding, fast, and repair entry points.
//!
//! Each entry point for a session runs under that session's lock, so two
//! requests for one session never interleave their phase transitions or
//! steps. Different sessions proceed independently. Streamed variants run on
//! a supervised task and keep going if the consumer disconnects.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::diagnostics::{DiagnosticEntry, DiagnosticSource, RuntimeLog, RuntimeReport};
use crate::errors::OrchestratorError;
use crate::generation::{GenerationRequest, Generator};
use crate::preview::{Framework, PreviewStatus, ProcessPool, Profiles};
use crate::prompts;
use crate::session::{Message, Phase, PhaseMachine, Role, SessionStore};
use crate::workspace::{Workspace, WorkspaceManager, validate_session_id};

use super::events::{self, EventSink, EventStream};
use super::executor::{StepExecutor, generate_with_chunks};
use super::plan::PlanDraft;
use super::repair::{self, RepairLoop, Verification};
use super::supervisor::TaskSupervisor;

/// Result of the synchronous planning entry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanResponse {
    pub plan_text: String,
    pub phase: Phase,
}

/// Everything the engine is assembled from.
pub struct EngineParts {
    pub store: Arc<dyn SessionStore>,
    pub generator: Arc<dyn Generator>,
    pub workspaces: WorkspaceManager,
    pub pool: ProcessPool,
    pub profiles: Profiles,
    pub runtime_log: Arc<RuntimeLog>,
    /// Wait before background verification rebuilds
    pub settle: Duration,
}

pub struct Engine {
    store: Arc<dyn SessionStore>,
    phases: PhaseMachine,
    generator: Arc<dyn Generator>,
    workspaces: WorkspaceManager,
    pool: ProcessPool,
    profiles: Profiles,
    runtime_log: Arc<RuntimeLog>,
    settle: Duration,
    supervisor: TaskSupervisor,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            phases: PhaseMachine::new(Arc::clone(&parts.store)),
            store: parts.store,
            generator: parts.generator,
            workspaces: parts.workspaces,
            pool: parts.pool,
            profiles: parts.profiles,
            runtime_log: parts.runtime_log,
            settle: parts.settle,
            supervisor: TaskSupervisor::new(),
            locks: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &ProcessPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    fn session_lock(&self, session: &str) -> Arc<Mutex<()>> {
        self.locks.entry(session.to_string()).or_default().clone()
    }

    async fn lock_session(&self, session: &str) -> Result<OwnedMutexGuard<()>, OrchestratorError> {
        validate_session_id(session)?;
        Ok(self.session_lock(session).lock_owned().await)
    }

    async fn framework_for(&self, session: &str) -> Result<Framework, OrchestratorError> {
        Ok(self
            .store
            .get_framework(session)
            .await
            .map_err(OrchestratorError::Store)?
            .unwrap_or_default())
    }

    async fn remember(&self, session: &str, message: Message) -> Result<(), OrchestratorError> {
        self.store
            .add_message(session, message)
            .await
            .map_err(OrchestratorError::Store)
    }

    // ── planning ────────────────────────────────────────────────────────

    pub async fn plan(
        &self,
        session: &str,
        prompt: &str,
        framework: Framework,
    ) -> Result<PlanResponse, OrchestratorError> {
        let _guard = self.lock_session(session).await?;
        self.run_plan(session, prompt, framework, &EventSink::discard()).await
    }

    pub fn plan_stream(
        self: &Arc<Self>,
        session: &str,
        prompt: &str,
        framework: Framework,
    ) -> EventStream {
        let (sink, stream) = events::channel();
        let engine = Arc::clone(self);
        let session = session.to_string();
        let prompt = prompt.to_string();
        self.supervisor.spawn("plan", async move {
            let result = match engine.lock_session(&session).await {
                Ok(_guard) => engine.run_plan(&session, &prompt, framework, &sink).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => sink.complete(response.plan_text, Some(response.phase)),
                Err(e) => fail(sink, &session, "plan", e),
            }
            Ok(())
        });
        stream
    }

    async fn run_plan(
        &self,
        session: &str,
        prompt: &str,
        framework: Framework,
        sink: &EventSink,
    ) -> Result<PlanResponse, OrchestratorError> {
        self.workspaces.ensure(session, framework).await?;
        self.store
            .set_framework(session, framework)
            .await
            .map_err(OrchestratorError::Store)?;
        let from = self.phases.transition(session, Phase::Planning).await?;
        if from == Phase::AwaitingApproval {
            info!(session, "new plan supersedes the pending one");
        }
        sink.status("Planning...");

        let mut messages = self
            .store
            .get_history(session)
            .await
            .map_err(OrchestratorError::Store)?;
        messages.push(Message::user(prompts::planning_request(prompt, framework)));
        self.remember(session, Message::user(prompt)).await?;

        let request = GenerationRequest::new(prompts::PLANNER_SYSTEM_PROMPT, messages);
        let generation = generate_with_chunks(self.generator.as_ref(), request, sink).await?;
        let text = generation.text.trim().to_string();
        if text.is_empty() {
            return Err(OrchestratorError::EmptyPlan {
                session: session.to_string(),
            });
        }

        let plan = PlanDraft::from_text(prompt, &text).into_plan(prompt, &text);
        sink.status(format!("Plan ready: {} step(s)", plan.steps.len()));
        info!(session, steps = plan.steps.len(), files = plan.files.len(), "plan created");
        self.store
            .set_plan(session, plan)
            .await
            .map_err(OrchestratorError::Store)?;
        self.remember(session, Message::assistant(text.clone())).await?;
        self.phases.transition(session, Phase::AwaitingApproval).await?;

        Ok(PlanResponse {
            plan_text: text,
            phase: Phase::AwaitingApproval,
        })
    }

    // ── approval + coding ───────────────────────────────────────────────

    pub async fn approve_and_code(&self, session: &str) -> Result<String, OrchestratorError> {
        let _guard = self.lock_session(session).await?;
        self.run_approve(session, &EventSink::discard()).await
    }

    pub fn approve_and_code_stream(self: &Arc<Self>, session: &str) -> EventStream {
        let (sink, stream) = events::channel();
        let engine = Arc::clone(self);
        let session = session.to_string();
        self.supervisor.spawn("approve", async move {
            let result = match engine.lock_session(&session).await {
                Ok(_guard) => engine.run_approve(&session, &sink).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(text) => sink.complete(text, Some(Phase::Complete)),
                Err(e) => fail(sink, &session, "approve", e),
            }
            Ok(())
        });
        stream
    }

    async fn run_approve(&self, session: &str, sink: &EventSink) -> Result<String, OrchestratorError> {
        let no_plan = || OrchestratorError::NoPlanFound {
            session: session.to_string(),
        };
        self.store
            .get_pending_plan(session)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or_else(no_plan)?;
        self.phases.transition(session, Phase::Coding).await?;
        let plan = self
            .store
            .approve_plan(session)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or_else(no_plan)?;

        let framework = self.framework_for(session).await?;
        let workspace = self.workspaces.ensure(session, framework).await?;
        sink.status(format!("Plan approved; implementing {} step(s)", plan.steps.len()));

        let executor = StepExecutor::new(Arc::clone(&self.generator), Arc::clone(&self.store));
        let report = executor
            .run(session, &plan, framework, workspace.root(), sink)
            .await?;
        info!(
            session,
            steps = report.results.len(),
            succeeded = report.succeeded(),
            files = report.changed_files.len(),
            "coding finished"
        );

        self.phases.transition(session, Phase::Verifying).await?;
        self.finish_coding(session, framework, sink).await?;

        let text = report.text();
        Ok(if text.is_empty() {
            format!(
                "Completed {}/{} step(s); {} file(s) changed",
                report.succeeded(),
                report.results.len(),
                report.changed_files.len()
            )
        } else {
            text
        })
    }

    /// Kick off background verification, make sure a preview is up, and
    /// mark the session complete.
    async fn finish_coding(
        &self,
        session: &str,
        framework: Framework,
        sink: &EventSink,
    ) -> Result<(), OrchestratorError> {
        self.spawn_verification(session, framework)?;

        sink.status("Starting preview");
        match self.pool.start(session, framework).await {
            Ok(outcome) => sink.status(format!(
                "Preview {} on port {}",
                outcome.status, outcome.port
            )),
            Err(e) => {
                warn!(session, error = %e, "preview unavailable after coding");
                sink.status(format!("Preview unavailable: {}", e));
            }
        }

        self.phases.transition(session, Phase::Complete).await?;
        Ok(())
    }

    fn spawn_verification(&self, session: &str, framework: Framework) -> Result<(), OrchestratorError> {
        let workspace = self.workspaces.open(session)?;
        let runtime = Arc::clone(&self.runtime_log);
        let store = Arc::clone(&self.store);
        let repair = RepairLoop::new(Arc::clone(&self.generator));
        let verification = Verification {
            session: session.to_string(),
            framework,
            profile: self.profiles.get(framework),
            settle: self.settle,
        };
        let lock = self.session_lock(session);
        let session = session.to_string();

        // Queues behind the entry point that spawned it.
        self.supervisor.spawn("verification", async move {
            let _guard = lock.lock_owned().await;
            let Some(outcome) =
                repair::verify_and_repair(verification, &workspace, &runtime, &repair).await
            else {
                return Ok(());
            };
            let note = if outcome.success {
                format!("Automatic repair applied: {}", outcome.summary.trim())
            } else {
                format!("Automatic repair failed: {}", outcome.summary.trim())
            };
            store.add_message(&session, Message::new(Role::System, note)).await?;
            if !outcome.success {
                anyhow::bail!("automatic repair for {} failed: {}", session, outcome.summary);
            }
            info!(session = %session, files = outcome.changed_files.len(), "automatic repair applied");
            Ok(())
        });
        Ok(())
    }

    // ── fast mode ───────────────────────────────────────────────────────

    pub fn fast_mode(
        self: &Arc<Self>,
        session: &str,
        message: &str,
        framework: Framework,
    ) -> EventStream {
        let (sink, stream) = events::channel();
        let engine = Arc::clone(self);
        let session = session.to_string();
        let message = message.to_string();
        self.supervisor.spawn("fast", async move {
            let result = match engine.lock_session(&session).await {
                Ok(_guard) => engine.run_fast(&session, &message, framework, &sink).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(text) => sink.complete(text, Some(Phase::Complete)),
                Err(e) => fail(sink, &session, "fast", e),
            }
            Ok(())
        });
        stream
    }

    async fn begin_direct_run(&self, session: &str) -> Result<(), OrchestratorError> {
        let phase = self.phases.current(session).await?;
        if !phase.accepts_direct_run() {
            return Err(OrchestratorError::InvalidTransition {
                session: session.to_string(),
                from: phase,
                to: Phase::Coding,
            });
        }
        self.phases.transition(session, Phase::Coding).await?;
        Ok(())
    }

    async fn run_fast(
        &self,
        session: &str,
        message: &str,
        framework: Framework,
        sink: &EventSink,
    ) -> Result<String, OrchestratorError> {
        let workspace = self.workspaces.ensure(session, framework).await?;
        self.store
            .set_framework(session, framework)
            .await
            .map_err(OrchestratorError::Store)?;
        self.begin_direct_run(session).await?;
        sink.status("Generating changes");

        let mut messages = self
            .store
            .get_history(session)
            .await
            .map_err(OrchestratorError::Store)?;
        messages.push(Message::user(prompts::fast_request(message, framework)));
        self.remember(session, Message::user(message)).await?;

        let request = GenerationRequest::new(prompts::FAST_SYSTEM_PROMPT, messages)
            .with_tools(workspace.root());
        let generation = generate_with_chunks(self.generator.as_ref(), request, sink).await?;
        let files = generation.changed_files();
        sink.changes(&files);
        self.remember(session, Message::assistant(generation.text.clone()))
            .await?;
        info!(session, files = files.len(), "fast mode change applied");

        self.finish_coding(session, framework, sink).await?;
        Ok(generation.text)
    }

    // ── repair ──────────────────────────────────────────────────────────

    pub fn repair(self: &Arc<Self>, session: &str, framework: Framework) -> EventStream {
        let (sink, stream) = events::channel();
        let engine = Arc::clone(self);
        let session = session.to_string();
        self.supervisor.spawn("repair", async move {
            let result = match engine.lock_session(&session).await {
                Ok(_guard) => engine.run_repair(&session, framework, &sink).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(text) => sink.complete(text, Some(Phase::Complete)),
                Err(e) => fail(sink, &session, "repair", e),
            }
            Ok(())
        });
        stream
    }

    async fn run_repair(
        &self,
        session: &str,
        framework: Framework,
        sink: &EventSink,
    ) -> Result<String, OrchestratorError> {
        let workspace = self.workspaces.open(session)?;
        self.begin_direct_run(session).await?;
        let profile = self.profiles.get(framework);

        sink.status("Running build");
        let found =
            repair::collect_diagnostics(&workspace, &profile, &self.runtime_log, session).await;
        if found.is_empty() {
            self.phases.transition(session, Phase::Complete).await?;
            return Ok("No errors found".to_string());
        }
        sink.status(format!("Found {} error(s)", found.len()));

        let repair = RepairLoop::new(Arc::clone(&self.generator));
        let outcome = repair
            .run(session, &workspace, &profile, framework, &found, sink)
            .await;
        if !outcome.success {
            self.remember(
                session,
                Message::new(Role::System, format!("Repair failed: {}", outcome.summary)),
            )
            .await?;
            return Err(OrchestratorError::RepairFailed(outcome.summary));
        }
        if found.iter().any(|e| e.source == DiagnosticSource::Runtime) {
            self.runtime_log.remove(session, &found);
        }
        self.remember(session, Message::assistant(outcome.summary.clone()))
            .await?;

        sink.status("Re-verifying");
        let remaining =
            repair::collect_diagnostics(&workspace, &profile, &self.runtime_log, session).await;
        self.phases.transition(session, Phase::Complete).await?;

        info!(session, fixed = found.len(), remaining = remaining.len(), "repair pass finished");
        Ok(if remaining.is_empty() {
            format!("Repaired {} error(s); build is clean", found.len())
        } else {
            format!(
                "Repair applied; {} error(s) remain:\n\n{}",
                remaining.len(),
                crate::diagnostics::render_all(&remaining)
            )
        })
    }

    // ── routing and ingestion ───────────────────────────────────────────

    /// Route a chat message: to approval while a plan awaits it, to planning otherwise.
    pub async fn dispatch(
        self: &Arc<Self>,
        session: &str,
        message: &str,
        framework: Framework,
    ) -> Result<EventStream, OrchestratorError> {
        validate_session_id(session)?;
        let phase = self.phases.current(session).await?;
        if phase == Phase::AwaitingApproval {
            info!(session, "message routed to approval");
            self.remember(session, Message::user(message)).await?;
            Ok(self.approve_and_code_stream(session))
        } else {
            Ok(self.plan_stream(session, message, framework))
        }
    }

    /// Runtime-log callback for the preview's error-capture script.
    pub fn ingest_runtime_error(&self, session: &str, report: &RuntimeReport) -> Result<bool, OrchestratorError> {
        validate_session_id(session)?;
        self.pool.touch(session);
        Ok(self.runtime_log.ingest(session, report))
    }

    pub fn runtime_errors(&self, session: &str) -> Vec<DiagnosticEntry> {
        self.runtime_log.entries(session)
    }

    pub async fn start_preview(
        &self,
        session: &str,
        framework: Option<Framework>,
    ) -> Result<PreviewStatus, OrchestratorError> {
        let framework = match framework {
            Some(f) => f,
            None => self.framework_for(session).await?,
        };
        self.pool.start(session, framework).await?;
        self.pool
            .status(session)
            .ok_or_else(|| crate::errors::PreviewError::NotFound(session.to_string()).into())
    }

    pub async fn phase(&self, session: &str) -> Result<Phase, OrchestratorError> {
        validate_session_id(session)?;
        self.phases.current(session).await
    }

    /// Abandon whatever the session was doing.
    pub async fn reset(&self, session: &str) -> Result<Phase, OrchestratorError> {
        let _guard = self.lock_session(session).await?;
        self.phases.reset(session).await
    }

    /// Abort background work and stop every preview.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.pool.shutdown().await;
    }
}

fn fail(sink: EventSink, session: &str, op: &'static str, error: OrchestratorError) {
    warn!(session, op, error = %error, "entry point failed");
    sink.fail(error.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::StudioEvent;
    use crate::generation::{Generation, ScriptedGenerator, ToolCall};
    use crate::preview::{PoolConfig, ProfileOverride};
    use crate::session::MemoryStore;
    use std::collections::HashMap;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PLAN: &str = "\
## Components
- TodoList
- TodoItem

## Files
- app/page.tsx

## Steps
1. Create TodoItem
2. Create TodoList
3. Wire up the page
";

    struct Harness {
        _dir: tempfile::TempDir,
        engine: Arc<Engine>,
        generator: Arc<ScriptedGenerator>,
        store: Arc<MemoryStore>,
    }

    fn harness_with_build(build: &str) -> Harness {
        let generator = Arc::new(ScriptedGenerator::new());
        let store = Arc::new(MemoryStore::new());
        let (dir, engine) = build_engine(build, generator.clone(), store.clone());
        Harness {
            _dir: dir,
            engine,
            generator,
            store,
        }
    }

    fn build_engine(
        build: &str,
        generator: Arc<dyn Generator>,
        store: Arc<MemoryStore>,
    ) -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceManager::new(dir.path().join("ws"), 4, Duration::from_secs(10));
        let mut overrides = HashMap::new();
        overrides.insert(
            Framework::NextJs,
            ProfileOverride {
                install: Some("true".into()),
                dev: Some("exec sleep 30".into()),
                build: Some(build.into()),
                ..Default::default()
            },
        );
        let profiles = Profiles::new(overrides);
        let base_port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
            .min(60000);
        let pool = ProcessPool::new(
            PoolConfig {
                base_port,
                port_window: 50,
                stop_grace: Duration::from_millis(200),
                ..PoolConfig::default()
            },
            profiles.clone(),
            workspaces.clone(),
        );
        let engine = Arc::new(Engine::new(EngineParts {
            store,
            generator,
            workspaces,
            pool,
            profiles,
            runtime_log: Arc::new(RuntimeLog::default()),
            settle: Duration::from_millis(1),
        }));
        (dir, engine)
    }

    /// Counts generations in flight and remembers the highest count seen.
    #[derive(Default)]
    struct OverlapGenerator {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Generator for OverlapGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<Generation, crate::errors::GenerationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Generation::text("edited"))
        }
    }

    fn harness() -> Harness {
        harness_with_build("true")
    }

    #[tokio::test]
    async fn test_plan_todo_app_awaits_approval() {
        let h = harness();
        h.generator.push_text(PLAN);

        let response = h
            .engine
            .plan("s1", "Create a todo app", Framework::NextJs)
            .await
            .unwrap();

        assert!(!response.plan_text.is_empty());
        assert_eq!(response.phase, Phase::AwaitingApproval);
        assert_eq!(h.engine.phase("s1").await.unwrap(), Phase::AwaitingApproval);
        let plan = h.store.get_pending_plan("s1").await.unwrap().unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.components, vec!["TodoList", "TodoItem"]);
        assert!(h.generator.requests()[0].tools.is_none());
    }

    #[tokio::test]
    async fn test_approve_without_plan_is_no_plan_found() {
        let h = harness();
        let err = h.engine.approve_and_code("s1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoPlanFound { .. }));
        assert!(err.to_string().contains("No plan found"));
    }

    #[tokio::test]
    async fn test_new_plan_supersedes_pending_plan() {
        let h = harness();
        h.generator.push_text(PLAN).push_text("## Steps\n1. Only step\n");
        h.engine.plan("s1", "Create a todo app", Framework::NextJs).await.unwrap();
        h.engine.plan("s1", "Make it a notes app", Framework::NextJs).await.unwrap();

        let pending = h.store.get_pending_plan("s1").await.unwrap().unwrap();
        assert_eq!(pending.request, "Make it a notes app");
        assert_eq!(pending.steps, vec!["Only step"]);
    }

    #[tokio::test]
    async fn test_approve_runs_steps_and_completes_with_preview() {
        let h = harness();
        h.generator.push_text(PLAN);
        h.engine.plan("s1", "Create a todo app", Framework::NextJs).await.unwrap();
        h.generator
            .push(Generation {
                text: "Added TodoItem".into(),
                tool_calls: vec![ToolCall {
                    name: "Write".into(),
                    input: serde_json::json!({"file_path": "components/TodoItem.tsx"}),
                }],
            })
            .push_text("Added TodoList")
            .push_text("Wired page");

        let text = h.engine.approve_and_code("s1").await.unwrap();
        assert!(text.contains("Added TodoItem"));
        assert!(text.contains("Wired page"));
        assert_eq!(h.engine.phase("s1").await.unwrap(), Phase::Complete);
        assert!(h.engine.pool().status("s1").is_some());

        let plan = h.store.get_plan("s1").await.unwrap().unwrap();
        assert!(plan.approved);
        assert!(h.store.get_pending_plan("s1").await.unwrap().is_none());
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_plan_stream_ends_with_single_complete() {
        let h = harness();
        h.generator.push_text(PLAN);
        let events = h
            .engine
            .plan_stream("s1", "Create a todo app", Framework::NextJs)
            .collect()
            .await;

        assert!(matches!(events.first(), Some(StudioEvent::Status { .. })));
        match events.last() {
            Some(StudioEvent::Complete { content, phase }) => {
                assert_eq!(content.trim(), PLAN.trim());
                assert_eq!(*phase, Some(Phase::AwaitingApproval));
            }
            other => panic!("Expected complete, got {:?}", other),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_approval_while_awaiting() {
        let h = harness();
        h.generator.push_text(PLAN);
        h.engine.plan("s1", "Create a todo app", Framework::NextJs).await.unwrap();

        let events = h
            .engine
            .dispatch("s1", "Looks good, build it", Framework::NextJs)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(events.iter().any(|e| matches!(
            e,
            StudioEvent::Status { message } if message.starts_with("Plan approved")
        )));
        assert!(matches!(events.last(), Some(StudioEvent::Complete { .. })));
        // One planner request plus three steps; the message did not start a new plan.
        assert_eq!(h.generator.requests().len(), 4);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_plans_when_idle() {
        let h = harness();
        h.generator.push_text(PLAN);
        let outcome = h
            .engine
            .dispatch("s1", "Create a todo app", Framework::NextJs)
            .await
            .unwrap()
            .outcome()
            .await;
        assert!(matches!(
            outcome,
            Some(StudioEvent::Complete { phase: Some(Phase::AwaitingApproval), .. })
        ));
    }

    #[tokio::test]
    async fn test_fast_mode_emits_changes_and_completes() {
        let h = harness();
        h.generator.push(Generation {
            text: "Built the page".into(),
            tool_calls: vec![ToolCall {
                name: "Write".into(),
                input: serde_json::json!({"file_path": "app/page.tsx"}),
            }],
        });

        let events = h
            .engine
            .fast_mode("s1", "Add a header", Framework::NextJs)
            .collect()
            .await;
        assert!(events.iter().any(|e| matches!(
            e,
            StudioEvent::Changes { files } if files == &vec!["app/page.tsx".to_string()]
        )));
        assert!(events.iter().any(|e| matches!(e, StudioEvent::Chunk { .. })));
        assert!(matches!(events.last(), Some(StudioEvent::Complete { .. })));
        assert_eq!(h.engine.phase("s1").await.unwrap(), Phase::Complete);
        assert!(h.generator.requests()[0].tools.is_some());
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_fast_mode_refused_while_plan_awaits_approval() {
        let h = harness();
        h.generator.push_text(PLAN);
        h.engine.plan("s1", "Create a todo app", Framework::NextJs).await.unwrap();

        let outcome = h
            .engine
            .fast_mode("s1", "Just do it", Framework::NextJs)
            .outcome()
            .await;
        assert!(matches!(outcome, Some(StudioEvent::Error { .. })));
        assert_eq!(h.engine.phase("s1").await.unwrap(), Phase::AwaitingApproval);
    }

    #[tokio::test]
    async fn test_generation_failure_is_terminal_error_without_reset() {
        let h = harness();
        h.generator
            .push_error(crate::errors::GenerationError::Provider("model unavailable".into()));
        let outcome = h
            .engine
            .plan_stream("s1", "Create a todo app", Framework::NextJs)
            .outcome()
            .await;
        match outcome {
            Some(StudioEvent::Error { message }) => assert!(message.contains("model unavailable")),
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(h.engine.phase("s1").await.unwrap(), Phase::Planning);
    }

    #[tokio::test]
    async fn test_repair_without_project_is_error_event() {
        let h = harness();
        let outcome = h.engine.repair("ghost", Framework::NextJs).outcome().await;
        match outcome {
            Some(StudioEvent::Error { message }) => assert!(message.contains("does not exist")),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repair_feeds_build_errors_to_one_generation() {
        let h = harness_with_build("echo 'app/page.tsx(3,7): error TS2304: Cannot find name foo.'; exit 1");
        // Materialize the workspace through a fast run; its background
        // verification also sees the failing build and repairs once.
        h.generator.push_text("scaffolded");
        let _ = h.engine.fast_mode("s1", "scaffold", Framework::NextJs).outcome().await;
        h.engine.supervisor().join_all().await;
        let requests_before = h.generator.requests().len();
        h.generator.push_text("Declared foo");

        let events = h.engine.repair("s1", Framework::NextJs).collect().await;
        let requests = h.generator.requests();
        let repair_request = &requests[requests_before];
        assert!(repair_request.messages[0].content.contains("TS2304"));
        assert!(repair_request.tools.is_some());
        match events.last() {
            Some(StudioEvent::Complete { content, .. }) => assert!(content.contains("remain")),
            other => panic!("Expected complete, got {:?}", other),
        }
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_verification_and_repair_never_overlap() {
        let generator = Arc::new(OverlapGenerator::default());
        let (_dir, engine) = build_engine(
            "echo 'app/page.tsx(3,7): error TS2304: Cannot find name foo.'; exit 1",
            generator.clone(),
            Arc::new(MemoryStore::new()),
        );

        let outcome = engine.fast_mode("s1", "scaffold", Framework::NextJs).outcome().await;
        assert!(matches!(outcome, Some(StudioEvent::Complete { .. })));
        // Verification was spawned by the fast run and is still pending.
        let outcome = engine.repair("s1", Framework::NextJs).outcome().await;
        assert!(matches!(outcome, Some(StudioEvent::Complete { .. })));
        engine.supervisor().join_all().await;

        // Fast run, automatic repair, explicit repair.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        assert_eq!(generator.peak.load(Ordering::SeqCst), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_repair_with_clean_build_reports_no_errors() {
        let h = harness();
        let _ = h.engine.fast_mode("s1", "scaffold", Framework::NextJs).outcome().await;
        h.engine.supervisor().join_all().await;
        let before = h.generator.requests().len();

        let outcome = h.engine.repair("s1", Framework::NextJs).outcome().await;
        assert!(matches!(
            outcome,
            Some(StudioEvent::Complete { ref content, .. }) if content == "No errors found"
        ));
        assert_eq!(h.generator.requests().len(), before);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_errors_are_deduplicated() {
        let h = harness();
        let report = RuntimeReport {
            message: "todos.map is not a function".into(),
            ..Default::default()
        };
        assert!(h.engine.ingest_runtime_error("s1", &report).unwrap());
        assert!(!h.engine.ingest_runtime_error("s1", &report).unwrap());
        assert_eq!(h.engine.runtime_errors("s1").len(), 1);
        assert!(h.engine.ingest_runtime_error("../etc", &report).is_err());
    }

    #[tokio::test]
    async fn test_invalid_session_id_rejected() {
        let h = harness();
        let err = h.engine.plan("../escape", "x", Framework::NextJs).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Workspace(_)));
    }
}
