//! Durable chat/plan persistence, keyed by session id.
//!
//! The engine only talks to [`SessionStore`]. Two implementations ship with
//! the crate: [`MemoryStore`] for tests and embedding, and [`FileStore`],
//! which keeps one JSON document per session under a directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::preview::Framework;

use super::{Message, Phase, Plan, Session};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The latest plan for the session, pending or approved.
    async fn get_plan(&self, session: &str) -> Result<Option<Plan>>;

    /// Store `plan`, superseding whatever plan the session had.
    async fn set_plan(&self, session: &str, plan: Plan) -> Result<()>;

    /// Mark the pending plan approved and return it. `None` when nothing is pending.
    async fn approve_plan(&self, session: &str) -> Result<Option<Plan>>;

    async fn get_history(&self, session: &str) -> Result<Vec<Message>>;
    async fn add_message(&self, session: &str, message: Message) -> Result<()>;

    async fn get_phase(&self, session: &str) -> Result<Phase>;
    async fn set_phase(&self, session: &str, phase: Phase) -> Result<()>;

    async fn get_framework(&self, session: &str) -> Result<Option<Framework>>;
    async fn set_framework(&self, session: &str, framework: Framework) -> Result<()>;

    async fn get_pending_plan(&self, session: &str) -> Result<Option<Plan>> {
        Ok(self.get_plan(session).await?.filter(Plan::is_pending))
    }
}

/// Approve the pending plan in place, if there is one.
fn approve(session: &mut Session) -> Option<Plan> {
    match session.plan.as_mut() {
        Some(plan) if plan.is_pending() => {
            plan.approved = true;
            Some(plan.clone())
        }
        _ => None,
    }
}

/// In-process store. Sessions are created lazily on first write.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, id: &str, f: impl FnOnce(Option<&Session>) -> R) -> Result<R> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Session store lock poisoned: {}", e))?;
        Ok(f(sessions.get(id)))
    }

    fn write<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Session store lock poisoned: {}", e))?;
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id));
        Ok(f(session))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_plan(&self, session: &str) -> Result<Option<Plan>> {
        self.read(session, |s| s.and_then(|s| s.plan.clone()))
    }

    async fn set_plan(&self, session: &str, plan: Plan) -> Result<()> {
        self.write(session, |s| s.plan = Some(plan))
    }

    async fn approve_plan(&self, session: &str) -> Result<Option<Plan>> {
        self.write(session, approve)
    }

    async fn get_history(&self, session: &str) -> Result<Vec<Message>> {
        self.read(session, |s| s.map(|s| s.history.clone()).unwrap_or_default())
    }

    async fn add_message(&self, session: &str, message: Message) -> Result<()> {
        self.write(session, |s| s.history.push(message))
    }

    async fn get_phase(&self, session: &str) -> Result<Phase> {
        self.read(session, |s| s.map(|s| s.phase).unwrap_or_default())
    }

    async fn set_phase(&self, session: &str, phase: Phase) -> Result<()> {
        self.write(session, |s| s.phase = phase)
    }

    async fn get_framework(&self, session: &str) -> Result<Option<Framework>> {
        self.read(session, |s| s.and_then(|s| s.framework))
    }

    async fn set_framework(&self, session: &str, framework: Framework) -> Result<()> {
        self.write(session, |s| s.framework = Some(framework))
    }
}

/// One `<id>.json` document per session.
pub struct FileStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles across all sessions.
    lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create session directory {}", dir.display()))?;
        Ok(Self {
            dir,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn load(&self, id: &str) -> Result<Session> {
        load_session(&self.path(id), id).await
    }

    async fn modify<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R> {
        let _guard = self.lock.lock().await;
        let path = self.path(id);
        let mut session = load_session(&path, id).await?;
        let out = f(&mut session);
        let json = serde_json::to_string_pretty(&session).context("Failed to serialize session")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(out)
    }
}

async fn load_session(path: &Path, id: &str) -> Result<Session> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Session::new(id)),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn get_plan(&self, session: &str) -> Result<Option<Plan>> {
        Ok(self.load(session).await?.plan)
    }

    async fn set_plan(&self, session: &str, plan: Plan) -> Result<()> {
        self.modify(session, |s| s.plan = Some(plan)).await
    }

    async fn approve_plan(&self, session: &str) -> Result<Option<Plan>> {
        self.modify(session, approve).await
    }

    async fn get_history(&self, session: &str) -> Result<Vec<Message>> {
        Ok(self.load(session).await?.history)
    }

    async fn add_message(&self, session: &str, message: Message) -> Result<()> {
        self.modify(session, |s| s.history.push(message)).await
    }

    async fn get_phase(&self, session: &str) -> Result<Phase> {
        Ok(self.load(session).await?.phase)
    }

    async fn set_phase(&self, session: &str, phase: Phase) -> Result<()> {
        self.modify(session, |s| s.phase = phase).await
    }

    async fn get_framework(&self, session: &str) -> Result<Option<Framework>> {
        Ok(self.load(session).await?.framework)
    }

    async fn set_framework(&self, session: &str, framework: Framework) -> Result<()> {
        self.modify(session, |s| s.framework = Some(framework)).await
    }
}
