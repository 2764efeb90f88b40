//! Process Pool Manager: at most one live preview process per session and at
//! most `max_processes` active previews overall.
//!
//! All record bookkeeping happens inside one short critical section on the
//! record map (capacity check, eviction choice, port allocation, insert).
//! Dependency installation, spawning, readiness detection, and termination
//! all run outside it, so one session's slow startup never blocks another's.
//!
//! Lifecycle of a record:
//!
//! ```text
//! installing ──> starting ──> running
//!      │             │           │
//!      └──> error <──┘           └──> idle (process exited unexpectedly)
//! ```
//!
//! Each lifecycle carries a fresh id; background tasks of a lifecycle that has
//! been stopped or replaced find a mismatched id and leave the map alone.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::PreviewError;
use crate::workspace::{LocalWorkspace, Workspace, WorkspaceManager};

use super::framework::{Framework, FrameworkProfile, Profiles};
use super::port::allocate_port;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Idle,
    Installing,
    Starting,
    Running,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    /// Counts against pool capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Installing | Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_processes: usize,
    pub base_port: u16,
    pub port_window: u16,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 5,
            base_port: 3100,
            port_window: 100,
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Returned by [`ProcessPool::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub status: ProcessStatus,
    pub port: u16,
}

/// Point-in-time view of one record.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewStatus {
    pub session: String,
    pub status: ProcessStatus,
    pub port: u16,
    pub framework: Framework,
    pub error: Option<String>,
    pub idle_secs: u64,
}

/// Control channels for a spawned preview process.
struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

struct ProcessRecord {
    lifecycle: Uuid,
    port: u16,
    handle: Option<ProcessHandle>,
    status: ProcessStatus,
    last_activity: Instant,
    error: Option<String>,
    framework: Framework,
}

impl ProcessRecord {
    fn snapshot(&self, session: &str) -> PreviewStatus {
        PreviewStatus {
            session: session.to_string(),
            status: self.status,
            port: self.port,
            framework: self.framework,
            error: self.error.clone(),
            idle_secs: self.last_activity.elapsed().as_secs(),
        }
    }

    fn outcome(&self) -> StartOutcome {
        StartOutcome {
            status: self.status,
            port: self.port,
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    profiles: Profiles,
    workspaces: WorkspaceManager,
    records: Mutex<HashMap<String, ProcessRecord>>,
}

/// Owns every live preview process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub fn new(config: PoolConfig, profiles: Profiles, workspaces: WorkspaceManager) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                profiles,
                workspaces,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Ensure a preview is running (or on its way) for `session`.
    ///
    /// Idempotent for running records and single-flight for records that are
    /// still installing or starting.
    pub async fn start(
        &self,
        session: &str,
        framework: Framework,
    ) -> Result<StartOutcome, PreviewError> {
        let workspace = self.inner.workspaces.open(session)?;
        let profile = self.inner.profiles.get(framework);
        let ready = profile
            .ready_regex()
            .map_err(|e| PreviewError::Spawn(format!("Invalid readiness pattern: {}", e)))?;

        let (outcome, lifecycle, victim) = {
            let mut records = self.inner.lock();
            if let Some(record) = records.get_mut(session) {
                match record.status {
                    ProcessStatus::Running => {
                        record.last_activity = Instant::now();
                        return Ok(record.outcome());
                    }
                    ProcessStatus::Installing | ProcessStatus::Starting => {
                        return Ok(record.outcome());
                    }
                    ProcessStatus::Idle | ProcessStatus::Error => {}
                }
                // A finished lifecycle restarts from scratch.
                records.remove(session);
            }

            let active = records.values().filter(|r| r.status.is_active()).count();
            let victim = if active >= self.inner.config.max_processes {
                let oldest = records
                    .iter()
                    .filter(|(_, r)| r.status == ProcessStatus::Running)
                    .min_by_key(|(_, r)| r.last_activity)
                    .map(|(id, _)| id.clone());
                match oldest {
                    Some(id) => records.remove(&id).map(|r| (id, r)),
                    None => {
                        return Err(PreviewError::AtCapacity {
                            max: self.inner.config.max_processes,
                        });
                    }
                }
            } else {
                None
            };

            let held: HashSet<u16> = records.values().map(|r| r.port).collect();
            let port = allocate_port(
                self.inner.config.base_port,
                self.inner.config.port_window,
                &held,
            )?;
            let lifecycle = Uuid::new_v4();
            let record = ProcessRecord {
                lifecycle,
                port,
                handle: None,
                status: ProcessStatus::Installing,
                last_activity: Instant::now(),
                error: None,
                framework,
            };
            let outcome = record.outcome();
            records.insert(session.to_string(), record);
            (outcome, lifecycle, victim)
        };

        if let Some((victim_id, victim)) = victim {
            info!(session = %victim_id, port = victim.port, "evicting least recently used preview");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.terminate(&victim_id, victim).await });
        }

        info!(session, port = outcome.port, framework = %framework, "starting preview");
        let inner = Arc::clone(&self.inner);
        let session = session.to_string();
        tokio::spawn(async move {
            inner
                .launch(session, lifecycle, outcome.port, profile, ready, workspace)
                .await
        });

        Ok(outcome)
    }

    /// Stop the session's preview. The record is removed whatever the process does.
    pub async fn stop(&self, session: &str) -> bool {
        let record = self.inner.lock().remove(session);
        match record {
            Some(record) => {
                info!(session, port = record.port, "stopping preview");
                self.inner.terminate(session, record).await;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, session: &str) -> Option<PreviewStatus> {
        self.inner.lock().get(session).map(|r| r.snapshot(session))
    }

    pub fn list(&self) -> Vec<PreviewStatus> {
        let records = self.inner.lock();
        let mut all: Vec<_> = records.iter().map(|(id, r)| r.snapshot(id)).collect();
        all.sort_by(|a, b| a.session.cmp(&b.session));
        all
    }

    /// Refresh the activity timestamp. Returns false when there is no record.
    pub fn touch(&self, session: &str) -> bool {
        match self.inner.lock().get_mut(session) {
            Some(record) => {
                record.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Stop every running preview idle for longer than the idle threshold.
    pub async fn sweep_idle(&self) -> Vec<String> {
        // Judged idle and removed under one lock.
        let stale: Vec<(String, ProcessRecord)> = {
            let mut records = self.inner.lock();
            let ids: Vec<String> = records
                .iter()
                .filter(|(_, r)| {
                    r.status == ProcessStatus::Running
                        && r.last_activity.elapsed() > self.inner.config.idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| records.remove(&id).map(|r| (id, r)))
                .collect()
        };
        let mut stopped = Vec::with_capacity(stale.len());
        for (session, record) in stale {
            info!(session = %session, port = record.port, "stopping idle preview");
            self.inner.terminate(&session, record).await;
            stopped.push(session);
        }
        stopped
    }

    /// Periodic idle sweep; the caller owns the handle and aborts it on shutdown.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.inner.config.sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let stopped = pool.sweep_idle().await;
                if !stopped.is_empty() {
                    debug!(count = stopped.len(), "idle sweep stopped previews");
                }
            }
        })
    }

    /// Stop everything. Used when the service shuts down.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ProcessRecord)> = self.inner.lock().drain().collect();
        let stops = drained
            .into_iter()
            .map(|(id, record)| {
                let inner = Arc::clone(&self.inner);
                async move { inner.terminate(&id, record).await }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(stops).await;
    }

    #[cfg(test)]
    fn insert_running(&self, session: &str, port: u16, idle_for: Duration) {
        let last_activity = Instant::now()
            .checked_sub(idle_for)
            .unwrap_or_else(Instant::now);
        self.inner.lock().insert(
            session.to_string(),
            ProcessRecord {
                lifecycle: Uuid::new_v4(),
                port,
                handle: None,
                status: ProcessStatus::Running,
                last_activity,
                error: None,
                framework: Framework::NextJs,
            },
        );
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        // A poisoned map still holds consistent records; every critical section
        // is a handful of field assignments.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to the record if it still belongs to `lifecycle`.
    fn update<R>(
        &self,
        session: &str,
        lifecycle: Uuid,
        f: impl FnOnce(&mut ProcessRecord) -> R,
    ) -> Option<R> {
        let mut records = self.lock();
        records
            .get_mut(session)
            .filter(|r| r.lifecycle == lifecycle)
            .map(f)
    }

    fn mark_error(&self, session: &str, lifecycle: Uuid, message: String) {
        error!(session, error = %message, "preview failed to start");
        self.update(session, lifecycle, |r| {
            r.status = ProcessStatus::Error;
            r.error = Some(message);
            r.handle = None;
        });
    }

    fn mark_ready(&self, session: &str, lifecycle: Uuid, port: u16) {
        let adopted = self.update(session, lifecycle, |r| {
            if r.status != ProcessStatus::Starting {
                return None;
            }
            let requested = r.port;
            r.port = port;
            r.status = ProcessStatus::Running;
            r.last_activity = Instant::now();
            Some(requested)
        });
        if let Some(Some(requested)) = adopted {
            info!(session, port, requested, readiness = "detected", "preview ready");
        }
    }

    fn assume_ready(&self, session: &str, lifecycle: Uuid) {
        let assumed = self.update(session, lifecycle, |r| {
            if r.status != ProcessStatus::Starting {
                return None;
            }
            r.status = ProcessStatus::Running;
            r.last_activity = Instant::now();
            Some(r.port)
        });
        if let Some(Some(port)) = assumed {
            warn!(
                session,
                port,
                readiness = "assumed",
                timeout_secs = self.config.ready_timeout.as_secs(),
                "no readiness signal before timeout; assuming preview is running"
            );
        }
    }

    fn on_exit(&self, session: &str, lifecycle: Uuid, code: Option<i32>) {
        let reverted = self.update(session, lifecycle, |r| {
            r.handle = None;
            if r.status == ProcessStatus::Error {
                return false;
            }
            r.status = ProcessStatus::Idle;
            true
        });
        if reverted == Some(true) {
            warn!(session, exit_code = ?code, "preview process exited unexpectedly");
        }
    }

    async fn launch(
        self: Arc<Self>,
        session: String,
        lifecycle: Uuid,
        port: u16,
        profile: FrameworkProfile,
        ready: regex::Regex,
        workspace: LocalWorkspace,
    ) {
        if !workspace.root().join(&profile.dependency_marker).exists() {
            debug!(session = %session, command = %profile.install, "installing dependencies");
            match workspace.run_command(&profile.install).await {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    let message = format!(
                        "Dependency install failed (exit {:?}): {}",
                        out.exit_code,
                        tail(&out.combined(), 20)
                    );
                    self.mark_error(&session, lifecycle, message);
                    return;
                }
                Err(e) => {
                    self.mark_error(&session, lifecycle, format!("Dependency install failed: {}", e));
                    return;
                }
            }
        }

        let advanced = self.update(&session, lifecycle, |r| {
            r.status = ProcessStatus::Starting;
        });
        if advanced.is_none() {
            debug!(session = %session, "preview stopped during install");
            return;
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(profile.dev_command(port))
            .current_dir(workspace.root())
            .env("PORT", port.to_string())
            .env("BROWSER", "none")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.mark_error(&session, lifecycle, format!("Failed to spawn dev server: {}", e));
                return;
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let attached = self.update(&session, lifecycle, |r| {
            r.handle = Some(ProcessHandle {
                pid: child.id(),
                kill_tx: Some(kill_tx),
                exited: exit_rx,
            });
        });
        if attached.is_none() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return;
        }

        if let Some(stdout) = child.stdout.take() {
            self.watch_output(&session, lifecycle, stdout, ready.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.watch_output(&session, lifecycle, stderr, ready);
        }

        {
            let inner = Arc::clone(&self);
            let session = session.clone();
            let timeout = self.config.ready_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.assume_ready(&session, lifecycle);
            });
        }

        let status = tokio::select! {
            status = child.wait() => status.ok(),
            Ok(()) = kill_rx => {
                kill_group(child.id(), Signal::Kill);
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        let _ = exit_tx.send(true);
        self.on_exit(&session, lifecycle, status.and_then(|s| s.code()));
    }

    fn watch_output<R>(self: &Arc<Self>, session: &str, lifecycle: Uuid, stream: R, ready: regex::Regex)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(self);
        let session = session.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "forge_studio::preview::output", session = %session, "{}", line);
                if let Some(port) = FrameworkProfile::detect_ready_port(&ready, &line) {
                    inner.mark_ready(&session, lifecycle, port);
                }
            }
        });
    }

    /// Graceful signal, then a forced kill once the grace period lapses.
    async fn terminate(&self, session: &str, record: ProcessRecord) {
        let Some(mut handle) = record.handle else {
            return;
        };
        kill_group(handle.pid, Signal::Term);
        let exited = tokio::time::timeout(
            self.config.stop_grace,
            handle.exited.wait_for(|done| *done),
        )
        .await
        .is_ok();
        if !exited {
            warn!(session, pid = ?handle.pid, "preview ignored termination; killing");
            if let Some(tx) = handle.kill_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pid only yields ESRCH.
    unsafe {
        libc::kill(-pid, sig);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>, _signal: Signal) {}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
