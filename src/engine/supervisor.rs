use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinSet;
use tracing::{debug, error};

/// Owns detached background work (verification passes, streamed entry
/// points). Failures and panics are logged and never reach the caller.
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut tasks = self.lock();
        reap(&mut tasks);
        tasks.spawn(async move {
            match task.await {
                Ok(()) => debug!(task = name, "background task finished"),
                Err(e) => error!(task = name, error = %format!("{:#}", e), "background task failed"),
            }
        });
    }

    /// Tasks spawned and not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for everything currently running to finish.
    pub async fn join_all(&self) {
        let mut tasks = std::mem::take(&mut *self.lock());
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
    }

    /// Abort everything still running.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.lock());
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join(result);
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        error!(error = %e, "background task panicked");
    }
}
