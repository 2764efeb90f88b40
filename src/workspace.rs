//! Workspace capability: file and shell access scoped to one session directory.
//!
//! Every path handed to a [`Workspace`] is resolved lexically against the
//! session root; anything that would escape it is rejected with
//! [`WorkspaceError::PathTraversal`] before the filesystem is touched.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::WorkspaceError;
use crate::preview::Framework;

/// Directories never listed or offered to the model as context.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", ".next", "dist", "build", ".turbo"];

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

#[async_trait]
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;
    async fn list_files(&self) -> Result<Vec<String>, WorkspaceError>;
    async fn read_file(&self, path: &str) -> Result<String, WorkspaceError>;
    async fn write_file(&self, path: &str, content: &str) -> Result<(), WorkspaceError>;
    async fn edit_file(&self, path: &str, search: &str, replace: &str)
    -> Result<(), WorkspaceError>;
    async fn delete_file(&self, path: &str) -> Result<(), WorkspaceError>;
    async fn run_command(&self, command: &str) -> Result<CommandOutput, WorkspaceError>;
}

/// Checks that a session id is safe to use as a directory name.
pub fn validate_session_id(id: &str) -> Result<(), WorkspaceError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidSessionId(id.to_string()))
    }
}

/// Hands out [`LocalWorkspace`]s rooted under one directory.
#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    commands: Arc<Semaphore>,
    command_timeout: Duration,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, max_concurrent_commands: usize, command_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            commands: Arc::new(Semaphore::new(max_concurrent_commands.max(1))),
            command_timeout,
        }
    }

    pub fn session_dir(&self, session: &str) -> Result<PathBuf, WorkspaceError> {
        validate_session_id(session)?;
        Ok(self.root.join(session))
    }

    pub fn exists(&self, session: &str) -> bool {
        self.session_dir(session).map(|d| d.is_dir()).unwrap_or(false)
    }

    /// Open an existing session workspace.
    pub fn open(&self, session: &str) -> Result<LocalWorkspace, WorkspaceError> {
        let dir = self.session_dir(session)?;
        if !dir.is_dir() {
            return Err(WorkspaceError::MissingProject {
                session: session.to_string(),
            });
        }
        Ok(self.workspace(dir))
    }

    /// Open the session workspace, creating and scaffolding it first if absent.
    pub async fn ensure(
        &self,
        session: &str,
        framework: Framework,
    ) -> Result<LocalWorkspace, WorkspaceError> {
        let dir = self.session_dir(session)?;
        if !dir.is_dir() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| WorkspaceError::Io {
                    path: dir.clone(),
                    source,
                })?;
            info!(session, framework = %framework, "materialized workspace");
        }
        let workspace = self.workspace(dir);
        let manifest = framework.profile().manifest;
        if !workspace.root().join(&manifest).exists() {
            workspace
                .write_file(&manifest, &framework.scaffold_manifest(session))
                .await?;
        }
        Ok(workspace)
    }

    fn workspace(&self, root: PathBuf) -> LocalWorkspace {
        LocalWorkspace {
            root,
            commands: Arc::clone(&self.commands),
            command_timeout: self.command_timeout,
        }
    }
}

/// A session directory on the local filesystem.
#[derive(Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
    commands: Arc<Semaphore>,
    command_timeout: Duration,
}

impl LocalWorkspace {
    /// Resolve `path` inside the root without touching the filesystem.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, WorkspaceError> {
        let candidate = Path::new(path);
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root)
                .map_err(|_| WorkspaceError::PathTraversal {
                    path: path.to_string(),
                })?
        } else {
            candidate
        };

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir if depth > 0 => {
                    resolved.pop();
                    depth -= 1;
                }
                _ => {
                    return Err(WorkspaceError::PathTraversal {
                        path: path.to_string(),
                    });
                }
            }
        }
        if depth == 0 {
            return Err(WorkspaceError::PathTraversal {
                path: path.to_string(),
            });
        }
        Ok(resolved)
    }

    fn io_error(path: &Path, source: std::io::Error) -> WorkspaceError {
        if source.kind() == std::io::ErrorKind::NotFound {
            WorkspaceError::MissingFile {
                path: path.display().to_string(),
            }
        } else {
            WorkspaceError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn list_files(&self) -> Result<Vec<String>, WorkspaceError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut files: Vec<String> = WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| {
                    !(e.file_type().is_dir()
                        && IGNORED_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
                })
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| {
                    e.path()
                        .strip_prefix(&root)
                        .ok()
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                })
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|e| WorkspaceError::Io {
            path: self.root.clone(),
            source: std::io::Error::other(e),
        })?;
        Ok(files)
    }

    async fn read_file(&self, path: &str) -> Result<String, WorkspaceError> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| Self::io_error(Path::new(path), e))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), WorkspaceError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_error(parent, e))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| Self::io_error(Path::new(path), e))
    }

    async fn edit_file(
        &self,
        path: &str,
        search: &str,
        replace: &str,
    ) -> Result<(), WorkspaceError> {
        let current = self.read_file(path).await?;
        if !current.contains(search) {
            return Err(WorkspaceError::SearchNotFound {
                path: path.to_string(),
            });
        }
        let updated = current.replacen(search, replace, 1);
        self.write_file(path, &updated).await
    }

    async fn delete_file(&self, path: &str) -> Result<(), WorkspaceError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| Self::io_error(Path::new(path), e))
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, WorkspaceError> {
        let _permit = self
            .commands
            .acquire()
            .await
            .map_err(|e| WorkspaceError::Io {
                path: self.root.clone(),
                source: std::io::Error::other(e),
            })?;
        debug!(root = %self.root.display(), command, "running workspace command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkspaceError::Io {
                path: self.root.clone(),
                source,
            })?;

        match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(source)) => Err(WorkspaceError::Io {
                path: self.root.clone(),
                source,
            }),
            Err(_) => Err(WorkspaceError::CommandTimeout {
                command: command.to_string(),
                secs: self.command_timeout.as_secs(),
            }),
        }
    }
}
