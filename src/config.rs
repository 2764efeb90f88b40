//! Studio configuration read from `.studio/studio.toml`.
//!
//! Layered: defaults → file → environment → CLI flags.
//!
//! ```toml
//! [generation]
//! claude_cmd = "claude"
//! max_retries = 3
//! retry_backoff_ms = 1000
//!
//! [workspace]
//! root = ".studio/workspaces"
//! command_timeout_secs = 300
//! max_concurrent_commands = 4
//!
//! [preview]
//! max_processes = 5
//! base_port = 3100
//! port_window = 100
//! ready_timeout_secs = 30
//! stop_grace_secs = 5
//! idle_timeout_secs = 1800
//! sweep_interval_secs = 300
//!
//! [preview.frameworks.vite]
//! dev = "exec npx vite --port {port}"
//!
//! [diagnostics]
//! runtime_capacity = 50
//! settle_ms = 2000
//!
//! [logging]
//! json = false
//! file = false
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::preview::{Framework, PoolConfig, ProfileOverride, Profiles};

pub const STUDIO_DIR: &str = ".studio";
pub const CONFIG_FILE: &str = "studio.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    /// Claude CLI binary. `CLAUDE_CMD` overrides it.
    pub claude_cmd: String,
    /// Retries after a rate-limited response
    pub max_retries: u32,
    /// Base of the linear backoff between retries
    pub retry_backoff_ms: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            claude_cmd: "claude".to_string(),
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSection {
    /// Parent of all session directories, relative to the project dir.
    /// `STUDIO_WORKSPACES` overrides it.
    pub root: PathBuf,
    pub command_timeout_secs: u64,
    pub max_concurrent_commands: usize,
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from(STUDIO_DIR).join("workspaces"),
            command_timeout_secs: 300,
            max_concurrent_commands: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSection {
    pub max_processes: usize,
    pub base_port: u16,
    pub port_window: u16,
    pub ready_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-framework command overrides keyed by framework name
    pub frameworks: HashMap<String, ProfileOverride>,
}

impl Default for PreviewSection {
    fn default() -> Self {
        Self {
            max_processes: 5,
            base_port: 3100,
            port_window: 100,
            ready_timeout_secs: 30,
            stop_grace_secs: 5,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 300,
            frameworks: HashMap::new(),
        }
    }
}

impl PreviewSection {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_processes: self.max_processes,
            base_port: self.base_port,
            port_window: self.port_window,
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }

    /// Unknown framework names are skipped; `validate` reports them.
    pub fn profiles(&self) -> Profiles {
        let overrides = self
            .frameworks
            .iter()
            .filter_map(|(name, o)| name.parse::<Framework>().ok().map(|f| (f, o.clone())))
            .collect();
        Profiles::new(overrides)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    /// Runtime errors buffered per session
    pub runtime_capacity: usize,
    /// Delay before background verification rebuilds
    pub settle_ms: u64,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            runtime_capacity: 50,
            settle_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub json: bool,
    /// Also write daily-rotated logs under `.studio/logs`
    pub file: bool,
}

/// Contents of `studio.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioToml {
    pub generation: GenerationSection,
    pub workspace: WorkspaceSection,
    pub preview: PreviewSection,
    pub diagnostics: DiagnosticsSection,
    pub logging: LoggingSection,
}

impl StudioToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse studio.toml")
    }

    /// Returns defaults when the file does not exist.
    pub fn load_or_default(studio_dir: &Path) -> Result<Self> {
        let path = studio_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize studio.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(cmd) = env_nonempty("CLAUDE_CMD") {
            self.generation.claude_cmd = cmd;
        }
        if let Some(root) = env_nonempty("STUDIO_WORKSPACES") {
            self.workspace.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.preview.max_processes == 0 {
            warnings.push("preview.max_processes is 0: no preview can ever start".to_string());
        }
        if self.preview.port_window == 0 {
            warnings.push("preview.port_window is 0: port allocation always fails".to_string());
        }
        if u32::from(self.preview.base_port) + u32::from(self.preview.port_window) > u32::from(u16::MAX) {
            warnings.push(format!(
                "preview.base_port {} + port_window {} overflows the port range",
                self.preview.base_port, self.preview.port_window
            ));
        }
        if self.preview.port_window < self.preview.max_processes as u16 {
            warnings.push(format!(
                "preview.port_window {} is smaller than max_processes {}",
                self.preview.port_window, self.preview.max_processes
            ));
        }
        if self.preview.idle_timeout_secs < self.preview.sweep_interval_secs {
            warnings.push(
                "preview.idle_timeout_secs is shorter than sweep_interval_secs; idle previews outlive the threshold"
                    .to_string(),
            );
        }
        if self.workspace.max_concurrent_commands == 0 {
            warnings.push("workspace.max_concurrent_commands is 0; treated as 1".to_string());
        }
        if self.diagnostics.runtime_capacity == 0 {
            warnings.push("diagnostics.runtime_capacity is 0; treated as 1".to_string());
        }
        for (framework, o) in &self.preview.frameworks {
            if framework.parse::<Framework>().is_err() {
                warnings.push(format!(
                    "preview.frameworks.{} is not a known framework (nextjs, vite)",
                    framework
                ));
            }
            if let Some(pattern) = &o.ready_pattern
                && let Err(e) = regex::Regex::new(pattern)
            {
                warnings.push(format!(
                    "preview.frameworks.{}.ready_pattern is not a valid regex: {}",
                    framework, e
                ));
            }
            if let Some(dev) = &o.dev
                && !dev.contains("{port}")
            {
                warnings.push(format!(
                    "preview.frameworks.{}.dev has no {{port}} placeholder; the server may ignore the allocated port",
                    framework
                ));
            }
        }

        warnings
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub project_dir: PathBuf,
    pub studio_dir: PathBuf,
    pub toml: StudioToml,
    pub verbose: bool,
    cli_json_logs: Option<bool>,
}

impl StudioConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&project_dir).with_context(|| {
            format!("Failed to create project directory: {}", project_dir.display())
        })?;
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let studio_dir = project_dir.join(STUDIO_DIR);
        let mut toml = StudioToml::load_or_default(&studio_dir)?;
        toml.apply_env();

        Ok(Self {
            project_dir,
            studio_dir,
            toml,
            verbose: false,
            cli_json_logs: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, json_logs: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_json_logs = json_logs.then_some(true);
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.studio_dir.join(CONFIG_FILE)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        let root = &self.toml.workspace.root;
        if root.is_absolute() {
            root.clone()
        } else {
            self.project_dir.join(root)
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.studio_dir.join("sessions")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.studio_dir.join("logs")
    }

    /// JSON logs (CLI → file).
    pub fn json_logs(&self) -> bool {
        self.cli_json_logs.unwrap_or(self.toml.logging.json)
    }

    pub fn claude_cmd(&self) -> &str {
        &self.toml.generation.claude_cmd
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.workspace.command_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.toml.generation.retry_backoff_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.toml.diagnostics.settle_ms)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
