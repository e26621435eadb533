use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::Error;

fn default_session_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_sweep_interval() -> u64 {
    3_600 // 1 hour
}

fn default_task_timeout() -> u64 {
    3_600 // 1 hour
}

fn default_render_interval_ms() -> u64 {
    1_000
}

fn default_max_artifact_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("cardbridge")
}

fn default_agent_command() -> String {
    "claude".into()
}

/// Top-level configuration loaded from `cardbridge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Session, task and delivery settings for the bridge core.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    /// Workspace assigned to newly created contexts. Without one, every
    /// chat must `/cd` before its first task.
    #[serde(default)]
    pub default_workspace: Option<PathBuf>,

    /// Seconds a context may sit unused before the sweep evicts it. Defaults to 86400 (24h).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,

    /// Period of the eviction sweep. Defaults to 3600 (1h).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// Hard ceiling on a single agent task. Defaults to 3600 (1h).
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,

    /// Minimum spacing between intermediate card updates. Defaults to 1000.
    #[serde(default = "default_render_interval_ms")]
    pub render_interval_ms: u64,

    /// Largest output artifact the platform accepts. Defaults to 10 MiB.
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: u64,

    /// Where downloaded input images are staged for the agent.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            default_workspace: None,
            session_ttl_seconds: default_session_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
            task_timeout_seconds: default_task_timeout(),
            render_interval_ms: default_render_interval_ms(),
            max_artifact_bytes: default_max_artifact_bytes(),
            scratch_dir: default_scratch_dir(),
        }
    }
}

impl BridgeSection {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms)
    }
}

/// How the agent CLI is launched.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Executable to spawn. Defaults to `claude`.
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Arguments appended after the built-in streaming flags.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Passed as `--model` when set.
    #[serde(default)]
    pub model: Option<String>,

    /// Passed as `--permission-mode` when set (e.g. `"acceptEdits"`).
    #[serde(default)]
    pub permission_mode: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            extra_args: Vec::new(),
            model: None,
            permission_mode: None,
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML string into a `BridgeConfig`.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<(), Error> {
        let bridge = &self.bridge;
        for (name, value) in [
            ("bridge.session_ttl_seconds", bridge.session_ttl_seconds),
            ("bridge.sweep_interval_seconds", bridge.sweep_interval_seconds),
            ("bridge.task_timeout_seconds", bridge.task_timeout_seconds),
            ("bridge.render_interval_ms", bridge.render_interval_ms),
            ("bridge.max_artifact_bytes", bridge.max_artifact_bytes),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be at least 1")));
            }
        }
        if self.agent.command.trim().is_empty() {
            return Err(Error::Config("agent.command must not be empty".into()));
        }
        if let Some(workspace) = &bridge.default_workspace
            && !workspace.is_absolute()
        {
            return Err(Error::Config(format!(
                "bridge.default_workspace must be an absolute path, got {}",
                workspace.display()
            )));
        }
        Ok(())
    }
}
