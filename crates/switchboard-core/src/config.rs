use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (switchboard.toml + SWITCHBOARD_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            cli: CliConfig::default(),
            timeouts: TimeoutConfig::default(),
            sessions: SessionsConfig::default(),
            deploy: DeployConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// The external assistant CLI that executes every turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to (or name of) the CLI binary.
    #[serde(default = "default_cli_command")]
    pub command: String,
    /// Working directory the CLI runs in. Distinct from `config_dir` - the
    /// CLI slugifies this path to locate its per-project session store.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
    /// The CLI's own config/auth directory holding `projects/<slug>/*.jsonl`.
    #[serde(default = "default_cli_config_dir")]
    pub config_dir: String,
    /// Model passed when the client's request does not name one.
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            command: default_cli_command(),
            workspace_dir: default_workspace_dir(),
            config_dir: default_cli_config_dir(),
            model: default_model(),
        }
    }
}

/// Idle-watchdog thresholds, by CLI phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Baseline inactivity window while the CLI is producing text.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    /// Extended window while a tool is executing.
    #[serde(default = "default_tool_secs")]
    pub tool_secs: u64,
    /// Extended window during context compaction.
    #[serde(default = "default_compact_secs")]
    pub compact_secs: u64,
    /// Window after spawn in which an exit counts as an immediate failure.
    #[serde(default = "default_spawn_probe_secs")]
    pub spawn_probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
            tool_secs: default_tool_secs(),
            compact_secs: default_compact_secs(),
            spawn_probe_secs: default_spawn_probe_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionsConfig {
    /// SQLite file for registry persistence. Memory-only when unset.
    pub store_path: Option<String>,
    /// Evict registry entries unused for this many seconds. Off when unset.
    pub ttl_secs: Option<u64>,
    /// JSON file mapping extracted identities to canonical aliases.
    pub alias_map_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeployConfig {
    /// HMAC-SHA256 secret for the GitHub push webhook. 401 on all requests
    /// when unset.
    pub secret: Option<String>,
    /// Update script launched (detached) on push-to-main. A default script
    /// is written to the temp dir when unset.
    pub update_script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// SSE comment keepalive cadence. 0 disables.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_cli_command() -> String {
    "claude".to_string()
}
fn default_workspace_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/switchboard-workspace", home)
}
fn default_cli_config_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.claude", home)
}
fn default_model() -> String {
    "sonnet".to_string()
}
fn default_idle_secs() -> u64 {
    60
}
fn default_tool_secs() -> u64 {
    300
}
fn default_compact_secs() -> u64 {
    600
}
fn default_spawn_probe_secs() -> u64 {
    3
}
fn default_keepalive_secs() -> u64 {
    15
}

impl SwitchboardConfig {
    /// Load config from a TOML file with SWITCHBOARD_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.switchboard/switchboard.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SwitchboardConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SWITCHBOARD_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.switchboard/switchboard.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SwitchboardConfig::default();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.timeouts.idle_secs, 60);
        assert_eq!(cfg.timeouts.tool_secs, 300);
        assert_eq!(cfg.timeouts.compact_secs, 600);
        assert!(cfg.sessions.ttl_secs.is_none());
        assert!(cfg.deploy.secret.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: SwitchboardConfig = Figment::new()
            .merge(Toml::string("[gateway]\nport = 9900\n"))
            .extract()
            .unwrap();
        assert_eq!(cfg.gateway.port, 9900);
        assert_eq!(cfg.gateway.bind, DEFAULT_BIND);
        assert_eq!(cfg.cli.model, "sonnet");
    }
}
