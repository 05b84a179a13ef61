//! Configuration (layered: env > config file > defaults).
//!
//! The server catalog uses the widely shared `mcpServers` layout:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": { "command": "npx", "args": ["-y", "@mcp/files"], "env": {} },
//!     "search": { "url": "http://127.0.0.1:9000/mcp", "enabled": false }
//!   },
//!   "hub": { "call_timeout_ms": 10000 }
//! }
//! ```
//!
//! A `.toml` file with the same shape is accepted too.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::ConnectionSettings;
use crate::error::{HubError, Result};
use crate::registry::{ServerEndpoint, ServerRegistry, ServerSpec};

pub const DEFAULT_CONFIG_FILE: &str = "mcp_config.json";
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Claude, a helpful AI assistant with access to tools from connected MCP servers.";

/// Tunables, read from the optional `hub` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub call_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Zero disables demotion.
    pub timeout_demotion_threshold: u32,
    pub max_tool_rounds: usize,
    pub model_timeout_ms: u64,
    pub refresh_interval_secs: Option<u64>,
    pub bind: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Answer servers' `sampling/createMessage` requests with the model.
    pub serve_sampling: bool,
    /// Conversations kept before the least recently used is evicted.
    pub max_conversations: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            handshake_timeout_ms: 30_000,
            timeout_demotion_threshold: 3,
            max_tool_rounds: 10,
            model_timeout_ms: 120_000,
            refresh_interval_secs: None,
            bind: "127.0.0.1:8000".to_string(),
            model: "claude-3-7-sonnet-20250219".to_string(),
            max_tokens: 4096,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            serve_sampling: true,
            max_conversations: 256,
        }
    }
}

impl HubSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            timeout_demotion_threshold: self.timeout_demotion_threshold,
        }
    }
}

/// Fully resolved hub configuration.
#[derive(Clone, Default)]
pub struct HubConfig {
    /// Enabled servers, in file order.
    pub servers: Vec<ServerSpec>,
    pub settings: HubSettings,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: Option<String>,
    /// File the catalog was read from, if any.
    pub source: Option<PathBuf>,
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("servers", &self.servers)
            .field("settings", &self.settings)
            .field(
                "anthropic_api_key",
                &self.anthropic_api_key.as_ref().map(|_| "***"),
            )
            .field("anthropic_base_url", &self.anthropic_base_url)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    hub: HubSettings,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ServerEntry {
    fn into_spec(self, name: &str) -> Result<ServerSpec> {
        let endpoint = match (self.command, self.url) {
            (Some(command), None) => ServerEndpoint::Stdio {
                command,
                args: self.args,
                env: self.env.unwrap_or_default(),
            },
            (None, Some(url)) => ServerEndpoint::StreamableHttp { url },
            (Some(_), Some(_)) => {
                return Err(HubError::Configuration(format!(
                    "server '{name}' sets both 'command' and 'url'"
                )))
            }
            (None, None) => {
                return Err(HubError::Configuration(format!(
                    "server '{name}' needs either 'command' or 'url'"
                )))
            }
        };
        Ok(ServerSpec {
            id: name.to_string(),
            endpoint,
        })
    }
}

impl HubConfig {
    /// Parse a catalog file's contents. `toml` selects the TOML syntax.
    pub fn parse(contents: &str, toml: bool) -> Result<Self> {
        let file: ConfigFile = if toml {
            toml::from_str(contents)?
        } else {
            serde_json::from_str(contents)
                .map_err(|e| HubError::Configuration(format!("invalid JSON config: {e}")))?
        };

        let mut servers = Vec::new();
        for (name, raw) in file.mcp_servers {
            let entry: ServerEntry = serde_json::from_value(raw).map_err(|e| {
                HubError::Configuration(format!("invalid entry for server '{name}': {e}"))
            })?;
            if !entry.enabled {
                debug!(server = %name, "skipping disabled server");
                continue;
            }
            servers.push(entry.into_spec(&name)?);
        }

        Ok(Self {
            servers,
            settings: file.hub,
            ..Self::default()
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HubError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        let mut config = Self::parse(&contents, is_toml)?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load `.env`, read the catalog file, then apply environment overrides.
    ///
    /// With no explicit path and no file found, the hub starts with an
    /// empty catalog.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error

        let env_path = std::env::var_os("MCP_HUB_CONFIG").map(PathBuf::from);
        let mut config = match resolve_path(explicit, env_path) {
            Some(path) => Self::from_file(&path)?,
            None => {
                info!("no config file found, starting with no servers");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        info!(
            servers = config.servers.len(),
            source = ?config.source,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(key);
        }
        if let Some(url) = non_empty("ANTHROPIC_BASE_URL") {
            self.anthropic_base_url = Some(url);
        }
        if let Some(model) = non_empty("MCP_HUB_MODEL") {
            self.settings.model = model;
        }
        if let Some(bind) = non_empty("MCP_HUB_BIND") {
            self.settings.bind = bind;
        }
    }

    pub fn registry(&self) -> Result<ServerRegistry> {
        ServerRegistry::from_specs(self.servers.iter().cloned())
    }
}

/// Explicit path, then `MCP_HUB_CONFIG`, then `./mcp_config.json`, then
/// `~/.mcp-hub/mcp_config.json`. Only the explicit and env paths are
/// returned without checking that they exist.
fn resolve_path(explicit: Option<&Path>, env_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_path {
        return Some(path);
    }
    [PathBuf::from(DEFAULT_CONFIG_FILE), default_hub_dir().join(DEFAULT_CONFIG_FILE)]
        .into_iter()
        .find(|candidate| candidate.is_file())
}

fn default_hub_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".mcp-hub"))
        .unwrap_or_else(|| PathBuf::from(".mcp-hub"))
}
