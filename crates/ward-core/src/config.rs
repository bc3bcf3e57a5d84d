use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Control protocol limits
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024; // configure payloads carry a whole job set
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // drop clients that stall mid-exchange
pub const SOCKET_NAME: &str = "scheduler.sock";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level agent config (ward.toml + WARD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Repositories addressable by name from scheduler jobs.
    #[serde(default)]
    pub repositories: HashMap<String, RepositoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Unix socket the control plane listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding the task report history.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// External backup program driven by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the repository arguments on every call.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable the repository passphrase is handed over in.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            passphrase_env: default_passphrase_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Storage location, e.g. `/var/backups/repo` or `s3://bucket/repo`.
    pub location: String,
    pub passphrase: Option<String>,
}

fn default_home() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}
fn default_socket_path() -> String {
    format!("{}/.ward/{}", default_home(), SOCKET_NAME)
}
fn default_log_filter() -> String {
    "ward_agent=info,ward_scheduler=info".to_string()
}
fn default_db_path() -> String {
    format!("{}/.ward/reports.db", default_home())
}
fn default_program() -> String {
    "plakar".to_string()
}
fn default_passphrase_env() -> String {
    "PLAKAR_PASSPHRASE".to_string()
}

impl AgentConfig {
    /// Load config from a TOML file with WARD_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.ward/ward.toml
    ///
    /// Nested keys use a double underscore: `WARD_AGENT__SOCKET_PATH`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading agent configuration");

        let config: AgentConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WARD_").split("__"))
            .extract()
            .map_err(|e| crate::error::WardError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Look up a repository by name.
    pub fn repository(&self, name: &str) -> crate::error::Result<&RepositoryConfig> {
        self.repositories
            .get(name)
            .ok_or_else(|| crate::error::WardError::UnknownRepository {
                name: name.to_string(),
            })
    }
}

pub fn default_config_path() -> String {
    format!("{}/.ward/ward.toml", default_home())
}
