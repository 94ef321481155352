//! Startup configuration.
//!
//! Values are read once at startup (TOML file for the binary; embedders
//! construct [`Config`] directly). Nothing here changes at runtime and
//! nothing is persisted.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Process-wide server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP listen port. Port 0 binds an ephemeral port (tests).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server identity, used as the prefix on every server-originated
    /// reply. Falls back to the system hostname when omitted.
    #[serde(default)]
    pub hostname: String,

    /// Path to the MOTD file. Absent → MOTD requests get 422.
    #[serde(default)]
    pub motd: Option<PathBuf>,

    /// When set, clients must send a matching PASS before registration
    /// completes.
    #[serde(default)]
    pub password: Option<String>,

    /// Network name used in the 001 welcome text.
    #[serde(default)]
    pub network_name: Option<String>,

    /// Creation date used in the 003 text.
    #[serde(default)]
    pub network_created_on: Option<String>,
}

fn default_port() -> u16 {
    6667
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: String::new(),
            motd: None,
            password: None,
            network_name: None,
            network_created_on: None,
        }
    }
}

/// Why startup configuration could not be produced. Fatal: the binary
/// exits non-zero on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no hostname configured and none available from the system")]
    NoHostname,
}

impl Config {
    /// Load from a TOML file and resolve the hostname.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        config.resolve_hostname()?;
        Ok(config)
    }

    /// Fill an empty `hostname` from the system, or fail.
    pub fn resolve_hostname(&mut self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            self.hostname = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .filter(|h| !h.is_empty())
                .ok_or(ConfigError::NoHostname)?;
        }
        Ok(())
    }

    /// Network name for the welcome text, defaulting to the hostname.
    pub fn network_name(&self) -> &str {
        self.network_name.as_deref().unwrap_or(&self.hostname)
    }
}
