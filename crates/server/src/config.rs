//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use convoy_common::{Error, Result};

/// convoyd configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen: String,

    /// WebSocket path agents connect to
    pub agent_path: String,

    /// Messages buffered per `/events` subscriber before it starts lagging
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:24001".to_string(),
            agent_path: "/agent".to_string(),
            event_buffer: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file, or defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self =
                toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.agent_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "agent_path must start with '/': {}",
                self.agent_path
            )));
        }
        if self.event_buffer == 0 {
            return Err(Error::InvalidConfig("event_buffer must be positive".into()));
        }
        Ok(())
    }
}
