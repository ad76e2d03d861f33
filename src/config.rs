//! WolfSplit Configuration
//!
//! Configuration structures for the router. Only the session command
//! replication engine is configured here; backend-set configuration lives
//! with the connection layer.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Main WolfSplit configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RouterConfig {
    /// Session command replication configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Session command replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Disable session command history retention entirely.
    ///
    /// With history disabled, backends attached mid-session start at the
    /// current queue tail and are not synchronized by replay.
    #[serde(default)]
    pub disable_history: bool,

    /// Maximum number of session commands retained for replay (0 = unlimited).
    ///
    /// Exceeding the limit drops the stored history and disables replay for
    /// the remainder of the session.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disable_history: false,
            max_history: default_max_history(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}
