use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

/// Tunables of the contact list service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MclConfig {
    /// How long a caller blocks waiting for a protocol confirmation.
    #[serde(default = "default_modification_timeout_ms")]
    pub modification_timeout_ms: u64,

    /// How long a timed out operation's ignore entry keeps swallowing its
    /// late echo.
    #[serde(default = "default_late_event_grace_ms")]
    pub late_event_grace_ms: u64,

    /// Only providers reporting this mask are accepted, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_mask: Option<String>,

    /// How many contacts the recent messages list keeps.
    #[serde(default = "default_recent_messages_limit")]
    pub recent_messages_limit: usize,

    #[serde(skip)]
    pub path: PathBuf,
}

fn default_modification_timeout_ms() -> u64 {
    10_000
}

fn default_late_event_grace_ms() -> u64 {
    30_000
}

fn default_recent_messages_limit() -> usize {
    10
}

impl Default for MclConfig {
    fn default() -> Self {
        Self {
            modification_timeout_ms: default_modification_timeout_ms(),
            late_event_grace_ms: default_late_event_grace_ms(),
            provider_mask: None,
            recent_messages_limit: default_recent_messages_limit(),
            path: PathBuf::new(),
        }
    }
}

impl MclConfig {
    /// Reads `path`, or returns defaults bound to `path` when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let mut config: MclConfig = serde_json::from_str(&content)?;
            config.path = path.to_path_buf();
            Ok(config)
        } else {
            Ok(MclConfig {
                path: path.to_path_buf(),
                ..Default::default()
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn modification_timeout(&self) -> Duration {
        Duration::from_millis(self.modification_timeout_ms)
    }

    pub fn late_event_grace(&self) -> Duration {
        Duration::from_millis(self.late_event_grace_ms)
    }
}
