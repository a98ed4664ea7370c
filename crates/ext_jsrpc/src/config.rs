//! Channel configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection parameters; every field has a default.
///
/// The camelCase keys used by page-side scripts (`wsUrl`,
/// `reconnectInterval`, `maxReconnectAttempts`) are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    #[serde(alias = "wsUrl")]
    pub url: String,
    pub group: String,
    pub name: String,
    #[serde(alias = "reconnectInterval")]
    pub reconnect_interval_ms: u64,
    #[serde(alias = "maxReconnectAttempts")]
    pub max_reconnect_attempts: u32,
    #[serde(alias = "startupDelay")]
    pub startup_delay_ms: u64,
    /// Accept `code` calls. Off unless explicitly enabled.
    #[serde(alias = "allowCode")]
    pub allow_code: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:12080".to_string(),
            group: "default".to_string(),
            name: "astracrawler".to_string(),
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 10,
            startup_delay_ms: 500,
            allow_code: false,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Overwrite the fields present in `patch`, keeping the rest.
    pub fn merge(&mut self, patch: ConfigPatch) {
        if let Some(url) = patch.url {
            self.url = url;
        }
        if let Some(group) = patch.group {
            self.group = group;
        }
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(interval) = patch.reconnect_interval_ms {
            self.reconnect_interval_ms = interval;
        }
        if let Some(max) = patch.max_reconnect_attempts {
            self.max_reconnect_attempts = max;
        }
        if let Some(delay) = patch.startup_delay_ms {
            self.startup_delay_ms = delay;
        }
        if let Some(allow) = patch.allow_code {
            self.allow_code = allow;
        }
    }
}

/// Partial configuration for runtime updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    #[serde(alias = "wsUrl", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "reconnectInterval", skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_ms: Option<u64>,
    #[serde(alias = "maxReconnectAttempts", skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(alias = "startupDelay", skip_serializing_if = "Option::is_none")]
    pub startup_delay_ms: Option<u64>,
    #[serde(alias = "allowCode", skip_serializing_if = "Option::is_none")]
    pub allow_code: Option<bool>,
}
