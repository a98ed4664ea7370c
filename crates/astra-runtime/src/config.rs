//! `astra.toml` loading.
//!
//! ```toml
//! [jsrpc]
//! url = "ws://localhost:12080"
//! group = "default"
//! name = "astracrawler"
//! reconnect_interval_ms = 3000
//! max_reconnect_attempts = 10
//! allow_code = false
//!
//! [capture]
//! websocket = true
//! fetch = true
//! xhr = true
//! signatures = true
//! ```
//!
//! Every key is optional.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ext_intercept::CaptureConfig;
use ext_jsrpc::ChannelConfig;

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "astra.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstraConfig {
    pub jsrpc: ChannelConfig,
    pub capture: CaptureConfig,
}

impl AstraConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing astra config")
    }

    /// Read an explicit path, or the default file if it exists, or fall back to defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if !tokio::fs::try_exists(default).await.unwrap_or(false) {
                    tracing::debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config at {}", path.display()))?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}
