//! Bridge Configuration
//!
//! Loads `conduit.toml`:
//!
//! ```toml
//! [bridge]
//! bundle_url = "dist/main.js"
//! config_style = "full"      # or "minimal"
//! frame_rate = 60            # 0 disables the frame ticker
//!
//! [interceptor]
//! blocked = ["Logger.*", "UIManager.removeView"]
//!
//! [device]
//! model = "kiosk-7"
//!
//! [runtime]
//! memory_limit = 67108864
//! ```

use std::path::{Path, PathBuf};

use conduit_bridge::ConfigStyle;
use conduit_bridge::bridge::{
    DEFAULT_BUNDLE_URL, DEFAULT_FRAME_RATE, DEFAULT_MAIN_QUEUE, DEFAULT_SCRIPT_QUEUE,
};
use conduit_js_runtime::QuickJsConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bridge: BridgeSection,
    pub interceptor: InterceptorSection,
    /// Exported as constants by the `DeviceInfo` module
    pub device: toml::Table,
    pub runtime: QuickJsConfig,
}

/// `[bridge]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub bundle_url: String,
    pub config_style: ConfigStyle,
    pub frame_rate: u32,
    pub main_queue_label: String,
    pub script_queue_label: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            bundle_url: DEFAULT_BUNDLE_URL.to_string(),
            config_style: ConfigStyle::Full,
            frame_rate: DEFAULT_FRAME_RATE,
            main_queue_label: DEFAULT_MAIN_QUEUE.to_string(),
            script_queue_label: DEFAULT_SCRIPT_QUEUE.to_string(),
        }
    }
}

/// `[interceptor]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorSection {
    /// `Module.method` wildcard patterns of calls to veto
    pub blocked: Vec<String>,
}

impl BridgeConfig {
    /// Parse configuration text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        info!("Loaded bridge config from: {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load(path).await {
            Err(ConfigError::NotFound(path)) => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Device constants as JSON.
    pub fn device_constants(&self) -> serde_json::Map<String, serde_json::Value> {
        self.device
            .iter()
            .filter_map(|(key, value)| {
                serde_json::to_value(value)
                    .ok()
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }
}
