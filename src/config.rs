use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::webrtc::{CHANNEL_LABEL, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the room relay
    #[serde(default = "default_signaling_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Outbound chunk size in bytes (0 = default)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8080/signal".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_channel_label() -> String {
    CHANNEL_LABEL.to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_download_dir() -> String {
    get_peerdrop_dir()
        .join("downloads")
        .to_string_lossy()
        .to_string()
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            channel_label: default_channel_label(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            download_dir: default_download_dir(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Parse a config file at `path`
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    /// Chunk size with 0 mapped to the default
    pub fn chunk_size(&self) -> usize {
        if self.transfer.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.transfer.chunk_size
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        PathBuf::from(&self.transfer.download_dir)
    }
}

/// Get the peerdrop directory (~/.peerdrop)
pub fn get_peerdrop_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerdrop")
}

/// Get the config file path (~/.peerdrop/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerdrop_dir().join("config.toml")
}
