//! Configuration loading

use anyhow::Result;
use beamlink_control::{CameraConfig, SessionConfig};
use beamlink_discovery::FeedConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub camera: CameraSettings,
    #[serde(default)]
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// The device proxy serving `discover`, `control/*`, `camera/*` and `touch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Identity sent on every socket
    #[serde(default = "default_client_key")]
    pub client_key: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            client_key: default_client_key(),
        }
    }
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8000
}

fn default_client_key() -> String {
    format!("beamlink-{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Addresses probed directly, for devices outside broadcast reach
    #[serde(default)]
    pub poke_ips: Vec<String>,
    #[serde(default = "default_poke_interval")]
    pub poke_interval_secs: u64,
    /// Minimum spacing between snapshot deliveries
    #[serde(default = "default_buffer_ms")]
    pub buffer_ms: u64,
    #[serde(default = "default_redeliver")]
    pub redeliver_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poke_ips: Vec::new(),
            poke_interval_secs: default_poke_interval(),
            buffer_ms: default_buffer_ms(),
            redeliver_secs: default_redeliver(),
        }
    }
}

fn default_poke_interval() -> u64 {
    10
}

fn default_buffer_ms() -> u64 {
    100
}

fn default_redeliver() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_thirty")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_thirty")]
    pub connect_timeout_secs: u64,
    /// Wait after a mode switch before the device accepts commands
    #[serde(default = "default_mode_settle")]
    pub mode_settle_ms: u64,
    #[serde(default = "default_max_task_queue")]
    pub max_task_queue: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_thirty(),
            connect_timeout_secs: default_thirty(),
            mode_settle_ms: default_mode_settle(),
            max_task_queue: default_max_task_queue(),
        }
    }
}

fn default_thirty() -> u64 {
    30
}

fn default_mode_settle() -> u64 {
    3000
}

fn default_max_task_queue() -> usize {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(default = "default_camera_connect")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_thirty")]
    pub picture_timeout_secs: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_camera_connect(),
            picture_timeout_secs: default_thirty(),
        }
    }
}

fn default_camera_connect() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Desktop notifications for finished, aborted and paused jobs
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { enabled: default_true() }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_key: self.backend.client_key.clone(),
            connect_timeout: Duration::from_secs(self.control.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.control.command_timeout_secs),
            mode_settle: Duration::from_millis(self.control.mode_settle_ms),
            max_task_queue: self.control.max_task_queue,
            ..SessionConfig::default()
        }
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            client_key: self.backend.client_key.clone(),
            connect_timeout: Duration::from_secs(self.camera.connect_timeout_secs),
            frame_timeout: Duration::from_secs(self.camera.picture_timeout_secs),
            ..CameraConfig::default()
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            buffer: Duration::from_millis(self.discovery.buffer_ms),
            redeliver: Duration::from_secs(self.discovery.redeliver_secs),
            poke_ips: self.discovery.poke_ips.clone(),
            poke_interval: Duration::from_secs(self.discovery.poke_interval_secs.max(1)),
            ..FeedConfig::default()
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
