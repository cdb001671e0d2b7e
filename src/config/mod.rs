//! Configuration module
//!
//! Handles loading and saving gridlink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::network::{self, SimulatorConfig};
use crate::protocol::{VersionInfo, DEFAULT_PORT, MAX_FRAME_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Connection to the grid server
    #[serde(default)]
    pub network: NetworkConfig,

    /// Editor version stamped on uploads
    #[serde(default)]
    pub editor: EditorConfig,

    /// Built-in server simulator
    #[serde(default)]
    pub simulator: SimulatorSettings,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address of the grid server
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Port of the grid server
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Heartbeat interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Reply timeout of a single command in ms
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Timeout of a whole configuration download in ms
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
    /// Time limit for writing one frame in ms
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    1000
}

fn default_transfer_timeout() -> u64 {
    5000
}

fn default_write_timeout() -> u64 {
    1000
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            request_timeout_ms: default_request_timeout(),
            transfer_timeout_ms: default_transfer_timeout(),
            write_timeout_ms: default_write_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Editor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_version")]
    pub subversion: u32,
}

fn default_version() -> u32 {
    1
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            subversion: default_version(),
        }
    }
}

/// Simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSettings {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to
    #[serde(default = "default_server_address")]
    pub bind_address: String,
    /// Status push interval in ms, 0 disables pushes
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
    /// Reply to heartbeats
    #[serde(default = "default_true")]
    pub answer_heartbeats: bool,
}

fn default_status_interval() -> u64 {
    1000
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_server_address(),
            status_interval_ms: default_status_interval(),
            answer_heartbeats: true,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("gridlink/config.toml")),
            Some(PathBuf::from("./gridlink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Settings of the client connection
    pub fn client_config(&self) -> network::NetworkConfig {
        network::NetworkConfig {
            connect_timeout_ms: self.network.connect_timeout_ms,
            heartbeat_interval_ms: self.network.heartbeat_interval_ms,
            request_timeout_ms: self.network.request_timeout_ms,
            transfer_timeout_ms: self.network.transfer_timeout_ms,
            write_timeout_ms: self.network.write_timeout_ms,
            max_frame_size: self.network.max_frame_size,
            version: VersionInfo {
                version: self.editor.version,
                subversion: self.editor.subversion,
            },
        }
    }

    /// Settings of the simulator
    pub fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            bind_address: self.simulator.bind_address.clone(),
            port: self.simulator.port,
            status_interval_ms: self.simulator.status_interval_ms,
            answer_heartbeats: self.simulator.answer_heartbeats,
            max_frame_size: self.network.max_frame_size,
            ..Default::default()
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        network: NetworkConfig {
            server_address: "192.168.1.10".to_string(),
            ..Default::default()
        },
        editor: EditorConfig {
            version: 2,
            subversion: 0,
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
