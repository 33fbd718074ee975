//! Configuration management for tether-core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Role tag announced to the signaling endpoint.
pub const ROLE_DESKTOP: &str = "desktop";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pairing endpoint configuration
    #[serde(default)]
    pub pairing: PairingConfig,

    /// ICE / rendezvous configuration
    #[serde(default)]
    pub ice: IceConfig,

    /// Screen capture configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Base URL of the pairing issuance service
    pub endpoint: String,

    /// Platform tag sent in the pairing request metadata
    #[serde(default = "default_platform")]
    pub platform: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

/// Rendezvous servers used for connectivity discovery only, never media relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN-class server URLs
    #[serde(default = "default_ice_servers")]
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Target frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Target capture width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Target capture height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// X11 display override (e.g., ":0"); None uses $DISPLAY
    #[serde(default)]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

fn default_platform() -> String {
    "desktop-linux".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_fps() -> u32 {
    15
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://pair.tether.dev".to_string(),
            platform: default_platform(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: default_ice_servers(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
            display: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            logfile: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pairing: PairingConfig::default(),
            ice: IceConfig::default(),
            capture: CaptureConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.pairing.endpoint.is_empty() {
            return Err("Pairing endpoint must not be empty".into());
        }

        if !self.pairing.endpoint.starts_with("http://")
            && !self.pairing.endpoint.starts_with("https://")
        {
            return Err("Pairing endpoint must be an http(s) URL".into());
        }

        if self.pairing.http_timeout_secs == 0 {
            return Err("Pairing HTTP timeout must be non-zero".into());
        }

        if self.ice.servers.is_empty() {
            return Err("At least one ICE server is required".into());
        }

        for server in &self.ice.servers {
            if !server.starts_with("stun:")
                && !server.starts_with("turn:")
                && !server.starts_with("turns:")
            {
                return Err(format!("Invalid ICE server URL: {}", server).into());
            }
        }

        if self.capture.fps == 0 || self.capture.fps > 60 {
            return Err("Capture fps must be between 1 and 60".into());
        }

        if self.capture.width == 0 || self.capture.height == 0 {
            return Err("Capture dimensions must be non-zero".into());
        }

        Ok(())
    }
}
