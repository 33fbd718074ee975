use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser, Debug)]
#[command(name = "tether-core")]
#[command(author = "Tether Team")]
#[command(version = "0.1.0")]
#[command(about = "Desktop pairing and screen-streaming core", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tether-core.toml")]
    pub config: PathBuf,

    /// Pairing service base URL
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Platform tag sent with the pairing request
    #[arg(long)]
    pub platform: Option<String>,

    /// Capture frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Capture width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Capture height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// X11 display to capture (e.g., ":0"); defaults to $DISPLAY
    #[arg(short, long)]
    pub display: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the loaded file
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref endpoint) = self.endpoint {
            config.pairing.endpoint = endpoint.clone();
        }
        if let Some(ref platform) = self.platform {
            config.pairing.platform = platform.clone();
        }
        if let Some(fps) = self.fps {
            config.capture.fps = fps;
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(ref display) = self.display {
            config.capture.display = Some(display.clone());
        }
    }
}
