//! tether-core - Main entry point
//!
//! Requests a pairing code at startup, prints it for the companion device to
//! scan, and streams status transitions until interrupted.

mod args;
mod capture;
mod config;
mod pairing;
mod peer;
mod session;
mod signaling;

use args::Args;
use clap::Parser;
use config::Config;
use log::{error, info, warn};
use session::{SessionManager, SessionStatus};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("TETHER_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("tether-core v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let manager = SessionManager::new(&config)?;
    let mut status = manager.subscribe();

    // Surface status transitions until shutdown
    let status_task = tokio::spawn(async move {
        let mut last = SessionStatus::Idle;
        loop {
            if status.changed().await.is_err() {
                break;
            }
            let snapshot = status.borrow().clone();
            if snapshot.status == last {
                continue;
            }
            last = snapshot.status;
            match snapshot.status {
                SessionStatus::Waiting => {
                    if let (Some(code), Some(qr)) = (&snapshot.pairing_code, &snapshot.qr_data) {
                        info!("Pairing code: {}", code);
                        info!("QR payload:  {}", qr);
                    }
                    if let Some(expires_at) = snapshot.expires_at {
                        info!("Code expires at {} (ms since epoch)", expires_at);
                    }
                }
                SessionStatus::Pairing => info!("Companion connected, negotiating..."),
                SessionStatus::Streaming => info!("Streaming to companion"),
                SessionStatus::Error => {
                    error!(
                        "Session error: {}",
                        snapshot.error.as_deref().unwrap_or("unknown")
                    );
                }
                SessionStatus::Idle | SessionStatus::Requesting => {}
            }
        }
    });

    manager.request_pairing_code();

    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received");

    manager.stop_session();
    status_task.abort();
    let _ = status_task.await;

    info!("tether-core stopped");
    Ok(())
}
