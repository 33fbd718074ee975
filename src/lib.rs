//! tether-core - Desktop pairing and screen-streaming core
//!
//! Lets a companion device pair with a running desktop session and receive a
//! live screen stream plus a control channel, without either side knowing the
//! other's network address in advance.

pub mod capture;
pub mod config;
pub mod pairing;
pub mod peer;
pub mod session;
pub mod signaling;

// Re-exports
pub use config::Config;
pub use pairing::PairingSession;
pub use session::{SessionManager, SessionStatus, StatusSnapshot};
pub use signaling::{SignalKind, SignalingEvent};
