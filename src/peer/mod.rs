//! Peer connection lifecycle
//!
//! Owns the local media stream, the peer connection, and the control data
//! channel for one streaming attempt, and drives the negotiation sequence.

pub mod controller;

pub use controller::{ConnectivitySink, PeerSessionController};

use crate::capture::CaptureError;
use std::error::Error;
use std::fmt;

/// Peer-related errors
#[derive(Debug)]
pub enum PeerError {
    /// Local media could not be acquired
    Media(CaptureError),
    /// Offer/answer or candidate processing failed
    NegotiationFailed(String),
    /// The established connection degraded or failed
    ConnectionLost(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Media(e) => write!(f, "{}", e),
            PeerError::NegotiationFailed(msg) => write!(f, "Peer negotiation failed: {}", msg),
            PeerError::ConnectionLost(msg) => write!(f, "Peer connection lost: {}", msg),
        }
    }
}

impl Error for PeerError {}
