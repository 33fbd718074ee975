//! Signaling message types
//!
//! Closed sum types for the wire protocol. Inbound events carry a `type`
//! discriminator; `signal` envelopes additionally carry a `kind` and a
//! payload whose shape matches the corresponding WebRTC construct (session
//! description or connectivity candidate).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;

/// Decode/encode failures on the signaling wire
#[derive(Debug)]
pub struct MessageError(pub String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signaling message error: {}", self.0)
    }
}

impl Error for MessageError {}

/// Discriminator for `signal` envelopes in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Local session-description offer
    Offer,
    /// Remote session-description answer
    Answer,
    /// Connectivity candidate
    Ice,
    /// Control payload outside the peer link
    Control,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
            SignalKind::Control => "control",
        }
    }
}

/// Inbound events produced by the signaling channel, in arrival order.
///
/// The server sends at most one `registered` per channel lifetime, before
/// any `peer_ready`. Transport-level failures surface as an `error` event
/// followed by a `close` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingEvent {
    /// Registration acknowledged by the relay
    Registered {
        #[serde(rename = "expiresAt")]
        expires_at: u64,
        #[serde(rename = "peerConnected", default)]
        peer_connected: bool,
    },

    /// A remote peer announced readiness; negotiation may begin
    PeerReady,

    /// Negotiation payload relayed from the peer
    Signal { kind: SignalKind, payload: Value },

    /// The remote peer disconnected from the relay
    PeerLeft,

    /// The pairing code expired server-side
    SessionExpired,

    /// The relay terminated the session
    Terminated,

    /// Transport or relay error; always followed by `Close`
    Error { message: String },

    /// The channel is shut; no further events follow
    Close,
}

impl SignalingEvent {
    /// Parse an inbound frame
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        serde_json::from_str(json).map_err(|e| MessageError(format!("invalid event: {}", e)))
    }
}

/// Outbound envelopes sent by this side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// Announce the pairing code and role on a fresh connection
    Register { code: String, role: String },

    /// Negotiation payload for the remote peer
    Signal { kind: SignalKind, payload: Value },
}

impl ClientEnvelope {
    /// Serialize for transmission
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError(format!("serialize failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_registered() {
        let json = r#"{"type": "registered", "expiresAt": 1700000300000, "peerConnected": false}"#;
        let event = SignalingEvent::from_json(json).unwrap();
        match event {
            SignalingEvent::Registered {
                expires_at,
                peer_connected,
            } => {
                assert_eq!(expires_at, 1_700_000_300_000);
                assert!(!peer_connected);
            }
            other => panic!("Expected Registered, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_peer_ready() {
        let event = SignalingEvent::from_json(r#"{"type": "peer_ready"}"#).unwrap();
        assert_eq!(event, SignalingEvent::PeerReady);
    }

    #[test]
    fn test_parse_signal_answer() {
        let json = r#"{"type": "signal", "kind": "answer", "payload": {"type": "answer", "sdp": "v=0\r\n..."}}"#;
        let event = SignalingEvent::from_json(json).unwrap();
        match event {
            SignalingEvent::Signal { kind, payload } => {
                assert_eq!(kind, SignalKind::Answer);
                assert!(payload["sdp"].as_str().unwrap().starts_with("v=0"));
            }
            other => panic!("Expected Signal, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type_fails() {
        assert!(SignalingEvent::from_json(r#"{"type": "heartbeat"}"#).is_err());
    }

    #[test]
    fn test_register_envelope_serialization() {
        let envelope = ClientEnvelope::Register {
            code: "ABC123".to_string(),
            role: "desktop".to_string(),
        };
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains("ABC123"));
        assert!(json.contains("desktop"));
    }

    #[test]
    fn test_signal_envelope_roundtrip() {
        let envelope = ClientEnvelope::Signal {
            kind: SignalKind::Ice,
            payload: json!({"candidate": "candidate:1 1 UDP 2122252543 192.0.2.1 54400 typ host"}),
        };
        let json = envelope.to_json().unwrap();
        let back: ClientEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope, back);
    }
}
