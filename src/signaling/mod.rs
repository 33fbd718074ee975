//! Signaling protocol
//!
//! Typed envelopes exchanged with the signaling relay over one duplex
//! WebSocket, and the channel that owns that socket. Inbound frames become
//! [`SignalingEvent`] values handled through exhaustive matching; outbound
//! frames are [`ClientEnvelope`] values (registration and signal payloads).

pub mod channel;
pub mod message;

pub use channel::{ChannelError, SignalingChannel, SignalingConnector, WebSocketSignaling};
pub use message::{ClientEnvelope, SignalKind, SignalingEvent};
