//! Pairing code issuance
//!
//! One HTTP round trip against the pairing service: POST /pairings with the
//! device metadata, get back a short-lived code, its expiry, a QR payload and
//! the signaling endpoint to connect to. No retries are performed here; retry
//! policy belongs to the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Pairing-related errors
#[derive(Debug)]
pub enum PairingError {
    /// The endpoint answered with a non-success status
    RequestFailed(u16),
    /// The transport layer could not reach the endpoint
    NetworkUnavailable(String),
    /// The endpoint answered with a payload we could not decode
    InvalidResponse(String),
    /// The HTTP client could not be constructed
    ClientSetup(String),
}

impl fmt::Display for PairingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingError::RequestFailed(status) => {
                write!(f, "Pairing request failed with status {}", status)
            }
            PairingError::NetworkUnavailable(msg) => write!(f, "Network unavailable: {}", msg),
            PairingError::InvalidResponse(msg) => write!(f, "Invalid pairing response: {}", msg),
            PairingError::ClientSetup(msg) => write!(f, "HTTP client setup failed: {}", msg),
        }
    }
}

impl Error for PairingError {}

/// Metadata describing the requesting side, JSON-serialized into the request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    /// Platform tag (e.g., "desktop-linux")
    pub platform: String,
    /// Request timestamp, milliseconds since the epoch
    pub requested_at: u64,
}

impl DeviceMetadata {
    /// Build metadata for a request issued now
    pub fn now(platform: &str) -> Self {
        let requested_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            platform: platform.to_string(),
            requested_at,
        }
    }
}

/// One issued pairing attempt. Immutable; discarded when the session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSession {
    /// Short-lived code identifying this attempt to the signaling endpoint
    pub code: String,
    /// Absolute expiry, milliseconds since the epoch
    pub expires_at: u64,
    /// Renderable pairing token (QR code payload)
    pub qr_data: String,
    /// WebSocket URL of the signaling endpoint
    pub signaling_url: String,
}

/// Wire shape of the pairing service response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingResponse {
    code: String,
    expires_at: u64,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: u64,
    qr_data: String,
    signaling: SignalingEndpoints,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalingEndpoints {
    #[serde(default)]
    #[allow(dead_code)]
    http_url: String,
    ws_url: String,
}

impl From<PairingResponse> for PairingSession {
    fn from(resp: PairingResponse) -> Self {
        Self {
            code: resp.code,
            expires_at: resp.expires_at,
            qr_data: resp.qr_data,
            signaling_url: resp.signaling.ws_url,
        }
    }
}

/// Seam for the pairing request so the orchestrator can be tested with a stub.
#[async_trait]
pub trait PairingIssuer: Send + Sync {
    /// Request a fresh pairing session
    async fn request_pairing(&self, metadata: &DeviceMetadata)
        -> Result<PairingSession, PairingError>;
}

/// HTTP client against the pairing issuance service
pub struct PairingGateway {
    client: reqwest::Client,
    endpoint: String,
}

impl PairingGateway {
    /// Create a gateway for the given base endpoint URL
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, PairingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PairingError::ClientSetup(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PairingIssuer for PairingGateway {
    async fn request_pairing(
        &self,
        metadata: &DeviceMetadata,
    ) -> Result<PairingSession, PairingError> {
        let url = format!("{}/pairings", self.endpoint);
        let body = json!({ "metadata": metadata });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PairingError::NetworkUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PairingError::RequestFailed(status.as_u16()));
        }

        let parsed: PairingResponse = response
            .json()
            .await
            .map_err(|e| PairingError::InvalidResponse(e.to_string()))?;

        Ok(parsed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairing_response() {
        let json = r#"{
            "code": "ABC123",
            "expiresAt": 1700000300000,
            "expiresIn": 300,
            "qrData": "tether://pair/ABC123",
            "signaling": {
                "httpUrl": "https://signal.example.com",
                "wsUrl": "wss://signal.example.com/ws"
            }
        }"#;

        let parsed: PairingResponse = serde_json::from_str(json).unwrap();
        let session: PairingSession = parsed.into();
        assert_eq!(session.code, "ABC123");
        assert_eq!(session.expires_at, 1_700_000_300_000);
        assert_eq!(session.qr_data, "tether://pair/ABC123");
        assert_eq!(session.signaling_url, "wss://signal.example.com/ws");
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = DeviceMetadata {
            platform: "desktop-linux".to_string(),
            requested_at: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["platform"], "desktop-linux");
        assert_eq!(value["requestedAt"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_gateway_trims_trailing_slash() {
        let gateway = PairingGateway::new("https://pair.example.com/", Duration::from_secs(5));
        assert_eq!(gateway.unwrap().endpoint, "https://pair.example.com");
    }
}
