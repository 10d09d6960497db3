//! Pairing payload
//!
//! The bundle a pairing client needs to find, verify and pair with the
//! server. It travels out-of-band, rendered as a QR code or copied by the
//! operator, so it is encoded compactly: camelCase JSON wrapped in
//! URL-safe base64.

use crate::{ProtocolError, Result, PAYLOAD_VERSION};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Out-of-band pairing bundle
///
/// The `certificate_fingerprint` lets the client check the TLS identity it
/// connects to against the one the operator showed it, so a hostile network
/// path cannot substitute a different server during code exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    /// Payload format version
    pub version: u32,

    /// Host the client should connect to
    pub host: String,

    /// TCP port of the TLS listener
    pub port: u16,

    /// The pairing code to submit
    pub code: String,

    /// When the code stops being accepted
    pub expires_at: DateTime<Utc>,

    /// SHA-256 fingerprint of the server certificate
    pub certificate_fingerprint: String,
}

impl PairingPayload {
    /// Build a payload for the current format version
    pub fn new(
        host: impl Into<String>,
        port: u16,
        code: impl Into<String>,
        expires_at: DateTime<Utc>,
        certificate_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            host: host.into(),
            port,
            code: code.into(),
            expires_at,
            certificate_fingerprint: certificate_fingerprint.into(),
        }
    }

    /// Encode for QR transport: URL-safe base64 over compact JSON
    pub fn to_qr_string(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a QR string back into a payload
    pub fn from_qr_string(encoded: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| ProtocolError::InvalidPayload(format!("base64: {e}")))?;
        let payload: Self = serde_json::from_slice(&json)
            .map_err(|e| ProtocolError::InvalidPayload(format!("json: {e}")))?;

        if payload.version != PAYLOAD_VERSION {
            return Err(ProtocolError::InvalidPayload(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }

        Ok(payload)
    }
}
