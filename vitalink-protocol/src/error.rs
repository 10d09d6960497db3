//! Error handling for the VitaLink protocol
//!
//! A single error type covers every protocol operation. Errors fall into five
//! categories with different handling rules:
//!
//! - Transport/parsing errors (`RequestTooLarge`, `RequestTimeout`,
//!   `MalformedRequest`) are recoverable per-connection and converted into an
//!   HTTP response at the connection-handler boundary.
//! - Pairing errors (`NoPendingSession`, `ExpiredCode`, `InvalidCode`,
//!   `TooManyAttempts`) carry stable wire codes and map to 4xx responses.
//! - Authentication errors (`InvalidToken`, `RateLimited`) map to 401/429 and
//!   are always audit-logged by the routing layer.
//! - Identity/startup errors (`Certificate`, `StartTimeout`) are fatal and
//!   propagate out of `NetworkServer::start()`.
//! - Storage and I/O errors convert automatically via `From`.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// Most library errors convert automatically through the `From` trait:
/// `std::io::Error`, `serde_json::Error`, `openssl::ssl::Error`,
/// `openssl::error::ErrorStack` and `rusqlite::Error`.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error during handshake or stream operations
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or key management error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Paired-device store error
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Secure random generation failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// A pairing submission arrived while no pairing session is active
    #[error("No pending pairing session")]
    NoPendingSession,

    /// The pending pairing code is past its expiry
    #[error("Pairing code expired")]
    ExpiredCode,

    /// The submitted pairing code did not match
    #[error("Invalid pairing code ({attempts_remaining} attempts remaining)")]
    InvalidCode {
        /// Submissions left before the session locks out
        attempts_remaining: u32,
    },

    /// The pairing session reached its failed-attempt limit
    #[error("Too many pairing attempts")]
    TooManyAttempts,

    /// Bearer token is missing, unknown, expired or revoked
    #[error("Invalid bearer token")]
    InvalidToken,

    /// Token exceeded its sliding-window request budget
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Listener did not reach ready state within the startup timeout
    #[error("Server failed to start within timeout")]
    StartTimeout,

    /// An operation required a running server
    #[error("Server is not running")]
    NotRunning,

    /// A complete request was not received within the receive budget
    #[error("Timed out receiving request")]
    RequestTimeout,

    /// Request headers or body exceeded the configured ceiling
    #[error("Request too large: {size} bytes (max: {max})")]
    RequestTooLarge {
        /// Observed size in bytes
        size: usize,
        /// Configured ceiling in bytes
        max: usize,
    },

    /// Request could not be parsed as HTTP
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Pairing payload could not be decoded
    #[error("Invalid pairing payload: {0}")]
    InvalidPayload(String),

    /// mDNS advertisement failure
    #[error("Discovery error: {0}")]
    Discovery(String),
}

impl ProtocolError {
    /// HTTP status code this error maps to on the wire
    pub fn status_code(&self) -> u16 {
        match self {
            ProtocolError::NoPendingSession => 403,
            ProtocolError::ExpiredCode => 401,
            ProtocolError::InvalidCode { .. } => 401,
            ProtocolError::InvalidToken => 401,
            ProtocolError::TooManyAttempts => 429,
            ProtocolError::RateLimited => 429,
            ProtocolError::RequestTooLarge { .. } => 413,
            ProtocolError::RequestTimeout => 408,
            ProtocolError::MalformedRequest(_)
            | ProtocolError::InvalidPayload(_)
            | ProtocolError::Json(_) => 400,
            _ => 500,
        }
    }

    /// Stable error code carried in the response body
    ///
    /// Clients match on these strings, so they never change across releases.
    pub fn error_code(&self) -> &'static str {
        match self {
            ProtocolError::NoPendingSession => "no_pending_session",
            ProtocolError::ExpiredCode => "expired_code",
            ProtocolError::InvalidCode { .. } => "invalid_code",
            ProtocolError::TooManyAttempts => "too_many_attempts",
            ProtocolError::InvalidToken => "unauthorized",
            ProtocolError::RateLimited => "rate_limited",
            ProtocolError::RequestTooLarge { .. } => "request_too_large",
            ProtocolError::RequestTimeout => "request_timeout",
            ProtocolError::MalformedRequest(_) => "malformed_request",
            ProtocolError::InvalidPayload(_) | ProtocolError::Json(_) => "invalid_body",
            _ => "internal_error",
        }
    }

    /// Actionable message for the pairing client or API consumer
    ///
    /// Never includes internal paths, stack traces or stored secrets.
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NoPendingSession => {
                "No pairing session is active. Start pairing on the server first.".to_string()
            }
            ProtocolError::ExpiredCode => {
                "Pairing code expired. Restart pairing on the server.".to_string()
            }
            ProtocolError::InvalidCode { attempts_remaining } => {
                format!("Incorrect pairing code. {attempts_remaining} attempts remaining.")
            }
            ProtocolError::TooManyAttempts => {
                "Too many attempts. Restart pairing on the server.".to_string()
            }
            ProtocolError::InvalidToken => "Authentication required.".to_string(),
            ProtocolError::RateLimited => "Rate limit exceeded. Slow down.".to_string(),
            ProtocolError::RequestTooLarge { max, .. } => {
                format!("Request exceeds the {max}-byte limit.")
            }
            ProtocolError::RequestTimeout => "Request was not received in time.".to_string(),
            ProtocolError::MalformedRequest(_) => "Request could not be parsed.".to_string(),
            ProtocolError::InvalidPayload(_) | ProtocolError::Json(_) => {
                "Request body could not be decoded.".to_string()
            }
            _ => "Internal server error.".to_string(),
        }
    }

    /// Whether this error prevents server startup (identity/listener failures)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Certificate(_) | ProtocolError::StartTimeout
        )
    }
}
