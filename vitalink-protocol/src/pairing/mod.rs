//! Device pairing
//!
//! Pairing bootstraps a long-lived bearer token from a short-lived code
//! transferred out-of-band (typically as a QR code on the server's screen).
//!
//! ## Pairing flow
//!
//! 1. **Begin**: the operator starts a pairing session; the server generates
//!    an 8-character high-entropy code with a 5-minute expiry.
//! 2. **Transfer**: the code travels inside a [`PairingPayload`] together
//!    with host, port and the server's certificate fingerprint, so the
//!    client can verify it is talking to the right server before sending
//!    the code anywhere.
//! 3. **Submit**: the client posts the code to `/api/v1/pair`. The server
//!    compares it in constant time; up to 5 failed attempts are tolerated
//!    before the session locks out.
//! 4. **Grant**: on a match the server issues a random bearer token, stores
//!    only its SHA-256 hash, and returns the raw token exactly once.

pub mod payload;
pub mod service;

pub use payload::PairingPayload;
pub use service::{hash_token, PairGrant, PairingConfig, PairingService, PairingState};
