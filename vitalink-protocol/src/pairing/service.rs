//! Pairing service
//!
//! Owns the single pending pairing session and the paired-device registry.
//! Session state follows `Idle → PendingCode → {Paired | Expired |
//! LockedOut}`; the terminal states clear the session, so at most one
//! session is ever live. All session mutation is serialized through one
//! mutex, so concurrent connections never observe a torn update.

use super::payload::PairingPayload;
use crate::store::{DeviceStore, PairedDevice};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default pairing-code length
const DEFAULT_CODE_LENGTH: usize = 8;

/// Default pairing-code alphabet (62 symbols)
const DEFAULT_CODE_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Default pairing-code lifetime (5 minutes)
const DEFAULT_CODE_TTL: Duration = Duration::from_secs(300);

/// Default failed-attempt limit before lockout
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default bearer-token lifetime (30 days)
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default bearer-token entropy in bytes (256 bits)
const DEFAULT_TOKEN_BYTES: usize = 32;

/// Length of the hash prefix used for pseudonymous device labels
const NAME_DIGEST_LEN: usize = 12;

/// Pairing service configuration
///
/// Every protocol constant is tunable here; the defaults are the
/// documented protocol values.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Characters in a pairing code
    pub code_length: usize,
    /// Alphabet codes are drawn from
    pub code_alphabet: String,
    /// How long a code stays valid
    pub code_ttl: Duration,
    /// Wrong submissions tolerated before lockout
    pub max_attempts: u32,
    /// How long an issued bearer token stays valid
    pub token_ttl: Duration,
    /// Random bytes per bearer token
    pub token_bytes: usize,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_length: DEFAULT_CODE_LENGTH,
            code_alphabet: DEFAULT_CODE_ALPHABET.to_string(),
            code_ttl: DEFAULT_CODE_TTL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            token_ttl: DEFAULT_TOKEN_TTL,
            token_bytes: DEFAULT_TOKEN_BYTES,
        }
    }
}

/// Result of a successful pairing: the raw token, returned exactly once
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairGrant {
    /// The bearer token. The server keeps only its hash from here on.
    pub token: String,
    /// When the token stops validating
    pub expires_at: DateTime<Utc>,
}

/// Observable pairing session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    /// No session is active
    Idle,
    /// A code is outstanding
    PendingCode {
        expires_at: DateTime<Utc>,
        failed_attempts: u32,
    },
}

/// The single live pairing session
#[derive(Debug)]
struct PendingSession {
    code: String,
    expires_at: DateTime<Utc>,
    failed_attempts: u32,
}

/// Pairing service: code issuance, validation and token lifecycle
pub struct PairingService {
    config: PairingConfig,
    rng: SystemRandom,
    /// At most one live session; all mutation goes through this mutex
    session: Mutex<Option<PendingSession>>,
    store: Arc<Mutex<Box<dyn DeviceStore>>>,
}

impl PairingService {
    /// Create a service over the given device store
    pub fn new(config: PairingConfig, store: Box<dyn DeviceStore>) -> Self {
        Self {
            config,
            rng: SystemRandom::new(),
            session: Mutex::new(None),
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Open a pairing session and build the out-of-band payload
    ///
    /// Replaces any previous session: the old code stops being accepted the
    /// moment this returns.
    pub async fn begin_pairing(
        &self,
        host: &str,
        port: u16,
        fingerprint: &str,
    ) -> Result<PairingPayload> {
        let code = self.generate_code()?;
        let expires_at = expiry_from_now(self.config.code_ttl);

        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("Replacing existing pairing session");
        }
        *session = Some(PendingSession {
            code: code.clone(),
            expires_at,
            failed_attempts: 0,
        });
        drop(session);

        info!("Pairing session open, code expires at {}", expires_at);

        Ok(PairingPayload::new(host, port, code, expires_at, fingerprint))
    }

    /// Handle a pairing submission
    ///
    /// The submitted code is compared against the pending one in constant
    /// time, with no short-circuit on the first differing symbol. On a match a
    /// fresh bearer token is issued and the raw value returned exactly once;
    /// only its SHA-256 hash is persisted. The returned device record is
    /// what was stored (hash included, raw token absent).
    pub async fn handle_pair_request(
        &self,
        code: &str,
        client_name: &str,
    ) -> Result<(PairGrant, PairedDevice)> {
        let mut session = self.session.lock().await;

        let pending = session.as_mut().ok_or(ProtocolError::NoPendingSession)?;

        if Utc::now() >= pending.expires_at {
            info!("Pairing code expired, clearing session");
            *session = None;
            return Err(ProtocolError::ExpiredCode);
        }

        if pending.failed_attempts >= self.config.max_attempts {
            warn!("Pairing attempt limit reached, clearing session");
            *session = None;
            return Err(ProtocolError::TooManyAttempts);
        }

        if !constant_time_eq(code, &pending.code) {
            pending.failed_attempts += 1;
            let attempts_remaining = self
                .config
                .max_attempts
                .saturating_sub(pending.failed_attempts);
            info!(
                "Pairing code mismatch ({} attempts remaining)",
                attempts_remaining
            );
            return Err(ProtocolError::InvalidCode { attempts_remaining });
        }

        // Code matched: issue the token while still holding the session lock
        let token = self.generate_token()?;
        let token_hash = hash_token(&token);
        let now = Utc::now();
        let expires_at = expiry_from_now(self.config.token_ttl);

        let device = PairedDevice {
            id: Uuid::new_v4().to_string(),
            anonymized_name: anonymize_client_name(client_name),
            token_hash,
            created_at: now,
            expires_at,
            last_seen_at: now,
            is_active: true,
        };

        {
            let mut store = self.store.lock().await;
            store.insert(&device)?;
        }

        *session = None;
        info!(
            "Paired device {} ({}), token valid until {}",
            device.id, device.anonymized_name, expires_at
        );

        Ok((PairGrant { token, expires_at }, device))
    }

    /// Validate a presented bearer token
    ///
    /// True only for an active, unexpired device whose stored hash matches
    /// the hash of the presented token. Updates `last_seen_at` on success.
    /// The raw token is never logged.
    pub async fn validate_token(&self, token: &str) -> bool {
        let token_hash = hash_token(token);

        let mut store = self.store.lock().await;
        let device = match store.find_by_token_hash(&token_hash) {
            Ok(Some(device)) => device,
            Ok(None) => return false,
            Err(e) => {
                warn!("Token lookup failed: {}", e);
                return false;
            }
        };

        if !device.is_active || device.expires_at <= Utc::now() {
            return false;
        }

        if let Err(e) = store.touch_last_seen(&device.id, Utc::now()) {
            // Validation outcome is unaffected; last-seen is best effort
            warn!("Failed to update last_seen for {}: {}", device.id, e);
        }

        true
    }

    /// Soft-deactivate every paired device
    ///
    /// Rows are retained for the audit trail; returns how many devices
    /// changed state.
    pub async fn revoke_all(&self) -> Result<usize> {
        let mut store = self.store.lock().await;
        let count = store.deactivate_all()?;
        info!("Revoked {} paired devices", count);
        Ok(count)
    }

    /// All paired devices, active and revoked
    pub async fn list_devices(&self) -> Result<Vec<PairedDevice>> {
        let store = self.store.lock().await;
        store.list()
    }

    /// Soft-deactivate one device by id
    pub async fn revoke_device(&self, id: &str) -> Result<bool> {
        let mut store = self.store.lock().await;
        store.deactivate(id)
    }

    /// Current session state
    pub async fn state(&self) -> PairingState {
        match self.session.lock().await.as_ref() {
            Some(pending) => PairingState::PendingCode {
                expires_at: pending.expires_at,
                failed_attempts: pending.failed_attempts,
            },
            None => PairingState::Idle,
        }
    }

    /// Generate a pairing code from the configured alphabet
    ///
    /// Rejection sampling keeps the draw uniform; a plain modulo would bias
    /// toward the low end of the alphabet.
    fn generate_code(&self) -> Result<String> {
        // One random byte indexes one symbol, so at most 256 are usable
        let alphabet: Vec<char> = self.config.code_alphabet.chars().take(256).collect();
        debug_assert!(alphabet.len() >= 2);

        let limit = 256 - (256 % alphabet.len());
        let mut code = String::with_capacity(self.config.code_length);
        let mut buf = [0u8; 64];

        while code.len() < self.config.code_length {
            self.rng
                .fill(&mut buf)
                .map_err(|_| ProtocolError::Crypto("random code generation failed".into()))?;
            for &byte in buf.iter() {
                if code.len() == self.config.code_length {
                    break;
                }
                if (byte as usize) < limit {
                    code.push(alphabet[byte as usize % alphabet.len()]);
                }
            }
        }

        Ok(code)
    }

    /// Generate a bearer token with the configured entropy
    fn generate_token(&self) -> Result<String> {
        let mut bytes = vec![0u8; self.config.token_bytes];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| ProtocolError::Crypto("random token generation failed".into()))?;
        Ok(hex::encode(bytes))
    }
}

/// SHA-256 hex digest of a bearer token, the only form the server stores
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive a stable pseudonymous label from a client-supplied name
///
/// The raw name is never persisted or logged; the label is a truncated
/// digest, so the same client name always maps to the same label without
/// being reversible.
fn anonymize_client_name(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("device-{}", &digest[..NAME_DIGEST_LEN])
}

/// Fixed-cost string comparison; does not short-circuit on a mismatch
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::max_value());
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteDeviceStore;

    fn test_service() -> PairingService {
        PairingService::new(
            PairingConfig::default(),
            Box::new(SqliteDeviceStore::in_memory().unwrap()),
        )
    }

    async fn begin(service: &PairingService) -> PairingPayload {
        service
            .begin_pairing("192.168.1.50", 8471, "AB:CD:EF")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_shape() {
        let service = test_service();
        let payload = begin(&service).await;

        assert_eq!(payload.code.len(), 8);
        assert!(payload
            .code
            .chars()
            .all(|c| DEFAULT_CODE_ALPHABET.contains(c)));
        assert!(payload.expires_at > Utc::now());
        assert_eq!(payload.certificate_fingerprint, "AB:CD:EF");
    }

    #[tokio::test]
    async fn test_codes_are_not_repeated() {
        let service = test_service();
        let a = begin(&service).await.code;
        let b = begin(&service).await.code;
        let c = begin(&service).await.code;
        assert!(a != b || b != c);
    }

    #[tokio::test]
    async fn test_successful_pairing_issues_validating_token() {
        let service = test_service();
        let payload = begin(&service).await;

        let (grant, device) = service
            .handle_pair_request(&payload.code, "Riley's Phone")
            .await
            .unwrap();

        assert!(!grant.token.is_empty());
        assert!(grant.expires_at > Utc::now() + chrono::Duration::days(29));
        assert!(device.is_active);
        assert!(service.validate_token(&grant.token).await);

        // Session consumed: same code cannot pair twice
        let second = service.handle_pair_request(&payload.code, "again").await;
        assert!(matches!(second, Err(ProtocolError::NoPendingSession)));
    }

    #[tokio::test]
    async fn test_no_pending_session() {
        let service = test_service();
        let result = service.handle_pair_request("AAAAAAAA", "phone").await;
        assert!(matches!(result, Err(ProtocolError::NoPendingSession)));
    }

    #[tokio::test]
    async fn test_wrong_code_keeps_session_until_limit() {
        let service = test_service();
        let payload = begin(&service).await;

        for i in 0..4u32 {
            let result = service.handle_pair_request("wrong-00", "phone").await;
            match result {
                Err(ProtocolError::InvalidCode { attempts_remaining }) => {
                    assert_eq!(attempts_remaining, 4 - i);
                }
                other => panic!("expected InvalidCode, got {:?}", other.map(|_| ())),
            }
        }

        // Correct code on the fifth try still succeeds
        let (grant, _) = service
            .handle_pair_request(&payload.code, "phone")
            .await
            .unwrap();
        assert!(service.validate_token(&grant.token).await);
    }

    #[tokio::test]
    async fn test_lockout_after_limit_even_with_correct_code() {
        let service = test_service();
        let payload = begin(&service).await;

        for _ in 0..5 {
            let _ = service.handle_pair_request("wrong-00", "phone").await;
        }

        // Sixth submission is correct but the session has locked out
        let result = service.handle_pair_request(&payload.code, "phone").await;
        assert!(matches!(result, Err(ProtocolError::TooManyAttempts)));

        // Session cleared: further submissions see no session at all
        assert_eq!(service.state().await, PairingState::Idle);
        let result = service.handle_pair_request(&payload.code, "phone").await;
        assert!(matches!(result, Err(ProtocolError::NoPendingSession)));
    }

    #[tokio::test]
    async fn test_expired_code_rejected_regardless_of_correctness() {
        let service = test_service();
        let payload = begin(&service).await;

        {
            let mut session = service.session.lock().await;
            session.as_mut().unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        let result = service.handle_pair_request(&payload.code, "phone").await;
        assert!(matches!(result, Err(ProtocolError::ExpiredCode)));
        assert_eq!(service.state().await, PairingState::Idle);
    }

    #[tokio::test]
    async fn test_begin_replaces_previous_session() {
        let service = test_service();
        let first = begin(&service).await;
        let second = begin(&service).await;

        let result = service.handle_pair_request(&first.code, "phone").await;
        if first.code != second.code {
            assert!(matches!(result, Err(ProtocolError::InvalidCode { .. })));
        }
        let (grant, _) = service
            .handle_pair_request(&second.code, "phone")
            .await
            .unwrap();
        assert!(!grant.token.is_empty());
    }

    #[tokio::test]
    async fn test_validate_token_pure_outcome_under_last_seen_updates() {
        let service = test_service();
        let payload = begin(&service).await;
        let (grant, _) = service
            .handle_pair_request(&payload.code, "phone")
            .await
            .unwrap();

        // Repeated validations within the expiry window agree
        assert!(service.validate_token(&grant.token).await);
        assert!(service.validate_token(&grant.token).await);
        assert!(service.validate_token(&grant.token).await);
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_and_revoked() {
        let service = test_service();
        let payload = begin(&service).await;
        let (grant, _) = service
            .handle_pair_request(&payload.code, "phone")
            .await
            .unwrap();

        assert!(!service.validate_token("0000deadbeef").await);
        assert!(service.validate_token(&grant.token).await);

        let devices = service.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(service.revoke_device(&devices[0].id).await.unwrap());
        assert!(!service.validate_token(&grant.token).await);
    }

    #[tokio::test]
    async fn test_revoke_all_soft_deactivates() {
        let service = test_service();

        for _ in 0..3 {
            let payload = begin(&service).await;
            service
                .handle_pair_request(&payload.code, "phone")
                .await
                .unwrap();
        }

        assert_eq!(service.revoke_all().await.unwrap(), 3);

        // Records retained, none active
        let devices = service.list_devices().await.unwrap();
        assert_eq!(devices.len(), 3);
        assert!(devices.iter().all(|d| !d.is_active));
    }

    #[tokio::test]
    async fn test_store_never_sees_raw_token_or_name() {
        let service = test_service();
        let payload = begin(&service).await;
        let (grant, _) = service
            .handle_pair_request(&payload.code, "Riley's Phone")
            .await
            .unwrap();

        let devices = service.list_devices().await.unwrap();
        let device = &devices[0];

        assert_ne!(device.token_hash, grant.token);
        assert_eq!(device.token_hash, hash_token(&grant.token));
        assert_ne!(device.anonymized_name, "Riley's Phone");
        assert!(device.anonymized_name.starts_with("device-"));

        // Label is stable for the same client name
        assert_eq!(
            anonymize_client_name("Riley's Phone"),
            device.anonymized_name
        );
    }

    #[test]
    fn test_hash_token_deterministic_and_collision_free() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));

        // No collisions across a large batch of random tokens
        let rng = SystemRandom::new();
        let mut seen = std::collections::HashSet::new();
        let mut bytes = [0u8; 32];
        for _ in 0..100_000 {
            rng.fill(&mut bytes).unwrap();
            let token = hex::encode(bytes);
            assert!(seen.insert(hash_token(&token)));
        }
    }

    #[test]
    fn test_constant_time_eq_semantics() {
        assert!(constant_time_eq("kX3mP9aQ", "kX3mP9aQ"));
        assert!(!constant_time_eq("kX3mP9aQ", "kX3mP9aR"));
        assert!(!constant_time_eq("kX3mP9aQ", "kX3mP9a"));
        assert!(!constant_time_eq("", "a"));
        assert!(constant_time_eq("", ""));
    }
}
