//! TLS server identity
//!
//! Every VitaLink server owns exactly one self-signed TLS identity: an EC
//! P-256 key pair and a certificate embedding the public key. Clients verify
//! the server out-of-band by comparing the certificate's SHA-256 fingerprint
//! from the pairing payload; there is no certificate authority involved.
//!
//! The identity is created lazily on first server start, persisted as PEM
//! files in the data directory, and loaded on every start after that.
//! Regenerating it is an explicit operation because a new fingerprint
//! invalidates every outstanding pairing.

use crate::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Name};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default certificate validity period in days (one year)
const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Organization name embedded in the certificate subject
const CERT_ORG: &str = "VitaLink";

/// File names for the persisted identity within the identity directory
const CERT_FILE: &str = "server_cert.pem";
const KEY_FILE: &str = "server_key.pem";

/// Identity store configuration
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Directory holding the persisted certificate and key
    pub dir: PathBuf,
    /// Common Name placed in the certificate subject
    pub common_name: String,
    /// Certificate validity in days from creation
    pub validity_days: u32,
}

impl IdentityConfig {
    /// Config with default validity for the given directory and server name
    pub fn new(dir: impl Into<PathBuf>, common_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            common_name: common_name.into(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

/// A server TLS identity: key pair, certificate and fingerprint
///
/// The private key is held exclusively by this struct and never leaves it
/// except into the TLS acceptor; it is excluded from `Debug` output.
#[derive(Clone)]
pub struct TlsIdentity {
    /// DER-encoded certificate (public)
    pub certificate: Vec<u8>,

    /// DER-encoded private key, never logged or serialized
    private_key: Vec<u8>,

    /// SHA-256 fingerprint of the certificate, colon-separated hex
    pub fingerprint: String,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl TlsIdentity {
    /// Generate a fresh self-signed identity
    ///
    /// Key pair is EC P-256 (~128-bit security). The certificate is signed
    /// with SHA-256 and valid for `validity_days` from now.
    pub fn generate(common_name: &str, validity_days: u32) -> Result<Self> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let ec_key = EcKey::generate(&group)?;
        let pkey = PKey::from_ec_key(ec_key)?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;

        // Random serial number
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_text("O", CERT_ORG)?;
        name.append_entry_by_text("CN", common_name)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = Asn1Time::days_from_now(0)?;
        let not_after = Asn1Time::days_from_now(validity_days)?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(&pkey)?;

        // End-entity certificate, not a CA
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_agreement()
                .build()?,
        )?;

        builder.sign(&pkey, MessageDigest::sha256())?;
        let cert = builder.build();

        let certificate = cert.to_der()?;
        let private_key = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate);

        info!("Generated TLS identity with fingerprint {}", fingerprint);

        Ok(Self {
            certificate,
            private_key,
            fingerprint,
        })
    }

    /// SHA-256 fingerprint of a DER certificate as `XX:XX:...:XX`
    pub fn calculate_fingerprint(cert_der: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        let hash = hasher.finalize();

        hash.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// DER private key bytes, for installing into a TLS acceptor only
    pub(crate) fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }

    /// Write certificate and private key as PEM files
    ///
    /// The key file is restricted to owner read/write.
    fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cert = X509::from_der(&self.certificate)?;
        fs::write(cert_path, cert.to_pem()?)?;

        let pkey = PKey::private_key_from_der(&self.private_key)?;
        fs::write(key_path, pkey.private_key_to_pem_pkcs8()?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Saved identity to {:?}", cert_path.parent());
        Ok(())
    }

    /// Load a persisted identity from PEM files
    fn load_from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert = X509::from_pem(&fs::read(cert_path)?)?;
        let certificate = cert.to_der()?;

        let pkey = PKey::private_key_from_pem(&fs::read(key_path)?)?;
        let private_key = pkey.private_key_to_der()?;

        let fingerprint = Self::calculate_fingerprint(&certificate);

        Ok(Self {
            certificate,
            private_key,
            fingerprint,
        })
    }
}

/// Durable store for the server's TLS identity
///
/// `load_or_create` is safe to call from concurrent tasks: the first call
/// creates and persists the identity, every other call gets the same one.
pub struct IdentityStore {
    config: IdentityConfig,
    /// Serializes creation and caches the loaded identity
    cached: Mutex<Option<TlsIdentity>>,
}

impl IdentityStore {
    /// Create a store rooted at the configured directory
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    /// Load the persisted identity, creating it on first use
    ///
    /// Concurrent first calls are serialized so exactly one identity is ever
    /// created. Key-generation failure is surfaced to the caller and is fatal
    /// to server startup; a failed persist is retried once before giving up.
    pub async fn load_or_create(&self) -> Result<TlsIdentity> {
        let mut cached = self.cached.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let cert_path = self.config.dir.join(CERT_FILE);
        let key_path = self.config.dir.join(KEY_FILE);

        let identity = if cert_path.exists() && key_path.exists() {
            info!("Loading TLS identity from {:?}", self.config.dir);
            TlsIdentity::load_from_files(&cert_path, &key_path)?
        } else {
            info!("Creating TLS identity in {:?}", self.config.dir);
            let identity =
                TlsIdentity::generate(&self.config.common_name, self.config.validity_days)?;
            self.persist_with_retry(&identity, &cert_path, &key_path)?;
            identity
        };

        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Replace the identity with a freshly generated one
    ///
    /// Invalidates every outstanding pairing: the fingerprint changes, so
    /// paired clients will no longer trust this server until re-paired.
    pub async fn regenerate(&self) -> Result<TlsIdentity> {
        let mut cached = self.cached.lock().await;

        warn!("Regenerating TLS identity; all existing pairings become invalid");
        let identity =
            TlsIdentity::generate(&self.config.common_name, self.config.validity_days)?;

        let cert_path = self.config.dir.join(CERT_FILE);
        let key_path = self.config.dir.join(KEY_FILE);
        self.persist_with_retry(&identity, &cert_path, &key_path)?;

        *cached = Some(identity.clone());
        Ok(identity)
    }

    fn persist_with_retry(
        &self,
        identity: &TlsIdentity,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<()> {
        if let Err(first) = identity.save_to_files(cert_path, key_path) {
            warn!("Persisting identity failed, retrying once: {}", first);
            identity.save_to_files(cert_path, key_path)?;
        }
        Ok(())
    }
}

/// Generate a non-persisted identity for short-lived or test use
pub fn create_ephemeral_identity(common_name: &str) -> Result<TlsIdentity> {
    TlsIdentity::generate(common_name, DEFAULT_VALIDITY_DAYS)
}
