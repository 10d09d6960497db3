//! Daemon configuration
//!
//! TOML configuration with defaults for every field, so an empty file (or
//! no file at all) yields a working server. Protocol constants (code
//! length, expiries, rate budget) are exposed here as tunables and handed
//! down to the protocol crate's config structs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vitalink_protocol::server::http::RequestLimits;
use vitalink_protocol::{IdentityConfig, PairingConfig, RateLimitConfig, ServerConfig};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSection,

    /// Pairing configuration
    #[serde(default)]
    pub pairing: PairingSection,

    /// Storage paths
    #[serde(default)]
    pub storage: StorageSection,
}

/// Server configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Address the TLS listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Host written into pairing payloads
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,

    /// Human-facing server name
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Wall-clock budget for receiving one request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum request header bytes
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Maximum request body bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Sliding rate-limit window, in seconds
    #[serde(default = "default_rate_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Requests admitted per token per window
    #[serde(default = "default_rate_max_requests")]
    pub rate_limit_max_requests: usize,

    /// Whether to advertise over mDNS
    #[serde(default = "default_true")]
    pub enable_discovery: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertised_host: default_advertised_host(),
            device_name: default_device_name(),
            request_timeout_secs: default_request_timeout_secs(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
            rate_limit_window_secs: default_rate_window_secs(),
            rate_limit_max_requests: default_rate_max_requests(),
            enable_discovery: default_true(),
        }
    }
}

/// Pairing configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSection {
    /// Characters per pairing code
    #[serde(default = "default_code_length")]
    pub code_length: usize,

    /// Pairing-code lifetime, in seconds
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,

    /// Wrong submissions tolerated before lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Bearer-token lifetime, in days
    #[serde(default = "default_token_ttl_days")]
    pub token_ttl_days: u64,

    /// Certificate validity, in days
    #[serde(default = "default_cert_validity_days")]
    pub certificate_validity_days: u32,
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            code_ttl_secs: default_code_ttl_secs(),
            max_attempts: default_max_attempts(),
            token_ttl_days: default_token_ttl_days(),
            certificate_validity_days: default_cert_validity_days(),
        }
    }
}

/// Storage paths section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageSection {
    /// Data directory; defaults to the platform data dir
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8471".parse().expect("valid default bind address")
}

fn default_advertised_host() -> String {
    "localhost".to_string()
}

fn default_device_name() -> String {
    "VitaLink Server".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_header_bytes() -> usize {
    16 * 1024
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_rate_max_requests() -> usize {
    60
}

fn default_true() -> bool {
    true
}

fn default_code_length() -> usize {
    8
}

fn default_code_ttl_secs() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    5
}

fn default_token_ttl_days() -> u64 {
    30
}

fn default_cert_validity_days() -> u32 {
    365
}

impl Config {
    /// Load configuration from a file, or defaults when it does not exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path(),
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Default configuration file location
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vitalink")
            .join("config.toml")
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vitalink")
        })
    }

    /// Path of the paired-device database
    pub fn devices_db_path(&self) -> PathBuf {
        self.data_dir().join("devices.db")
    }

    /// Create the data directory if needed
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(self.data_dir())
            .with_context(|| format!("creating data directory {}", self.data_dir().display()))
    }

    /// Protocol-level server configuration
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.server.bind_addr,
            advertised_host: self.server.advertised_host.clone(),
            device_name: self.server.device_name.clone(),
            limits: RequestLimits {
                max_header_bytes: self.server.max_header_bytes,
                max_body_bytes: self.server.max_body_bytes,
            },
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            start_timeout: Duration::from_secs(5),
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(self.server.rate_limit_window_secs),
                max_requests: self.server.rate_limit_max_requests,
            },
            enable_discovery: self.server.enable_discovery,
        }
    }

    /// Protocol-level pairing configuration
    pub fn pairing_config(&self) -> PairingConfig {
        PairingConfig {
            code_length: self.pairing.code_length,
            code_ttl: Duration::from_secs(self.pairing.code_ttl_secs),
            max_attempts: self.pairing.max_attempts,
            token_ttl: Duration::from_secs(self.pairing.token_ttl_days * 24 * 60 * 60),
            ..PairingConfig::default()
        }
    }

    /// Identity store configuration rooted in the data directory
    pub fn identity_config(&self) -> IdentityConfig {
        let mut config = IdentityConfig::new(
            self.data_dir().join("identity"),
            &self.server.device_name,
        );
        config.validity_days = self.pairing.certificate_validity_days;
        config
    }
}
