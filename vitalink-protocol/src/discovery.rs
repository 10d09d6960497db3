//! Local-network discovery
//!
//! The server advertises itself over mDNS under a fixed service type so
//! paired clients on the same network can find it without configuration.
//! Discovery is advisory only: the pairing payload carries the
//! authoritative host and port, and a client that cannot resolve the
//! advertisement falls back to those.

use crate::{ProtocolError, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info};

/// Fixed mDNS service type for VitaLink servers
pub const SERVICE_TYPE: &str = "_vitalink._tcp.local.";

/// Number of fingerprint characters exposed as a TXT hint
///
/// Enough for a client to pre-check it found the right server; the full
/// fingerprint is still verified from the pairing payload.
const FINGERPRINT_HINT_LEN: usize = 23;

/// A registered advertisement; dropping it does NOT unregister,
/// call [`DiscoveryHandle::shutdown`]
pub struct DiscoveryHandle {
    daemon: ServiceDaemon,
    fullname: String,
}

impl DiscoveryHandle {
    /// Withdraw the advertisement and stop the mDNS daemon
    pub fn shutdown(self) {
        debug!("Withdrawing mDNS advertisement {}", self.fullname);
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }

    /// Full mDNS service name as registered
    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

/// Advertise a running server on the local network
pub fn advertise(instance_name: &str, port: u16, fingerprint: &str) -> Result<DiscoveryHandle> {
    let daemon =
        ServiceDaemon::new().map_err(|e| ProtocolError::Discovery(e.to_string()))?;

    let hostname = format!("{}.local.", sanitize_instance_name(instance_name));
    let hint: String = fingerprint.chars().take(FINGERPRINT_HINT_LEN).collect();
    let properties = [("fp", hint.as_str())];

    let service = ServiceInfo::new(
        SERVICE_TYPE,
        instance_name,
        &hostname,
        "",
        port,
        &properties[..],
    )
    .map_err(|e| ProtocolError::Discovery(e.to_string()))?
    .enable_addr_auto();

    let fullname = service.get_fullname().to_string();
    daemon
        .register(service)
        .map_err(|e| ProtocolError::Discovery(e.to_string()))?;

    info!("Advertising {} on port {}", fullname, port);

    Ok(DiscoveryHandle { daemon, fullname })
}

fn sanitize_instance_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "vitalink".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_is_fixed() {
        assert_eq!(SERVICE_TYPE, "_vitalink._tcp.local.");
        assert!(SERVICE_TYPE.ends_with("._tcp.local."));
    }

    #[test]
    fn test_sanitize_instance_name() {
        assert_eq!(sanitize_instance_name("My Server #1"), "My-Server--1");
        assert_eq!(sanitize_instance_name(""), "vitalink");
    }
}
