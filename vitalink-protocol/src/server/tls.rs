//! TLS configuration
//!
//! Both sides of a VitaLink connection present self-signed certificates.
//! The acceptor pins the protocol to TLS 1.3 and demands a client
//! certificate, but accepts any leaf the client presents: possession of a
//! key is required, while identity proof comes from the bearer token plus
//! the certificate fingerprint verified out-of-band during pairing. There
//! is no CA chain to walk.

use crate::{Result, TlsIdentity};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use tracing::debug;

/// Build the server-side acceptor for the given identity
pub(crate) fn server_acceptor(identity: &TlsIdentity) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_modern_v5(SslMethod::tls_server())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;

    let cert = X509::from_der(&identity.certificate)?;
    let pkey = PKey::private_key_from_der(identity.private_key_der())?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    // Mutual authentication: a client certificate is mandatory, but any
    // self-signed leaf passes. Authorization happens at the request layer.
    builder.set_verify_callback(
        SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        |_preverified, _ctx| true,
    );

    debug!("TLS acceptor configured (TLS 1.3, client certificate required)");
    Ok(builder.build())
}

/// Build a client-side connector presenting the given identity
///
/// Used by pairing clients and by the test suite. Server verification is
/// disabled at the TLS layer; callers compare the fingerprint from the
/// pairing payload instead.
pub fn client_connector(identity: &TlsIdentity) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_verify(SslVerifyMode::NONE);

    let cert = X509::from_der(&identity.certificate)?;
    let pkey = PKey::private_key_from_der(identity.private_key_der())?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}
