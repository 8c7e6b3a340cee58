//! TLS acceptor/connector configuration shared by both roles of the
//! channel upgrade.
//!
//! Uses OpenSSL directly (rather than `rustls`) so the version range can
//! be widened down to TLS 1.0 for compatibility with older KDE Connect
//! peers, matching the cipher suites the reference daemon offers.

use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;

use crate::error::Result;

const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

/// Build the TLS server (acceptor) side of the handshake. Used by the
/// peer that initiated the TCP connection, per the role convention in
/// [`crate::transport::channel`].
pub fn create_server_config(cert: &X509, key: &PKey<Private>) -> Result<Arc<SslAcceptor>> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;

    // TOFU: no peer certificate verification at the TLS layer. Pinning
    // against a remembered certificate happens at the application layer
    // after the handshake completes.
    builder.set_verify(SslVerifyMode::NONE);

    builder.set_certificate(cert)?;
    builder.set_private_key(key)?;

    Ok(Arc::new(builder.build()))
}

/// Build the TLS client (connector) side of the handshake. Used by the
/// peer that accepted the TCP connection.
pub fn create_client_config(cert: &X509, key: &PKey<Private>) -> Result<Arc<SslConnector>> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;

    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;
    builder.set_verify(SslVerifyMode::NONE);

    builder.set_certificate(cert)?;
    builder.set_private_key(key)?;

    Ok(Arc::new(builder.build()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalCertificate;

    #[test]
    fn server_and_client_configs_build() {
        let local = LocalCertificate::generate("test-device").unwrap();
        assert!(create_server_config(&local.certificate, &local.private_key).is_ok());
        assert!(create_client_config(&local.certificate, &local.private_key).is_ok());
    }
}
