//! TLS policy for secure endpoints.
//!
//! Only port 443 is treated as secure. The client config is deliberately
//! narrow: TLS 1.2/1.3 only, ECDHE key exchange with AES-GCM, and `h2` as the
//! only ALPN protocol. rustls never negotiates TLS compression.

use std::io::{BufReader, Cursor};
use std::sync::Arc;

use rustls::crypto::ring::{cipher_suite, default_provider};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
use rustls_pemfile::Item;
use webpki_roots::TLS_SERVER_ROOTS;

use crate::config::ConnectionConfig;
use crate::connection::error::{ConnectionError, Result};
use crate::debug_log;

/// Port that implies a TLS endpoint.
pub const SECURE_PORT: u16 = 443;

/// The only application protocol we offer.
pub const ALPN_H2: &[u8] = b"h2";

/// Whether connections to `port` negotiate TLS.
pub fn requires_tls(port: u16) -> bool {
    port == SECURE_PORT
}

/// AEAD suites with ECDHE key exchange.
pub fn aead_cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

/// The ring provider narrowed to [`aead_cipher_suites`].
pub fn aead_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: aead_cipher_suites(),
        ..default_provider()
    }
}

/// Build the client config for a secure endpoint.
///
/// Trusts `root_cert_pem` when given, otherwise the bundled webpki roots.
pub fn client_config(root_cert_pem: Option<&[u8]>) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();

    if let Some(pem) = root_cert_pem {
        let mut reader = BufReader::new(Cursor::new(pem));
        let certs = rustls_pemfile::read_all(&mut reader).filter_map(|item| match item {
            Ok(Item::X509Certificate(cert)) => Some(cert),
            _ => None,
        });
        let (added, _ignored) = root_store.add_parsable_certificates(certs);
        debug_log!("Added {} certificates, ignored {}", added, _ignored);
        if added == 0 {
            return Err(ConnectionError::TlsError(
                "no usable certificate in the configured root PEM".to_string(),
            ));
        }
    } else {
        root_store.extend(TLS_SERVER_ROOTS.iter().cloned());
    }

    let mut config = ClientConfig::builder_with_provider(Arc::new(aead_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ConnectionError::TlsError(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

/// TLS parameters for `config`'s destination, `None` for plaintext.
pub fn client_config_for(config: &ConnectionConfig) -> Result<Option<Arc<ClientConfig>>> {
    if !requires_tls(config.port) {
        return Ok(None);
    }
    client_config(config.root_cert_pem.as_deref()).map(|c| Some(Arc::new(c)))
}

/// Reject a handshake that did not settle on `h2`.
pub fn check_alpn(negotiated: Option<&[u8]>) -> Result<()> {
    match negotiated {
        Some(protocol) if protocol == ALPN_H2 => Ok(()),
        Some(other) => Err(ConnectionError::TlsError(format!(
            "peer negotiated {:?} instead of h2",
            String::from_utf8_lossy(other)
        ))),
        None => Err(ConnectionError::TlsError("peer did not negotiate h2 via ALPN".to_string())),
    }
}
