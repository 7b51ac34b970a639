//! Connection configuration.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

use http::Uri;

use crate::connection::error::{ConnectionError, Result};
use crate::transport::tls;

/// Where to connect and how long to wait.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Target host (domain or IP address)
    pub host: String,
    /// Target port. 443 implies TLS.
    pub port: u16,
    /// Deadline for transport connect plus TLS handshake (default: 30 seconds)
    pub connect_timeout: Duration,
    /// Largest single read handed to the engine (default: 65535)
    pub read_chunk_size: usize,
    /// Custom trust anchors in PEM form, replacing the webpki roots
    pub root_cert_pem: Option<Vec<u8>>,
}

impl ConnectionConfig {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_READ_CHUNK_SIZE: usize = 65535;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            read_chunk_size: Self::DEFAULT_READ_CHUNK_SIZE,
            root_cert_pem: None,
        }
    }

    /// Take host and port from an `http://` or `https://` URL.
    ///
    /// A missing port defaults to 443 for `https` and 80 for `http`. The path
    /// is ignored.
    pub fn from_url(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ConnectionError::InvalidUrl(format!("{}: {}", url, e)))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ConnectionError::InvalidUrl("URL must include a scheme".to_string()))?;
        let authority = uri
            .authority()
            .ok_or_else(|| ConnectionError::InvalidUrl("URL must include an authority".to_string()))?;

        let default_port = match scheme {
            "https" => tls::SECURE_PORT,
            "http" => 80,
            other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
        };
        let port = authority.port_u16().unwrap_or(default_port);
        // Sockets and TLS server names take IPv6 literals without brackets.
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');

        Ok(Self::new(host, port))
    }

    /// Set maximum time to wait for connection establishment
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read size; values below 1 are raised to 1
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Trust the certificates in `pem` instead of the bundled roots
    pub fn root_certificate_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_cert_pem = Some(pem.into());
        self
    }

    /// Load a custom root CA certificate from a PEM file for TLS connections
    pub fn root_certificate(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(ConnectionError::IoError)?;
        let mut buf = Vec::new();
        BufReader::new(file).read_to_end(&mut buf).map_err(ConnectionError::IoError)?;
        self.root_cert_pem = Some(buf);
        Ok(self)
    }

    /// Whether this destination is negotiated over TLS.
    pub fn uses_tls(&self) -> bool {
        tls::requires_tls(self.port)
    }
}
