pub mod io;
pub mod stream;
pub mod tls;

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;

use crate::connection::error::{ConnectionError, Result};

pub use self::io::{CloseHook, IoStream};
pub use self::stream::TcpConnectionStream;

/// Opens byte streams for a [`Connection`](crate::Connection).
///
/// `tls` is `Some` exactly when the destination is a secure endpoint; the
/// transport must then complete the handshake before returning.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<Self::Stream>;
}

/// TCP, optionally wrapped in rustls.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle `TCP_NODELAY` on new sockets (default: on)
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpConnectionStream;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<TcpConnectionStream> {
        // 1) TCP, any address family the resolver returns
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(self.nodelay)?;

        let Some(config) = tls else {
            return Ok(TcpConnectionStream::new_tcp(tcp));
        };

        // 2) Handshake
        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| ConnectionError::HostResolutionFailed(host.to_string()))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectionError::TlsError(e.to_string()))?;
        let stream = TcpConnectionStream::new_tls(tls_stream);

        // 3) No fallback to anything but h2
        tls::check_alpn(stream.alpn_protocol())?;
        info!(host, port, "TLS established with ALPN h2");

        Ok(stream)
    }
}
