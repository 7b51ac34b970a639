//! Plain TCP or TLS byte stream.
//!
//! `TcpConnectionStream` lets the connection treat both transports the same;
//! the TLS variant additionally exposes what ALPN negotiated.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Represents a connection which can be either plain TCP or secured with TLS.
pub enum TcpConnectionStream {
    /// A plain TCP connection.
    Tcp(TcpStream),
    /// A secure TLS connection built on top of a TCP stream.
    Tls(TlsStream<TcpStream>),
}

impl TcpConnectionStream {
    pub fn new_tcp(stream: TcpStream) -> Self {
        TcpConnectionStream::Tcp(stream)
    }

    pub fn new_tls(stream: TlsStream<TcpStream>) -> Self {
        TcpConnectionStream::Tls(stream)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, TcpConnectionStream::Tls(_))
    }

    /// Application protocol agreed during the TLS handshake, if any.
    ///
    /// Always `None` for plain TCP.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            TcpConnectionStream::Tcp(_) => None,
            TcpConnectionStream::Tls(stream) => stream.get_ref().1.alpn_protocol(),
        }
    }

    /// The underlying socket, for socket options and addresses.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            TcpConnectionStream::Tcp(stream) => stream,
            TcpConnectionStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for TcpConnectionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpConnectionStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TcpConnectionStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnectionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TcpConnectionStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TcpConnectionStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpConnectionStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            TcpConnectionStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    /// Sends FIN (TCP) or close_notify (TLS).
    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpConnectionStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TcpConnectionStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
