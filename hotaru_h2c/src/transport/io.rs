//! Live transport handle.
//!
//! An `IoStream` owns a connected byte stream through two tasks:
//!
//! - the reader hands every partial read to `on_data` as soon as it arrives
//!   (frame reassembly is the engine's job, not ours)
//! - the writer drains an ordered queue of outbound buffers
//!
//! Either task reports the end of the stream through `on_close` exactly as it
//! saw it: `None` for an orderly EOF from the peer, `Some(err)` for a failure.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::error::{ConnectionError, Result};
use crate::debug_log;

/// Close notification. Invoked at most once per failing task.
pub type CloseHook = Arc<dyn Fn(Option<io::Error>) + Send + Sync>;

pub struct IoStream {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    reader: Option<JoinHandle<()>>,
}

impl IoStream {
    /// Split `stream` and start the reader and writer tasks.
    ///
    /// Reads are issued `chunk_size` bytes at a time.
    pub fn spawn<S, D>(stream: S, chunk_size: usize, mut on_data: D, on_close: CloseHook) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        D: FnMut(Bytes) + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut queue) = mpsc::unbounded_channel::<Bytes>();
        let chunk_size = chunk_size.max(1);

        let reader_close = on_close.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; chunk_size];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug_log!("Transport reached EOF");
                        reader_close(None);
                        break;
                    }
                    Ok(n) => on_data(Bytes::copy_from_slice(&buf[..n])),
                    Err(err) => {
                        reader_close(Some(err));
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(data) = queue.recv().await {
                debug_log!("Flushing {} bytes to transport", data.len());
                let written = match write_half.write_all(&data).await {
                    Ok(()) => write_half.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = written {
                    on_close(Some(err));
                    return;
                }
            }
            // Queue closed: the connection is done with this transport.
            if let Err(err) = write_half.shutdown().await {
                warn!(error = %err, "Error shutting down transport");
            }
        });

        Self {
            outbound: Some(outbound),
            reader: Some(reader),
        }
    }

    /// Queue `data` behind everything written before it.
    pub fn write(&self, data: Bytes) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
        outbound.send(data).map_err(|_| ConnectionError::ConnectionClosed)
    }

    /// Stop reading and shut the write side down once queued bytes are out.
    ///
    /// Closing twice fails with `ConnectionClosed`.
    pub fn close(&mut self) -> Result<()> {
        let outbound = self.outbound.take().ok_or(ConnectionError::ConnectionClosed)?;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        drop(outbound);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

impl Drop for IoStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
