//! The duplex byte-stream abstraction owned by the multiplexer.
//!
//! Each call resolves exactly once: `Ok` when the operation completed,
//! [`TransportError::Stopped`] when it was cancelled by the application, and
//! any other error when it failed. The multiplexer latches the first
//! non-`Ok` outcome as the connection's terminal state.

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::constants::IO_TIMEOUT;

/// An error from a transport operation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The operation was cancelled by the application.
    #[error("the operation was cancelled")]
    Stopped,

    /// The operation did not complete within [`IO_TIMEOUT`].
    #[error("the operation timed out")]
    Timeout,

    /// An underlying IO error, including the peer closing mid-frame.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A duplex byte stream.
#[async_trait]
pub trait Transport: Send {
    /// Fills `buf` exactly.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Writes all of `buf`.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Waits until a read is likely to make progress, without a deadline.
    ///
    /// This is the idle wait between a peer's requests; unlike the calls
    /// above it is bounded only by cancellation.
    async fn wait_readable(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// A readiness hint: bytes known to be waiting. Transports that cannot
    /// peek may always return 0.
    fn available_ingress(&self) -> usize {
        0
    }

    /// Closes the stream.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A TCP-backed transport with [`IO_TIMEOUT`] applied to every bounded call.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps an established TCP stream.
    pub fn new(stream: TcpStream) -> Self {
        TcpTransport { stream }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match timeout(IO_TIMEOUT, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match timeout(IO_TIMEOUT, self.stream.write_all(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn wait_readable(&mut self) -> Result<(), TransportError> {
        self.stream.readable().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
