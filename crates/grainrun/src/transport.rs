//! # Transport Abstraction
//!
//! Moves whole frames between two endpoints.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about calls, servants or
//!   heartbeats. It moves opaque buffers with message boundaries preserved.
//! - **Full Duplex**: `send` and `recv` may be used concurrently from different
//!   tasks. A single receive loop owns `recv`; any task may `send`.

use std::net::SocketAddr;

use grainrpc::RpcError;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<RpcError> for TransportError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::FrameTooLarge { len, max } => Self::PayloadTooLarge { len, max },
            RpcError::Io(io) => match io.kind() {
                std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof => Self::ConnectionLost(io.to_string()),
                _ => Self::Io(io.to_string()),
            },
            other => Self::Io(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame, or `None` once the peer closed the stream.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending half. Pending `recv` calls observe the peer's reaction.
    async fn close(&self) {}

    /// Human readable peer description for logs.
    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

/// Length-prefixed frames over a TCP stream.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> Self {
        let peer = stream.peer_addr().ok();
        // Frames are small and latency matters more than throughput.
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            max_frame_len,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        grainrpc::write_frame(&mut *writer, payload, self.max_frame_len).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        Ok(grainrpc::read_frame(&mut *reader, self.max_frame_len).await?)
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn peer(&self) -> String {
        match self.peer {
            Some(addr) => addr.to_string(),
            None => "tcp".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = TcpTransport::new(stream, 1024);
            let frame = transport.recv().await.unwrap().unwrap();
            transport.send(&frame).await.unwrap();
            transport.close().await;
        });

        let client = TcpTransport::new(TcpStream::connect(addr).await.unwrap(), 1024);
        client.send(b"echo").await.unwrap();

        assert_eq!(client.recv().await.unwrap(), Some(b"echo".to_vec()));
        assert_eq!(client.recv().await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_send_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpTransport::new(TcpStream::connect(addr).await.unwrap(), 8);

        let result = client.send(&[0u8; 9]).await;
        assert!(matches!(result, Err(TransportError::PayloadTooLarge { len: 9, max: 8 })));
    }
}
