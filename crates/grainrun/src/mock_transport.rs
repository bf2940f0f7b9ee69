//! In-memory transports for tests and in-process wiring.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A duplex channel transport using tokio mpsc channels.
///
/// Messages sent via send() appear on the peer's recv() and vice versa.
/// Closing either side ends the peer's stream.
pub struct DuplexChannelTransport {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl DuplexChannelTransport {
    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: std::sync::Mutex::new(Some(tx_a)),
            rx: Arc::new(Mutex::new(rx_b)),
        };

        let b = Self {
            tx: std::sync::Mutex::new(Some(tx_b)),
            rx: Arc::new(Mutex::new(rx_a)),
        };

        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let Some(tx) = self.sender() else {
            return Err(TransportError::ConnectionLost("Channel closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    fn peer(&self) -> String {
        "in-memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, b) = DuplexChannelTransport::pair();
        a.send(b"one").await.unwrap();
        a.close().await;

        assert_eq!(b.recv().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(a.send(b"two").await.is_err());
    }
}
