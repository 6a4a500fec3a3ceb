// ABOUTME: The physical data channel the client channel multiplexes onto.
// ABOUTME: Trait seam plus an mpsc-backed adapter for bridging to a transport task.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// An ordered, reliable, message-bounded connection.
///
/// Each `send` carries exactly one encoded frame.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one frame. Waits until the transport has accepted it.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// A data channel that forwards frames into an mpsc channel.
///
/// The receiving half is typically drained by the task that owns the real
/// connection.
#[derive(Debug, Clone)]
pub struct MpscDataChannel {
    inner: mpsc::Sender<Bytes>,
}

impl MpscDataChannel {
    pub fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self { inner: sender }
    }

    /// Create a data channel and the receiver its frames are forwarded to.
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[async_trait]
impl DataChannel for MpscDataChannel {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.inner
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
