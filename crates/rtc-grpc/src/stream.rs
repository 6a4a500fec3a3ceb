// ABOUTME: Transport-agnostic bookkeeping shared by every logical stream.
// ABOUTME: Packet reassembly, the delivery channel of completed messages, and the single close path.

use std::sync::{Mutex, OnceLock};

use bytes::{Bytes, BytesMut};
use prost::Message;
use rtc_proto::PacketMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::latch::Latch;

/// Default buffer size for the completed-message delivery channel.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// Default upper bound on one reassembled message (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 25;

/// Called with the stream id once the stream reaches a terminal state.
pub type OnDone = Box<dyn FnOnce(u64) + Send + 'static>;

/// Shared state of one logical stream.
///
/// `process_message` must only be called from the stream's dispatch path.
/// Everything else may be used from any task.
pub struct BaseStream {
    id: u64,
    token: CancellationToken,
    max_message_size: usize,
    buffer: Mutex<BytesMut>,
    msg_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    msg_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    // Outer `Some` once closed; inner `None` means a clean end of stream.
    terminal: OnceLock<Option<StreamError>>,
    closed: Latch,
    on_done: Mutex<Option<OnDone>>,
}

impl BaseStream {
    /// Create a stream whose scope is a child of `parent`.
    pub fn new(
        id: u64,
        parent: &CancellationToken,
        message_buffer: usize,
        max_message_size: usize,
        on_done: OnDone,
    ) -> Self {
        let (tx, rx) = mpsc::channel(message_buffer.max(1));
        Self {
            id,
            token: parent.child_token(),
            max_message_size,
            buffer: Mutex::new(BytesMut::new()),
            msg_tx: Mutex::new(Some(tx)),
            msg_rx: tokio::sync::Mutex::new(rx),
            terminal: OnceLock::new(),
            closed: Latch::new(),
            on_done: Mutex::new(Some(on_done)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The stream's cancellable scope.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Append a packet to the reassembly buffer.
    ///
    /// Returns the complete message when the packet ends it. A message that
    /// outgrows the size limit closes the stream and yields `None`.
    pub fn process_message(&self, packet: PacketMessage) -> Option<Bytes> {
        let mut buffer = self.buffer.lock().expect("lock poisoned");
        let size = buffer.len() + packet.data.len();
        if size > self.max_message_size {
            buffer.clear();
            drop(buffer);
            self.close_with_recv_error(Some(StreamError::MessageTooLarge {
                size,
                max: self.max_message_size,
            }));
            return None;
        }
        buffer.extend_from_slice(&packet.data);
        if !packet.eom {
            return None;
        }
        Some(buffer.split().freeze())
    }

    /// Push a completed message to the receive side.
    ///
    /// Waits for buffer space. Returns `false` if the stream closed first.
    pub async fn deliver(&self, message: Bytes) -> bool {
        let tx = self.msg_tx.lock().expect("lock poisoned").clone();
        let Some(tx) = tx else {
            return false;
        };
        tokio::select! {
            res = tx.send(message) => res.is_ok(),
            _ = self.token.cancelled() => false,
        }
    }

    /// Receive the next complete message.
    ///
    /// Buffered messages are always drained first. After that, `Ok(None)`
    /// marks a clean end of stream; otherwise the terminal error is returned.
    pub async fn recv_raw(&self) -> Result<Option<Bytes>, StreamError> {
        let mut rx = self.msg_rx.lock().await;
        match rx.recv().await {
            Some(message) => Ok(Some(message)),
            None => match self.err() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Receive and decode the next message.
    pub async fn recv_msg<M: Message + Default>(&self) -> Result<Option<M>, StreamError> {
        let Some(bytes) = self.recv_raw().await? else {
            return Ok(None);
        };
        match M::decode(bytes) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                let err = StreamError::from(e);
                self.close_with_recv_error(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Close the stream. The first call wins; later calls are no-ops.
    ///
    /// `None` is a clean end of stream. Cancels the scope, closes the
    /// delivery channel once buffered messages drain, and runs `on_done`.
    pub fn close_with_recv_error(&self, err: Option<StreamError>) {
        if self.terminal.set(err).is_err() {
            return;
        }
        match self.err() {
            Some(err) => tracing::debug!(stream_id = self.id, error = %err, "stream closed"),
            None => tracing::debug!(stream_id = self.id, "stream finished"),
        }

        self.token.cancel();
        self.msg_tx.lock().expect("lock poisoned").take();
        self.closed.release();

        let on_done = self.on_done.lock().expect("lock poisoned").take();
        if let Some(on_done) = on_done {
            on_done(self.id);
        }
    }

    /// The terminal error, if the stream closed with one.
    pub fn err(&self) -> Option<StreamError> {
        self.terminal.get().cloned().flatten()
    }

    pub fn is_done(&self) -> bool {
        self.terminal.get().is_some()
    }

    /// Resolves once the stream has been closed.
    pub async fn done(&self) {
        self.closed.wait().await
    }

    /// Error for an operation interrupted by the scope ending.
    pub(crate) fn interrupted_error(&self) -> StreamError {
        match self.terminal.get() {
            Some(Some(err)) => err.clone(),
            Some(None) => StreamError::Finished,
            None => StreamError::Cancelled,
        }
    }
}
