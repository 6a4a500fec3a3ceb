// ABOUTME: Client channel that multiplexes many gRPC streams over one data channel.
// ABOUTME: Assigns stream ids, writes request frames, and routes responses back by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use prost::Message;
use rtc_proto::{request, Request, RequestHeaders, RequestMessage, Response};
use tokio_util::sync::CancellationToken;

use crate::client_stream::ClientStream;
use crate::error::{StreamError, TransportError};
use crate::metadata::Metadata;
use crate::stream::{DEFAULT_CHANNEL_BUFFER, DEFAULT_MAX_MESSAGE_SIZE};
use crate::transport::DataChannel;

/// Largest message the data channel transport accepts.
pub const DEFAULT_MAX_TRANSPORT_MESSAGE_SIZE: usize = 65535;

/// Configuration for a client channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Hard ceiling on one transport message, envelope included.
    pub max_transport_message_size: usize,
    /// Upper bound on one reassembled response message.
    pub max_message_size: usize,
    /// Completed messages buffered per stream before dispatch waits.
    pub message_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_transport_message_size: DEFAULT_MAX_TRANSPORT_MESSAGE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport's message size ceiling.
    pub fn with_max_transport_message_size(mut self, size: usize) -> Self {
        self.max_transport_message_size = size;
        self
    }

    /// Set the largest response message a stream will reassemble.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the per-stream delivery buffer.
    pub fn with_message_buffer(mut self, buffer: usize) -> Self {
        self.message_buffer = buffer;
        self
    }
}

/// Per-stream limits derived from a [`ChannelConfig`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamSettings {
    pub max_packet_data_size: usize,
    pub max_message_size: usize,
    pub message_buffer: usize,
}

/// Options for a single call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cancelling this token cancels the call.
    pub parent: CancellationToken,
    /// Deadline for the whole call, also sent to the server.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tie the call to an existing cancellation scope.
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outbound half of the channel as seen by one stream.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    async fn write_headers(
        &self,
        stream_id: u64,
        headers: RequestHeaders,
    ) -> Result<(), TransportError>;

    async fn write_message(&self, stream_id: u64, msg: RequestMessage)
        -> Result<(), TransportError>;

    /// Ask the server to drop the stream.
    async fn write_reset(&self, stream_id: u64) -> Result<(), TransportError>;
}

struct ChannelInner {
    transport: Arc<dyn DataChannel>,
    settings: StreamSettings,
    streams: Mutex<HashMap<u64, Arc<ClientStream>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ChannelInner {
    fn streams(&self) -> MutexGuard<'_, HashMap<u64, Arc<ClientStream>>> {
        self.streams.lock().expect("lock poisoned")
    }

    async fn write_request(&self, request: Request) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.transport
            .send(Bytes::from(request.encode_to_vec()))
            .await
    }
}

#[async_trait]
impl StreamWriter for ChannelInner {
    async fn write_headers(
        &self,
        stream_id: u64,
        headers: RequestHeaders,
    ) -> Result<(), TransportError> {
        self.write_request(Request::new(stream_id, request::Type::Headers(headers)))
            .await
    }

    async fn write_message(
        &self,
        stream_id: u64,
        msg: RequestMessage,
    ) -> Result<(), TransportError> {
        self.write_request(Request::new(stream_id, request::Type::Message(msg)))
            .await
    }

    async fn write_reset(&self, stream_id: u64) -> Result<(), TransportError> {
        self.write_request(Request::new(stream_id, request::Type::RstStream(true)))
            .await
    }
}

/// Streams hold the channel weakly so the channel's stream table does not
/// keep itself alive.
struct WeakWriter(Weak<ChannelInner>);

#[async_trait]
impl StreamWriter for WeakWriter {
    async fn write_headers(
        &self,
        stream_id: u64,
        headers: RequestHeaders,
    ) -> Result<(), TransportError> {
        let inner = self.0.upgrade().ok_or(TransportError::Closed)?;
        inner.write_headers(stream_id, headers).await
    }

    async fn write_message(
        &self,
        stream_id: u64,
        msg: RequestMessage,
    ) -> Result<(), TransportError> {
        let inner = self.0.upgrade().ok_or(TransportError::Closed)?;
        inner.write_message(stream_id, msg).await
    }

    async fn write_reset(&self, stream_id: u64) -> Result<(), TransportError> {
        let inner = self.0.upgrade().ok_or(TransportError::Closed)?;
        inner.write_reset(stream_id).await
    }
}

/// Client side of a data channel carrying gRPC calls.
///
/// Cloning is cheap; clones share the same stream table.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ChannelInner>,
}

impl ClientChannel {
    /// Create a client channel over `transport`.
    ///
    /// The largest packet payload is derived here, once, from the
    /// transport's message size ceiling.
    pub fn new(transport: Arc<dyn DataChannel>, config: ChannelConfig) -> Self {
        let max_packet_data_size =
            rtc_proto::max_request_packet_data_size(config.max_transport_message_size);
        tracing::debug!(
            max_transport_message_size = config.max_transport_message_size,
            max_packet_data_size,
            "client channel created"
        );
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                settings: StreamSettings {
                    max_packet_data_size,
                    max_message_size: config.max_message_size,
                    message_buffer: config.message_buffer,
                },
                streams: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Payload bytes carried by each outgoing packet at most.
    pub fn max_packet_data_size(&self) -> usize {
        self.inner.settings.max_packet_data_size
    }

    /// Start a call to `method` and send its request headers.
    ///
    /// Must be called within a tokio runtime: a task per stream watches for
    /// cancellation and the call's timeout.
    pub async fn new_stream(
        &self,
        method: &str,
        metadata: &Metadata,
        options: CallOptions,
    ) -> Result<Arc<ClientStream>, StreamError> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let table = Arc::downgrade(&self.inner);
        let stream = Arc::new(ClientStream::new(
            id,
            &options.parent,
            Arc::new(WeakWriter(Arc::downgrade(&self.inner))),
            self.inner.settings,
            Box::new(move |id| {
                if let Some(inner) = table.upgrade() {
                    inner.streams().remove(&id);
                }
            }),
        ));
        self.inner.streams().insert(id, Arc::clone(&stream));
        spawn_watcher(Arc::clone(&stream), options.timeout);

        tracing::debug!(stream_id = id, method = %method, "starting stream");
        stream
            .write_headers(RequestHeaders {
                method: method.to_string(),
                metadata: Some(metadata.to_proto()),
                timeout: options.timeout.map(Into::into),
            })
            .await?;
        Ok(stream)
    }

    /// Handle one frame received from the data channel.
    ///
    /// Undecodable frames and frames for unknown streams are dropped.
    pub async fn on_message(&self, frame: &[u8]) {
        let resp = match Response::decode(frame) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode response frame");
                return;
            }
        };

        let id = resp.stream_id();
        let stream = self.inner.streams().get(&id).cloned();
        let Some(stream) = stream else {
            tracing::debug!(stream_id = id, "no active stream for response");
            return;
        };

        if let Err(violation) = stream.on_response(resp).await {
            tracing::warn!(stream_id = id, error = %violation, "protocol violation, stream closed");
        }
    }

    /// Dispatch every frame from `incoming` in order, then close the channel
    /// once the source ends.
    pub async fn dispatch_from<S>(&self, mut incoming: S)
    where
        S: Stream<Item = Bytes> + Unpin,
    {
        while let Some(frame) = incoming.next().await {
            self.on_message(&frame).await;
        }
        tracing::debug!("data channel ended");
        self.close();
    }

    /// Close the channel and every active stream. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let streams: Vec<_> = self.inner.streams().drain().map(|(_, s)| s).collect();
        tracing::debug!(active_streams = streams.len(), "closing client channel");
        for stream in streams {
            stream
                .base()
                .close_with_recv_error(Some(TransportError::Closed.into()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of streams that have not yet finished.
    pub fn active_streams(&self) -> usize {
        self.inner.streams().len()
    }
}

/// Close the stream when its scope is cancelled from outside or its timeout
/// elapses, and tell the server to drop it.
fn spawn_watcher(stream: Arc<ClientStream>, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = stream.base().token().cancelled() => {
                // a send may already have closed the stream with the cancellation
                if stream.needs_reset() {
                    stream.abort(StreamError::Cancelled).await;
                }
            }
            _ = deadline => {
                if !stream.is_done() {
                    stream.abort(StreamError::DeadlineExceeded).await;
                }
            }
        }
    });
}
