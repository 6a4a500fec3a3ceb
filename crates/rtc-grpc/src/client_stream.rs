// ABOUTME: Caller-facing gRPC client stream over the shared data channel.
// ABOUTME: Enforces headers -> messages -> trailers ordering and fragments outgoing messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use prost::Message;
use rtc_proto::{
    response, PacketMessage, RequestHeaders, RequestMessage, Response, ResponseHeaders,
    ResponseMessage, ResponseTrailers,
};
use tokio_util::sync::CancellationToken;

use crate::channel::{StreamSettings, StreamWriter};
use crate::context::StreamContext;
use crate::error::{FrameKind, ProtocolViolation, StreamError};
use crate::latch::Latch;
use crate::metadata::Metadata;
use crate::status;
use crate::stream::{BaseStream, OnDone};

#[derive(Debug, Default)]
struct StreamState {
    headers: Metadata,
    trailers: Metadata,
    user_ctx: Option<StreamContext>,
    trailers_received: bool,
}

/// A client stream for one unary or streaming call.
///
/// It is safe to send from one task while another receives. Sends on the same
/// stream, including `close_send`, must not run concurrently.
pub struct ClientStream {
    base: BaseStream,
    writer: Arc<dyn StreamWriter>,
    max_packet_data_size: usize,
    state: Mutex<StreamState>,
    headers_received: Latch,
    context_observed: AtomicBool,
}

impl ClientStream {
    pub(crate) fn new(
        id: u64,
        parent: &CancellationToken,
        writer: Arc<dyn StreamWriter>,
        settings: StreamSettings,
        on_done: OnDone,
    ) -> Self {
        Self {
            base: BaseStream::new(
                id,
                parent,
                settings.message_buffer,
                settings.max_message_size,
                on_done,
            ),
            writer,
            max_packet_data_size: settings.max_packet_data_size.max(1),
            state: Mutex::new(StreamState::default()),
            headers_received: Latch::new(),
            context_observed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.base.id()
    }

    /// Receive and close surface shared with every stream kind.
    pub fn base(&self) -> &BaseStream {
        &self.base
    }

    /// Send a message to the server.
    ///
    /// Returns once every packet has been accepted by the channel, the
    /// stream's scope ends, or a write fails. Any failure closes the stream.
    /// Delivery to the server is not confirmed; use the receive side to learn
    /// the call's outcome.
    pub async fn send_msg<M: Message>(&self, msg: &M) -> Result<(), StreamError> {
        self.write_message(Some(Bytes::from(msg.encode_to_vec())), false)
            .await
    }

    /// Send an already encoded message.
    pub async fn send_raw(&self, data: Bytes) -> Result<(), StreamError> {
        self.write_message(Some(data), false).await
    }

    /// Half-close the send direction.
    pub async fn close_send(&self) -> Result<(), StreamError> {
        self.write_message(None, true).await
    }

    /// Header metadata from the server. Waits until headers arrive or the
    /// stream's scope ends, in which case the scope's error is returned:
    /// `DeadlineExceeded` when the call timed out, `Cancelled` otherwise.
    pub async fn header(&self) -> Result<Metadata, StreamError> {
        tokio::select! {
            biased;
            _ = self.headers_received.wait() => Ok(self.state().headers.clone()),
            _ = self.base.token().cancelled() => match self.base.err() {
                Some(StreamError::DeadlineExceeded) => Err(StreamError::DeadlineExceeded),
                _ => Err(StreamError::Cancelled),
            },
        }
    }

    /// Trailer metadata from the server. Only complete once the receive side
    /// has reported end of stream or an error.
    pub fn trailer(&self) -> Metadata {
        self.state().trailers.clone()
    }

    /// The stream's context.
    ///
    /// Carries the header metadata once headers have arrived. Callers should
    /// read it only after `header` or a receive has returned. A layer that
    /// retries sends must stop retrying once this has been read; see
    /// [`ClientStream::context_observed`].
    pub fn context(&self) -> StreamContext {
        self.context_observed.store(true, Ordering::Release);
        let state = self.state();
        match &state.user_ctx {
            Some(ctx) => ctx.clone(),
            None => StreamContext::new(self.base.token().clone()),
        }
    }

    /// Whether `context` has been called on this stream.
    pub fn context_observed(&self) -> bool {
        self.context_observed.load(Ordering::Acquire)
    }

    /// Receive the next complete message as bytes.
    pub async fn recv_raw(&self) -> Result<Option<Bytes>, StreamError> {
        self.base.recv_raw().await
    }

    /// Receive and decode the next message. `Ok(None)` is a clean end of stream.
    pub async fn recv_msg<M: Message + Default>(&self) -> Result<Option<M>, StreamError> {
        self.base.recv_msg().await
    }

    pub fn is_done(&self) -> bool {
        self.base.is_done()
    }

    /// Resolves once the stream has closed for any reason.
    pub async fn done(&self) {
        self.base.done().await
    }

    pub(crate) async fn write_headers(&self, headers: RequestHeaders) -> Result<(), StreamError> {
        let result = self
            .writer
            .write_headers(self.id(), headers)
            .await
            .map_err(StreamError::from);
        if let Err(err) = &result {
            self.base.close_with_recv_error(Some(err.clone()));
        }
        result
    }

    /// Whether the server may still hold this stream, i.e. it did not end
    /// with trailers or by a protocol violation.
    pub(crate) fn needs_reset(&self) -> bool {
        !self.state().trailers_received
            && !matches!(self.base.err(), Some(StreamError::Protocol(_)))
    }

    /// Close the stream with `err` and tell the server to drop it.
    pub(crate) async fn abort(&self, err: StreamError) {
        self.base.close_with_recv_error(Some(err));
        if let Err(e) = self.writer.write_reset(self.id()).await {
            tracing::debug!(stream_id = self.id(), error = %e, "failed to send stream reset");
        }
    }

    async fn write_message(&self, data: Option<Bytes>, eos: bool) -> Result<(), StreamError> {
        let result = self.write_packets(data, eos).await;
        if let Err(err) = &result {
            self.base.close_with_recv_error(Some(err.clone()));
        }
        result
    }

    async fn write_packets(&self, data: Option<Bytes>, eos: bool) -> Result<(), StreamError> {
        // a message may encode to zero bytes and still be present
        let has_message = data.is_some();
        let mut data = data.unwrap_or_default();

        if data.is_empty() {
            return self
                .send_request(RequestMessage {
                    has_message,
                    packet_message: Some(PacketMessage {
                        data: Bytes::new(),
                        eom: true,
                    }),
                    eos,
                })
                .await;
        }

        while !data.is_empty() {
            let amount = self.max_packet_data_size.min(data.len());
            let chunk = data.split_to(amount);
            self.send_request(RequestMessage {
                has_message,
                packet_message: Some(PacketMessage {
                    data: chunk,
                    eom: data.is_empty(),
                }),
                eos,
            })
            .await?;
        }
        Ok(())
    }

    async fn send_request(&self, msg: RequestMessage) -> Result<(), StreamError> {
        if self.base.token().is_cancelled() {
            return Err(self.base.interrupted_error());
        }
        tokio::select! {
            biased;
            _ = self.base.token().cancelled() => Err(self.base.interrupted_error()),
            res = self.writer.write_message(self.id(), msg) => res.map_err(StreamError::from),
        }
    }

    /// Handle one inbound frame for this stream.
    ///
    /// Frames that break the headers -> messages -> trailers order close the
    /// stream; the violation is also returned to the dispatcher.
    pub async fn on_response(&self, resp: Response) -> Result<(), ProtocolViolation> {
        match resp.r#type {
            Some(response::Type::Headers(headers)) => {
                if self.state().trailers_received {
                    return Err(self.violation(ProtocolViolation::AfterTrailers(FrameKind::Headers)));
                }
                if self.headers_received.is_released() {
                    return Err(self.violation(ProtocolViolation::HeadersAlreadyReceived));
                }
                self.process_headers(headers);
            }
            Some(response::Type::Message(message)) => {
                if self.state().trailers_received {
                    return Err(self.violation(ProtocolViolation::AfterTrailers(FrameKind::Message)));
                }
                if !self.headers_received.is_released() {
                    return Err(self.violation(ProtocolViolation::HeadersNotYetReceived));
                }
                self.process_message(message).await;
            }
            Some(response::Type::Trailers(trailers)) => {
                if self.state().trailers_received {
                    return Err(self.violation(ProtocolViolation::AfterTrailers(FrameKind::Trailers)));
                }
                self.process_trailers(trailers);
            }
            None => {
                tracing::warn!(stream_id = self.id(), "unknown response type, ignoring");
            }
        }
        Ok(())
    }

    fn violation(&self, violation: ProtocolViolation) -> ProtocolViolation {
        self.base
            .close_with_recv_error(Some(StreamError::Protocol(violation.clone())));
        violation
    }

    fn process_headers(&self, headers: ResponseHeaders) {
        let metadata = headers
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default();
        {
            let mut state = self.state();
            state.user_ctx = Some(StreamContext::with_incoming(
                self.base.token().clone(),
                metadata.clone(),
            ));
            state.headers = metadata;
        }
        self.headers_received.release();
    }

    async fn process_message(&self, message: ResponseMessage) {
        let packet = message.packet_message.unwrap_or_default();
        let Some(data) = self.base.process_message(packet) else {
            return;
        };
        if !self.base.deliver(data).await {
            tracing::debug!(stream_id = self.id(), "stream closed before message delivery");
        }
    }

    fn process_trailers(&self, trailers: ResponseTrailers) {
        {
            let mut state = self.state();
            state.trailers_received = true;
            if let Some(md) = &trailers.metadata {
                state.trailers = Metadata::from_proto(md);
            }
        }
        let err = status::from_proto(trailers.status.as_ref()).map(StreamError::Status);
        self.base.close_with_recv_error(err);
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tonic::Code;

    /// Records every request written for a stream.
    #[derive(Default)]
    struct RecordingWriter {
        headers: Mutex<Vec<RequestHeaders>>,
        messages: Mutex<Vec<RequestMessage>>,
        resets: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl StreamWriter for RecordingWriter {
        async fn write_headers(
            &self,
            _stream_id: u64,
            headers: RequestHeaders,
        ) -> Result<(), TransportError> {
            self.headers.lock().unwrap().push(headers);
            Ok(())
        }

        async fn write_message(
            &self,
            _stream_id: u64,
            msg: RequestMessage,
        ) -> Result<(), TransportError> {
            let mut messages = self.messages.lock().unwrap();
            if self.fail_after.is_some_and(|n| messages.len() >= n) {
                return Err(TransportError::Closed);
            }
            messages.push(msg);
            Ok(())
        }

        async fn write_reset(&self, _stream_id: u64) -> Result<(), TransportError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const PACKET: usize = 16;

    fn settings() -> StreamSettings {
        StreamSettings {
            max_packet_data_size: PACKET,
            max_message_size: 1 << 20,
            message_buffer: 16,
        }
    }

    fn new_stream(writer: Arc<RecordingWriter>) -> ClientStream {
        ClientStream::new(1, &CancellationToken::new(), writer, settings(), Box::new(|_| {}))
    }

    fn headers_frame(md: &[(&str, &str)]) -> Response {
        let md: Metadata = md.iter().copied().collect();
        Response::new(
            1,
            response::Type::Headers(ResponseHeaders {
                metadata: Some(md.to_proto()),
            }),
        )
    }

    fn message_frame(data: &[u8], eom: bool) -> Response {
        Response::new(
            1,
            response::Type::Message(ResponseMessage {
                packet_message: Some(PacketMessage {
                    data: Bytes::copy_from_slice(data),
                    eom,
                }),
            }),
        )
    }

    fn trailers_frame(code: Code, message: &str, md: &[(&str, &str)]) -> Response {
        let md: Metadata = md.iter().copied().collect();
        Response::new(
            1,
            response::Type::Trailers(ResponseTrailers {
                status: Some(rtc_proto::Status {
                    code: code as i32,
                    message: message.to_string(),
                    details: vec![],
                }),
                metadata: Some(md.to_proto()),
            }),
        )
    }

    #[tokio::test]
    async fn test_message_before_headers_is_fatal() {
        let stream = new_stream(Arc::default());
        let err = stream.on_response(message_frame(b"x", true)).await.unwrap_err();
        assert_eq!(err, ProtocolViolation::HeadersNotYetReceived);
        assert_eq!(
            stream.recv_raw().await.unwrap_err().to_string(),
            "headers not yet received"
        );
    }

    #[tokio::test]
    async fn test_duplicate_headers_is_fatal() {
        let stream = new_stream(Arc::default());
        stream.on_response(headers_frame(&[])).await.unwrap();
        let err = stream.on_response(headers_frame(&[])).await.unwrap_err();
        assert_eq!(err.to_string(), "headers already received");
        assert!(stream.is_done());
    }

    #[tokio::test]
    async fn test_frames_after_trailers_are_rejected() {
        let stream = new_stream(Arc::default());
        stream.on_response(headers_frame(&[])).await.unwrap();
        stream
            .on_response(trailers_frame(Code::Ok, "", &[]))
            .await
            .unwrap();

        let err = stream.on_response(headers_frame(&[])).await.unwrap_err();
        assert_eq!(err.to_string(), "headers received after trailers");
        let err = stream.on_response(message_frame(b"x", true)).await.unwrap_err();
        assert_eq!(err.to_string(), "message received after trailers");
        let err = stream
            .on_response(trailers_frame(Code::Ok, "", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "trailers received after trailers");

        // the clean close recorded first is kept
        assert!(stream.recv_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trailers_without_headers_are_accepted() {
        let stream = new_stream(Arc::default());
        stream
            .on_response(trailers_frame(Code::Unavailable, "robot offline", &[]))
            .await
            .unwrap();
        let err = stream.recv_raw().await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(matches!(stream.header().await, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_header_after_clean_finish_without_headers() {
        let stream = new_stream(Arc::default());
        let trailers = Response::new(
            1,
            response::Type::Trailers(ResponseTrailers {
                status: None,
                metadata: None,
            }),
        );
        stream.on_response(trailers).await.unwrap();
        assert!(stream.recv_raw().await.unwrap().is_none());
        assert!(!stream.needs_reset());
        assert!(matches!(stream.header().await, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unknown_response_type_is_ignored() {
        let stream = new_stream(Arc::default());
        let resp = Response {
            stream: Some(rtc_proto::Stream { id: 1 }),
            r#type: None,
        };
        stream.on_response(resp).await.unwrap();
        assert!(!stream.is_done());
    }

    #[tokio::test]
    async fn test_terminal_status_and_trailer_metadata() {
        let stream = new_stream(Arc::default());
        stream.on_response(headers_frame(&[])).await.unwrap();
        stream
            .on_response(trailers_frame(Code::NotFound, "no arm", &[("k", "v")]))
            .await
            .unwrap();

        match stream.recv_raw().await {
            Err(StreamError::Status(status)) => {
                assert_eq!(status.code(), Code::NotFound);
                assert_eq!(status.message(), "no arm");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(stream.trailer().get("k"), Some("v"));
    }

    #[tokio::test]
    async fn test_messages_reassembled_in_order() {
        let stream = new_stream(Arc::default());
        stream.on_response(headers_frame(&[])).await.unwrap();
        stream.on_response(message_frame(b"ab", false)).await.unwrap();
        stream.on_response(message_frame(b"cd", true)).await.unwrap();
        stream.on_response(message_frame(b"", true)).await.unwrap();
        stream
            .on_response(trailers_frame(Code::Ok, "", &[]))
            .await
            .unwrap();

        assert_eq!(stream.recv_raw().await.unwrap().unwrap(), "abcd");
        assert!(stream.recv_raw().await.unwrap().unwrap().is_empty());
        assert!(stream.recv_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_blocks_until_headers_arrive() {
        let stream = Arc::new(new_stream(Arc::default()));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let stream = Arc::clone(&stream);
            waiters.push(tokio::spawn(async move { stream.header().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        stream.on_response(headers_frame(&[("x", "1")])).await.unwrap();
        for w in waiters {
            let md = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(md.get_all("x"), ["1"]);
        }
    }

    #[tokio::test]
    async fn test_header_returns_cancellation() {
        let parent = CancellationToken::new();
        let stream = Arc::new(ClientStream::new(
            1,
            &parent,
            Arc::new(RecordingWriter::default()),
            settings(),
            Box::new(|_| {}),
        ));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let stream = Arc::clone(&stream);
            waiters.push(tokio::spawn(async move { stream.header().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));
        parent.cancel();
        for w in waiters {
            let result = tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(StreamError::Cancelled)));
        }
        // a late caller sees the same error
        assert!(matches!(stream.header().await, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_protocol_close_needs_no_reset() {
        let stream = new_stream(Arc::default());
        assert!(stream.needs_reset());
        stream.on_response(message_frame(b"x", true)).await.unwrap_err();
        assert!(!stream.needs_reset());
    }

    #[tokio::test]
    async fn test_context_switches_after_headers() {
        let stream = new_stream(Arc::default());
        assert!(!stream.context_observed());
        assert!(stream.context().incoming_metadata().is_none());
        assert!(stream.context_observed());

        stream.on_response(headers_frame(&[("x", "1")])).await.unwrap();
        let ctx = stream.context();
        assert_eq!(ctx.incoming_metadata().unwrap().get("x"), Some("1"));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_fragments_large_message() {
        let writer = Arc::new(RecordingWriter::default());
        let stream = new_stream(Arc::clone(&writer));
        let payload: Vec<u8> = (0..(PACKET * 2 + 5) as u8).collect();

        stream.send_raw(Bytes::from(payload.clone())).await.unwrap();

        let messages = writer.messages.lock().unwrap();
        assert_eq!(messages.len(), 3);
        let mut joined = Vec::new();
        for (i, msg) in messages.iter().enumerate() {
            let packet = msg.packet_message.as_ref().unwrap();
            assert!(msg.has_message);
            assert!(!msg.eos);
            assert!(packet.data.len() <= PACKET);
            assert_eq!(packet.eom, i == 2);
            joined.extend_from_slice(&packet.data);
        }
        assert_eq!(joined, payload);
    }

    #[tokio::test]
    async fn test_fragments_reassemble_for_all_sizes() {
        for len in [0, 1, PACKET - 1, PACKET, PACKET + 1, PACKET * 10] {
            let writer = Arc::new(RecordingWriter::default());
            let stream = new_stream(Arc::clone(&writer));
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            stream.send_raw(Bytes::from(payload.clone())).await.unwrap();

            let reassembler = new_stream(Arc::default());
            let mut completed = Vec::new();
            for msg in writer.messages.lock().unwrap().iter() {
                let packet = msg.packet_message.clone().unwrap();
                if let Some(data) = reassembler.base().process_message(packet) {
                    completed.push(data);
                }
            }
            assert_eq!(completed.len(), 1, "len {len}");
            assert_eq!(&completed[0][..], &payload[..], "len {len}");
        }
    }

    #[tokio::test]
    async fn test_zero_length_message() {
        let writer = Arc::new(RecordingWriter::default());
        let stream = new_stream(Arc::clone(&writer));
        stream
            .send_msg(&rtc_proto::Stream { id: 0 })
            .await
            .unwrap();

        let messages = writer.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert!(msg.has_message);
        assert!(!msg.eos);
        let packet = msg.packet_message.as_ref().unwrap();
        assert!(packet.eom);
        assert!(packet.data.is_empty());
    }

    #[tokio::test]
    async fn test_close_send_half_closes() {
        let writer = Arc::new(RecordingWriter::default());
        let stream = new_stream(Arc::clone(&writer));
        stream.close_send().await.unwrap();

        let messages = writer.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert!(!msg.has_message);
        assert!(msg.eos);
        let packet = msg.packet_message.as_ref().unwrap();
        assert!(packet.eom);
        assert!(packet.data.is_empty());
        assert!(!stream.is_done());
    }

    #[tokio::test]
    async fn test_send_failure_closes_stream() {
        let writer = Arc::new(RecordingWriter {
            fail_after: Some(1),
            ..Default::default()
        });
        let stream = new_stream(Arc::clone(&writer));
        let err = stream
            .send_raw(Bytes::from(vec![7u8; PACKET * 3]))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Transport(TransportError::Closed)));
        assert!(stream.is_done());
        assert!(matches!(
            stream.recv_raw().await,
            Err(StreamError::Transport(TransportError::Closed))
        ));
        assert_eq!(writer.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_after_finish_fails() {
        let stream = new_stream(Arc::default());
        stream
            .on_response(trailers_frame(Code::Ok, "", &[]))
            .await
            .unwrap();
        let err = stream.send_raw(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, StreamError::Finished));
    }

    #[tokio::test]
    async fn test_abort_sends_reset() {
        let writer = Arc::new(RecordingWriter::default());
        let stream = new_stream(Arc::clone(&writer));
        stream.abort(StreamError::DeadlineExceeded).await;
        assert_eq!(writer.resets.load(Ordering::SeqCst), 1);
        assert!(matches!(
            stream.recv_raw().await,
            Err(StreamError::DeadlineExceeded)
        ));
    }
}
