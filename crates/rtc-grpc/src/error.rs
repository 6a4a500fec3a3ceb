// ABOUTME: Error types for the rtc-grpc crate.
// ABOUTME: Protocol violations, transport failures and the terminal error of a stream.

use std::fmt;

use thiserror::Error;
use tonic::Code;

/// Kind of inbound frame, used to describe ordering violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Headers,
    Message,
    Trailers,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Headers => f.write_str("headers"),
            FrameKind::Message => f.write_str("message"),
            FrameKind::Trailers => f.write_str("trailers"),
        }
    }
}

/// A peer sent frames for a stream in an order the protocol forbids.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("headers not yet received")]
    HeadersNotYetReceived,

    #[error("headers already received")]
    HeadersAlreadyReceived,

    #[error("{0} received after trailers")]
    AfterTrailers(FrameKind),
}

/// Failures writing to the shared data channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The data channel, or the client channel multiplexing it, is closed.
    #[error("data channel closed")]
    Closed,

    /// The underlying transport rejected the frame.
    #[error("data channel send failed: {0}")]
    Send(String),
}

/// Terminal error of a stream, or the error returned by a single operation.
///
/// Cloneable so every blocked caller can observe the same value.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// Frames arrived out of order.
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    /// The server finished the call with a non-OK status.
    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Status(tonic::Status),

    /// The stream's scope was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The call's timeout elapsed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The stream already completed cleanly.
    #[error("stream already finished")]
    Finished,

    /// Writing to the data channel failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A received message could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// A reassembled message grew past the configured maximum.
    #[error("message of {size} bytes exceeds max of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
}

impl StreamError {
    /// The gRPC status code callers should see for this error.
    pub fn code(&self) -> Code {
        match self {
            StreamError::Protocol(_) => Code::Internal,
            StreamError::Status(status) => status.code(),
            StreamError::Cancelled => Code::Cancelled,
            StreamError::DeadlineExceeded => Code::DeadlineExceeded,
            StreamError::Finished => Code::Unknown,
            StreamError::Transport(_) => Code::Unavailable,
            StreamError::Decode(_) => Code::Internal,
            StreamError::MessageTooLarge { .. } => Code::ResourceExhausted,
        }
    }
}

impl From<tonic::Status> for StreamError {
    fn from(status: tonic::Status) -> Self {
        StreamError::Status(status)
    }
}

impl From<prost::DecodeError> for StreamError {
    fn from(err: prost::DecodeError) -> Self {
        StreamError::Decode(err.to_string())
    }
}

impl From<StreamError> for tonic::Status {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Status(status) => status,
            other => tonic::Status::new(other.code(), other.to_string()),
        }
    }
}
