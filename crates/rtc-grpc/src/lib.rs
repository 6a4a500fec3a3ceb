// ABOUTME: gRPC client calls multiplexed over a single message-oriented data channel.
// ABOUTME: Provides the client channel, client streams, packet reassembly and call metadata.

pub mod channel;
pub mod client_stream;
pub mod context;
pub mod error;
pub mod latch;
pub mod metadata;
pub mod status;
pub mod stream;
pub mod transport;

// Channel
pub use channel::{
    CallOptions, ChannelConfig, ClientChannel, StreamWriter, DEFAULT_MAX_TRANSPORT_MESSAGE_SIZE,
};

// Streams
pub use client_stream::ClientStream;
pub use context::StreamContext;
pub use stream::{BaseStream, OnDone, DEFAULT_CHANNEL_BUFFER, DEFAULT_MAX_MESSAGE_SIZE};

// Error types
pub use error::{FrameKind, ProtocolViolation, StreamError, TransportError};

// Metadata and transport
pub use latch::Latch;
pub use metadata::Metadata;
pub use transport::{DataChannel, MpscDataChannel};

// Re-export wire types for convenience
pub use rtc_proto;
