// ABOUTME: Protobuf wire messages for gRPC calls multiplexed over one data channel.
// ABOUTME: Requests, responses, packets and the well-known types they embed.

#![allow(clippy::derive_partial_eq_without_eq)]

use std::collections::HashMap;

use prost::bytes::Bytes;
use prost::Message;

/// Identifies one logical RPC on the shared data channel.
#[derive(Clone, PartialEq, Message)]
pub struct Stream {
    #[prost(uint64, tag = "1")]
    pub id: u64,
}

/// A fragment of a logical message. `eom` is set on the last fragment only.
#[derive(Clone, PartialEq, Message)]
pub struct PacketMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    #[prost(bool, tag = "2")]
    pub eom: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Strings {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

/// Call metadata as carried on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
    #[prost(map = "string, message", tag = "1")]
    pub md: HashMap<String, Strings>,
}

/// Wire-compatible `google.protobuf.Duration`.
#[derive(Clone, PartialEq, Message)]
pub struct Duration {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Self {
            seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nanos: d.subsec_nanos() as i32,
        }
    }
}

/// Wire-compatible `google.protobuf.Any`.
#[derive(Clone, PartialEq, Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

/// Wire-compatible `google.rpc.Status`.
#[derive(Clone, PartialEq, Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestHeaders {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<Metadata>,
    #[prost(message, optional, tag = "3")]
    pub timeout: Option<Duration>,
}

/// One outbound packet of a request message. `has_message = false` with an
/// empty packet and `eos = true` is a plain half-close.
#[derive(Clone, PartialEq, Message)]
pub struct RequestMessage {
    #[prost(bool, tag = "1")]
    pub has_message: bool,
    #[prost(message, optional, tag = "2")]
    pub packet_message: Option<PacketMessage>,
    #[prost(bool, tag = "3")]
    pub eos: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(message, optional, tag = "1")]
    pub stream: Option<Stream>,
    #[prost(oneof = "request::Type", tags = "2, 3, 4")]
    pub r#type: Option<request::Type>,
}

pub mod request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "2")]
        Headers(super::RequestHeaders),
        #[prost(message, tag = "3")]
        Message(super::RequestMessage),
        #[prost(bool, tag = "4")]
        RstStream(bool),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct ResponseHeaders {
    #[prost(message, optional, tag = "1")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResponseMessage {
    #[prost(message, optional, tag = "1")]
    pub packet_message: Option<PacketMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResponseTrailers {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(message, optional, tag = "1")]
    pub stream: Option<Stream>,
    #[prost(oneof = "response::Type", tags = "2, 3, 4")]
    pub r#type: Option<response::Type>,
}

pub mod response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "2")]
        Headers(super::ResponseHeaders),
        #[prost(message, tag = "3")]
        Message(super::ResponseMessage),
        #[prost(message, tag = "4")]
        Trailers(super::ResponseTrailers),
    }
}

impl Request {
    pub fn new(stream_id: u64, r#type: request::Type) -> Self {
        Self {
            stream: Some(Stream { id: stream_id }),
            r#type: Some(r#type),
        }
    }
}

impl Response {
    pub fn new(stream_id: u64, r#type: response::Type) -> Self {
        Self {
            stream: Some(Stream { id: stream_id }),
            r#type: Some(r#type),
        }
    }

    /// Stream id this response is addressed to, 0 when absent.
    pub fn stream_id(&self) -> u64 {
        self.stream.as_ref().map(|s| s.id).unwrap_or_default()
    }
}

/// Packet payload size used when fragmenting requests for a transport with
/// the given message ceiling.
///
/// Measured from an encoded request carrying an empty end-of-message packet,
/// minus one byte. The ceiling is approximate: a full chunk's length prefixes
/// and `has_message` flag add a few bytes the empty envelope does not carry,
/// so a full packet can encode slightly over `max_transport_message_size`.
pub fn max_request_packet_data_size(max_transport_message_size: usize) -> usize {
    let empty = Request::new(
        1,
        request::Type::Message(RequestMessage {
            has_message: false,
            packet_message: Some(PacketMessage {
                data: Bytes::new(),
                eom: true,
            }),
            eos: false,
        }),
    );
    max_transport_message_size.saturating_sub(empty.encoded_len() + 1)
}
