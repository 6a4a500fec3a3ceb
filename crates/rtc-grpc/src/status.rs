// ABOUTME: Conversion between wire google.rpc.Status and tonic::Status.
// ABOUTME: An absent or OK status maps to a clean end of stream.

use prost::Message;
use tonic::Code;

/// Turn a trailers status into the stream's terminal status.
///
/// Returns `None` for a missing or OK status. Structured details travel in
/// the tonic status as the encoded `google.rpc.Status`, the same layout gRPC
/// uses for `grpc-status-details-bin`.
pub fn from_proto(status: Option<&rtc_proto::Status>) -> Option<tonic::Status> {
    let status = status?;
    let code = Code::from_i32(status.code);
    if code == Code::Ok {
        return None;
    }
    if status.details.is_empty() {
        return Some(tonic::Status::new(code, status.message.clone()));
    }
    Some(tonic::Status::with_details(
        code,
        status.message.clone(),
        status.encode_to_vec().into(),
    ))
}

pub fn to_proto(status: &tonic::Status) -> rtc_proto::Status {
    let details = rtc_proto::Status::decode(status.details())
        .map(|s| s.details)
        .unwrap_or_default();
    rtc_proto::Status {
        code: status.code() as i32,
        message: status.message().to_string(),
        details,
    }
}
