//! Sequenced request payloads.

use bytes::Bytes;

const PREFIX: &str = "request-";

/// Payload for the `seq`-th request, used for tracing a request end to end.
pub fn request_payload(seq: u64) -> Bytes {
    Bytes::from(format!("{PREFIX}{seq}"))
}

/// Sequence number embedded in a request payload, if any.
pub fn parse_sequence(payload: &[u8]) -> Option<u64> {
    std::str::from_utf8(payload)
        .ok()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}
