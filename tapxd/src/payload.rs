//! On-wire message envelope.
//!
//! Every message travelling between inputs and outputs is prefixed with an
//! ASCII meta line `"T U S L\n"`: payload type, 24-hex-char UUID, start
//! timestamp in nanoseconds, and latency in nanoseconds (-1 when not
//! applicable). Framed streams separate messages with an 11-byte monkey
//! fence.

pub const REQUEST_PAYLOAD: u8 = b'1';
pub const RESPONSE_PAYLOAD: u8 = b'2';
pub const REPLAYED_RESPONSE_PAYLOAD: u8 = b'3';

pub const PAYLOAD_SEPARATOR: &[u8] = "\n\u{1F435}\u{1F648}\u{1F649}\n".as_bytes();

/// Builds the meta line: `"3 f45590...b3 13923489726487326 1231\n"`.
pub fn payload_header(payload_type: u8, uuid: &str, timing_ns: i64, latency_ns: i64) -> Vec<u8> {
    format!("{} {} {} {}\n", payload_type as char, uuid, timing_ns, latency_ns).into_bytes()
}

/// Splits the meta line into its space-separated fields, without the
/// trailing newline. `None` when there is no newline at all.
pub fn payload_meta(payload: &[u8]) -> Option<Vec<&[u8]>> {
    let header_end = payload.iter().position(|&b| b == b'\n')?;
    Some(payload[..header_end].split(|&b| b == b' ').collect())
}

/// Splits an envelope into `(meta-with-newline, body)`. Payloads without a
/// meta line come back as a bare body.
pub fn meta_with_body(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.iter().position(|&b| b == b'\n') {
        Some(i) if i > 0 && payload.len() > i + 1 => (&payload[..i + 1], &payload[i + 1..]),
        _ => (&[], payload),
    }
}

/// The UUID field of the meta line, empty when malformed.
pub fn payload_id(payload: &[u8]) -> &[u8] {
    match payload_meta(payload) {
        Some(meta) if meta.len() >= 2 => meta[1],
        _ => &[],
    }
}

/// Captured request or response (not a replayed response).
pub fn is_origin_payload(meta: &[u8]) -> bool {
    matches!(meta.first(), Some(&REQUEST_PAYLOAD) | Some(&RESPONSE_PAYLOAD))
}

pub fn is_request_payload(meta: &[u8]) -> bool {
    meta.first() == Some(&REQUEST_PAYLOAD)
}
