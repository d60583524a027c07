//! Body normalisation before human-facing outputs: inflate gzip bodies and
//! join chunked transfers, fixing up the headers to match.

use flate2::read::GzDecoder;
use std::io::Read;
use tracing::debug;

use crate::proto;

/// Dechunks and un-gzips an HTTP payload in one pass. Returns an empty
/// buffer when the body cannot be decoded, which callers treat as "drop".
pub fn prettify_http(payload: Vec<u8>) -> Vec<u8> {
    let mut payload = payload;

    if proto::header(&payload, b"Transfer-Encoding").eq_ignore_ascii_case(b"chunked") {
        let Some(body_start) = proto::headers_end(&payload) else {
            return payload;
        };
        let Some(body) = dechunk(&payload[body_start..]) else {
            debug!("failed to join chunked body");
            return Vec::new();
        };
        let mut head = payload[..body_start].to_vec();
        head.extend_from_slice(&body);
        payload = proto::delete_header(&head, b"Transfer-Encoding");
        let length = body.len().to_string();
        payload = proto::set_header(&payload, b"Content-Length", length.as_bytes());
    }

    if proto::header(&payload, b"Content-Encoding").eq_ignore_ascii_case(b"gzip") {
        let Some(body_start) = proto::headers_end(&payload) else {
            return payload;
        };
        let mut inflated = Vec::new();
        let mut decoder = GzDecoder::new(&payload[body_start..]);
        if let Err(err) = decoder.read_to_end(&mut inflated) {
            debug!(?err, "failed to inflate gzip body");
            return Vec::new();
        }
        let mut head = payload[..body_start].to_vec();
        head.extend_from_slice(&inflated);
        payload = proto::delete_header(&head, b"Content-Encoding");
        let length = inflated.len().to_string();
        payload = proto::set_header(&payload, b"Content-Length", length.as_bytes());
    }

    payload
}

fn dechunk(body: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut pos = 0;
    loop {
        let rel = body[pos..]
            .windows(2)
            .position(|window| window == b"\r\n")?;
        let size_line = &body[pos..pos + rel];
        let size_hex = match size_line.iter().position(|&b| b == b';') {
            Some(semi) => &size_line[..semi],
            None => size_line,
        };
        let size = usize::from_str_radix(std::str::from_utf8(size_hex).ok()?.trim(), 16).ok()?;
        pos += rel + 2;
        if size == 0 {
            return Some(out);
        }
        if body.len() < pos + size + 2 {
            return None;
        }
        out.extend_from_slice(&body[pos..pos + size]);
        pos += size + 2;
    }
}
