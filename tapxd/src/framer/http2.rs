//! Just enough HTTP/2 framing for capture: a frame walker over raw payload
//! bytes and a HEADERS writer for re-encoded header blocks.

use anyhow::{anyhow, Result};

pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        Some(FrameHeader {
            length: u32::from_be_bytes([0, buf[0], buf[1], buf[2]]),
            kind: buf[3],
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        })
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// One frame plus its raw bytes (header included), borrowed from the packet
/// payload.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
    pub raw: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// HEADERS block fragment with padding and priority stripped.
    pub fn header_block(&self) -> Result<&'a [u8]> {
        stripped_payload(self.header, self.payload)
    }

    /// DATA payload with padding stripped.
    pub fn data(&self) -> Result<&'a [u8]> {
        stripped_payload(self.header, self.payload)
    }
}

fn stripped_payload(header: FrameHeader, payload: &[u8]) -> Result<&[u8]> {
    let mut body = payload;
    if header.has_flag(FLAG_PADDED) {
        let pad = *body.first().ok_or_else(|| anyhow!("padded frame too short"))? as usize;
        body = &body[1..];
        if pad > body.len() {
            return Err(anyhow!("frame padding exceeds payload"));
        }
        body = &body[..body.len() - pad];
    }
    if header.kind == FRAME_HEADERS && header.has_flag(FLAG_PRIORITY) {
        if body.len() < 5 {
            return Err(anyhow!("priority headers frame too short"));
        }
        body = &body[5..];
    }
    Ok(body)
}

/// Iterates the frames of one captured payload. Stops at the first short or
/// malformed frame; everything read up to that point stays valid.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn next_frame(&mut self) -> Option<RawFrame<'a>> {
        let rest = &self.buf[self.pos..];
        let header = FrameHeader::parse(rest)?;
        let total = FRAME_HEADER_LEN + header.length as usize;
        if rest.len() < total {
            return None;
        }
        let frame = RawFrame {
            header,
            payload: &rest[FRAME_HEADER_LEN..total],
            raw: &rest[..total],
        };
        self.pos += total;
        Some(frame)
    }
}

/// Removes a leading client preface, if present.
pub fn strip_client_preface(payload: &[u8]) -> &[u8] {
    payload
        .strip_prefix(CLIENT_PREFACE)
        .unwrap_or(payload)
}

/// Serialises a HEADERS frame around an already-encoded header block.
pub fn write_headers_frame(
    stream_id: u32,
    end_stream: bool,
    end_headers: bool,
    block: &[u8],
) -> Vec<u8> {
    let mut flags = 0u8;
    if end_stream {
        flags |= FLAG_END_STREAM;
    }
    if end_headers {
        flags |= FLAG_END_HEADERS;
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + block.len());
    let len = (block.len() as u32).to_be_bytes();
    out.extend_from_slice(&len[1..]);
    out.push(FRAME_HEADERS);
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(block);
    out
}

/// Serialises a DATA frame.
pub fn write_data_frame(stream_id: u32, end_stream: bool, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
    let len = (data.len() as u32).to_be_bytes();
    out.extend_from_slice(&len[1..]);
    out.push(FRAME_DATA);
    out.push(if end_stream { FLAG_END_STREAM } else { 0 });
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// An empty SETTINGS frame, as sent right after the client preface.
pub fn empty_settings_frame() -> [u8; FRAME_HEADER_LEN] {
    [0, 0, 0, 0x4, 0, 0, 0, 0, 0]
}
