use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

use crate::tcp::packet::{default_message_key, extend_key, MessageKey, Packet};
use crate::tcp::pool::Message;

use super::http2::{
    strip_client_preface, write_headers_frame, FrameReader, FLAG_END_HEADERS, FLAG_END_STREAM,
    FRAME_DATA, FRAME_HEADERS,
};
use super::{is_request, is_response, Framer};

const STREAM_CACHE_CAPACITY: usize = 65_535;

/// Synthetic header appended to every re-encoded HEADERS frame so replayed
/// traffic can be traced back to its recording.
pub const LOG_REPLAY_TRACE_ID: &str = "_log_replay_trace_id";

/// gRPC-over-HTTP/2 framing. One captured packet may interleave frames of
/// several streams; each stream becomes its own message bucket keyed by the
/// flow key extended with the stream id.
pub struct GrpcFramer {
    listen_addr: String,
    /// (src, dst, stream_id, is_incoming) triples already seen.
    streams_seen: LruCache<(String, String, u32, bool), ()>,
    /// HPACK decoders carry dynamic-table state per connection.
    decoders: LruCache<u64, hpack::Decoder<'static>>,
}

impl GrpcFramer {
    pub fn new(listen_addr: &str) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            streams_seen: LruCache::new(NonZeroUsize::new(STREAM_CACHE_CAPACITY).unwrap()),
            decoders: LruCache::new(NonZeroUsize::new(STREAM_CACHE_CAPACITY).unwrap()),
        }
    }

    /// Decodes a HEADERS block with the connection's decoder and re-encodes
    /// it with a fresh table, appending the trace-id header.
    fn reencode_headers(&mut self, connection: u64, block: &[u8]) -> Option<Vec<u8>> {
        let decoder = self
            .decoders
            .get_or_insert_mut(connection, hpack::Decoder::new);
        let fields = match decoder.decode(block) {
            Ok(fields) => fields,
            Err(err) => {
                debug!(?err, "hpack decode failed");
                return None;
            }
        };
        let mut encoder = hpack::Encoder::new();
        let trace_id = uuid::Uuid::new_v4().to_string();
        let mut headers: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
            .collect();
        headers.push((LOG_REPLAY_TRACE_ID.as_bytes(), trace_id.as_bytes()));
        Some(encoder.encode(headers))
    }
}

impl Framer for GrpcFramer {
    fn start(&mut self, pckt: &Packet) -> (bool, bool) {
        if pckt.payload.is_empty() {
            return (false, false);
        }
        let is_in = is_request(pckt, &self.listen_addr);
        let is_out = is_response(pckt, &self.listen_addr);
        let payload = strip_client_preface(&pckt.payload);
        let mut reader = FrameReader::new(payload);
        while let Some(frame) = reader.next_frame() {
            let stream_id = frame.header.stream_id;
            if stream_id == 0 {
                continue;
            }
            let seen_key = (pckt.src(), pckt.dst(), stream_id, is_in);
            // Only the first frame of a stream in a direction opens a message.
            let first_time = self.streams_seen.put(seen_key, ()).is_none();
            if is_in {
                return (first_time, false);
            }
            if is_out {
                return (false, first_time);
            }
            return (false, false);
        }
        (false, false)
    }

    fn end(&mut self, msg: &Message) -> bool {
        if msg.stats.length == 0 {
            return false;
        }
        let Some(packet) = msg.packets().last() else {
            return false;
        };
        if packet.payload.is_empty() {
            return false;
        }
        let payload = strip_client_preface(&packet.payload);
        let mut reader = FrameReader::new(payload);
        while let Some(frame) = reader.next_frame() {
            let kind = frame.header.kind;
            if (kind == FRAME_DATA || kind == FRAME_HEADERS)
                && frame.header.has_flag(FLAG_END_STREAM)
            {
                return true;
            }
        }
        false
    }

    fn message_key(&mut self, pckt: &Packet, peer: bool) -> MessageKey {
        let base = default_message_key(pckt, peer);
        let payload = strip_client_preface(&pckt.payload);
        let mut reader = FrameReader::new(payload);
        while let Some(frame) = reader.next_frame() {
            if frame.header.stream_id > 0 {
                return extend_key(base, frame.header.stream_id);
            }
        }
        base
    }

    fn req_rsp_key(&mut self, pckt: &Packet) -> MessageKey {
        let is_out = is_response(pckt, &self.listen_addr);
        self.message_key(pckt, is_out)
    }

    fn message_group_by(&mut self, pckt: &Packet) -> Vec<(MessageKey, Packet)> {
        let mut groups: Vec<(MessageKey, Packet)> = Vec::new();
        if pckt.payload.is_empty() {
            return groups;
        }
        let connection = default_message_key(pckt, false) as u64;
        let payload = strip_client_preface(&pckt.payload).to_vec();
        let mut reader = FrameReader::new(&payload);
        while let Some(frame) = reader.next_frame() {
            let stream_id = frame.header.stream_id;
            let bytes: Vec<u8> = if frame.header.kind == FRAME_HEADERS && stream_id > 0 {
                let Ok(block) = frame.header_block() else {
                    break;
                };
                match self.reencode_headers(connection, block) {
                    Some(reencoded) => write_headers_frame(
                        stream_id,
                        frame.header.has_flag(FLAG_END_STREAM),
                        frame.header.has_flag(FLAG_END_HEADERS),
                        &reencoded,
                    ),
                    // A broken header block poisons the whole packet.
                    None => return Vec::new(),
                }
            } else {
                frame.raw.to_vec()
            };

            if stream_id == 0 {
                continue;
            }
            let key = extend_key(connection as MessageKey, stream_id);
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, bucket)) => bucket.payload.extend_from_slice(&bytes),
                None => {
                    let mut slice = pckt.clone();
                    slice.payload = bytes;
                    groups.push((key, slice));
                }
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::http2::{write_data_frame, CLIENT_PREFACE};
    use std::net::{IpAddr, Ipv4Addr};

    fn packet(src_port: u16, dst_port: u16, payload: Vec<u8>) -> Packet {
        let (src_ip, dst_ip) = if dst_port == 8000 {
            (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
        } else {
            (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1))
        };
        Packet {
            src_ip: IpAddr::V4(src_ip),
            dst_ip: IpAddr::V4(dst_ip),
            src_port,
            dst_port,
            seq: 1,
            ack: 1,
            syn: false,
            has_ack: true,
            fin: false,
            rst: false,
            psh: true,
            urg: false,
            captured_len: payload.len(),
            payload,
            lost: 0,
            ip_version: 4,
            timestamp_ns: 0,
        }
    }

    fn headers_frame(stream_id: u32, end_stream: bool) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(vec![
            (b":method".as_slice(), b"POST".as_slice()),
            (b":path".as_slice(), b"/pkg.Svc/Method".as_slice()),
        ]);
        write_headers_frame(stream_id, end_stream, true, &block)
    }

    #[test]
    fn start_fires_once_per_stream_and_direction() {
        let mut framer = GrpcFramer::new("10.0.0.2:8000");
        let mut payload = CLIENT_PREFACE.to_vec();
        payload.extend_from_slice(&headers_frame(1, false));
        let request = packet(40000, 8000, payload);
        assert_eq!(framer.start(&request), (true, false));
        // Second sighting of the same stream is a continuation, not a start.
        let data = packet(40000, 8000, write_data_frame(1, false, b"body"));
        assert_eq!(framer.start(&data), (false, false));
    }

    #[test]
    fn group_by_buckets_per_stream() {
        let mut framer = GrpcFramer::new("10.0.0.2:8000");
        let mut payload = headers_frame(1, false);
        payload.extend_from_slice(&write_data_frame(3, false, b"other"));
        payload.extend_from_slice(&write_data_frame(1, true, b"mine"));
        let pckt = packet(40000, 8000, payload);
        let groups = framer.message_group_by(&pckt);
        assert_eq!(groups.len(), 2);
        let base = default_message_key(&pckt, false);
        assert!(groups.iter().any(|(k, _)| *k == extend_key(base, 1)));
        assert!(groups.iter().any(|(k, _)| *k == extend_key(base, 3)));
        let stream1 = &groups.iter().find(|(k, _)| *k == extend_key(base, 1)).unwrap().1;
        // Re-encoded HEADERS plus the DATA frame, concatenated in order.
        let mut reader = FrameReader::new(&stream1.payload);
        let headers = reader.next_frame().unwrap();
        assert_eq!(headers.header.kind, FRAME_HEADERS);
        let data = reader.next_frame().unwrap();
        assert_eq!(data.header.kind, FRAME_DATA);
        assert_eq!(data.data().unwrap(), b"mine");
    }

    #[test]
    fn reencoded_headers_carry_trace_id() {
        let mut framer = GrpcFramer::new("10.0.0.2:8000");
        let pckt = packet(40000, 8000, headers_frame(1, true));
        let groups = framer.message_group_by(&pckt);
        assert_eq!(groups.len(), 1);
        let mut reader = FrameReader::new(&groups[0].1.payload);
        let frame = reader.next_frame().unwrap();
        assert!(frame.header.has_flag(FLAG_END_STREAM));
        let mut decoder = hpack::Decoder::new();
        let fields = decoder.decode(frame.header_block().unwrap()).unwrap();
        assert!(fields
            .iter()
            .any(|(name, _)| name == LOG_REPLAY_TRACE_ID.as_bytes()));
    }

    #[test]
    fn end_requires_end_stream_on_data_or_headers() {
        let mut framer = GrpcFramer::new("10.0.0.2:8000");
        let open = packet(40000, 8000, write_data_frame(1, false, b"x"));
        let done = packet(40000, 8000, write_data_frame(1, true, b"y"));
        let mut msg = Message::new(open.src(), open.dst(), 4, 0, 0);
        msg.add(open);
        assert!(!framer.end(&msg));
        msg.add(done);
        assert!(framer.end(&msg));
    }

    #[test]
    fn message_key_extends_with_stream_id() {
        let mut framer = GrpcFramer::new("10.0.0.2:8000");
        let pckt = packet(40000, 8000, write_data_frame(7, false, b"x"));
        let key = framer.message_key(&pckt, false);
        assert_eq!(key & 0xffff_ffff, 7);
    }
}
