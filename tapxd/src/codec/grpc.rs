use anyhow::Result;
use tracing::debug;

use crate::framer::grpc::LOG_REPLAY_TRACE_ID;
use crate::framer::http2::{strip_client_preface, FrameReader, FRAME_HEADERS};

use super::{parse_interface_name, parse_service_name, HeaderCodec, ProtocolHeader};

/// gRPC message body prefix: one compression flag byte and a 4-byte
/// big-endian length.
pub const GRPC_HEADER_LENGTH: usize = 5;

/// Minimal gRPC request decoding: HPACK-decode HEADERS for `:path` (and the
/// synthetic trace id), nothing more. The protobuf body is left opaque.
pub struct GrpcHeaderCodec;

impl HeaderCodec for GrpcHeaderCodec {
    fn decode(&self, request: &[u8]) -> Result<ProtocolHeader> {
        let mut ret = ProtocolHeader::default();
        let payload = strip_client_preface(request);
        let mut decoder = hpack::Decoder::new();
        let mut reader = FrameReader::new(payload);
        while let Some(frame) = reader.next_frame() {
            if frame.header.kind != FRAME_HEADERS {
                continue;
            }
            let Ok(block) = frame.header_block() else {
                continue;
            };
            let Ok(fields) = decoder.decode(block) else {
                debug!(stream = frame.header.stream_id, "hpack decode failed");
                continue;
            };
            for (name, value) in fields {
                let value = String::from_utf8_lossy(&value).into_owned();
                if name == b":path" {
                    let (service, method) = parse_service_name(&value);
                    ret.interface_name = parse_interface_name(&service);
                    ret.method_name = method.clone();
                    ret.service_name = service;
                    ret.api_name = method;
                } else if name == LOG_REPLAY_TRACE_ID.as_bytes() {
                    ret.cus_trace_id = value;
                }
            }
        }
        Ok(ret)
    }
}

/// Protobuf bytes of a gRPC message: everything after the 5-byte prefix.
pub fn grpc_body(data: &[u8]) -> &[u8] {
    if data.len() > GRPC_HEADER_LENGTH {
        &data[GRPC_HEADER_LENGTH..]
    } else {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::http2::{write_data_frame, write_headers_frame, CLIENT_PREFACE};

    fn request_bytes() -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        let block = encoder.encode(vec![
            (b":method".as_slice(), b"POST".as_slice()),
            (b":path".as_slice(), b"/pkg.Svc/Method".as_slice()),
            (LOG_REPLAY_TRACE_ID.as_bytes(), b"trace-1".as_slice()),
        ]);
        let mut payload = CLIENT_PREFACE.to_vec();
        payload.extend_from_slice(&write_headers_frame(1, false, true, &block));
        let mut body = vec![0u8; GRPC_HEADER_LENGTH];
        body.extend_from_slice(b"protobuf");
        payload.extend_from_slice(&write_data_frame(1, true, &body));
        payload
    }

    #[test]
    fn decodes_path_into_names() {
        let header = GrpcHeaderCodec.decode(&request_bytes()).unwrap();
        assert_eq!(header.service_name, "pkg.Svc");
        assert_eq!(header.method_name, "Method");
        assert_eq!(header.api_name, "Method");
        assert_eq!(header.interface_name, "Svc");
        assert_eq!(header.cus_trace_id, "trace-1");
    }

    #[test]
    fn body_skips_the_grpc_prefix() {
        let mut data = vec![0, 0, 0, 0, 8];
        data.extend_from_slice(b"protobuf");
        assert_eq!(grpc_body(&data), b"protobuf");
        assert_eq!(grpc_body(&[0, 0, 0]), b"");
    }
}
