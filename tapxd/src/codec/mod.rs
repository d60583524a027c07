//! Request-header decoders: extract service/api/method names from captured
//! request bytes, per protocol.

mod grpc;
mod http;

use serde::{Deserialize, Serialize};

pub use grpc::GrpcHeaderCodec;
pub use http::HttpHeaderCodec;

pub const GRPC_NAME: &str = "grpc";
pub const HTTP_NAME: &str = "http";

/// Identity of a captured request, as the collector wants it named.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub service_name: String,
    pub api_name: String,
    pub method_name: String,
    pub interface_name: String,
    /// Caller-supplied trace id, when the request carried one.
    pub cus_trace_id: String,
}

pub trait HeaderCodec: Send + Sync {
    fn decode(&self, request: &[u8]) -> anyhow::Result<ProtocolHeader>;
}

/// Codec for a protocol name; unknown protocols decode to an empty header.
pub fn header_codec(protocol: &str) -> Box<dyn HeaderCodec> {
    match protocol {
        GRPC_NAME => Box::new(GrpcHeaderCodec),
        HTTP_NAME => Box::new(HttpHeaderCodec),
        _ => Box::new(EmptyHeaderCodec),
    }
}

struct EmptyHeaderCodec;

impl HeaderCodec for EmptyHeaderCodec {
    fn decode(&self, _request: &[u8]) -> anyhow::Result<ProtocolHeader> {
        Ok(ProtocolHeader::default())
    }
}

const UNKNOWN: &str = "unknown";

/// `/pkg.Service/Method` → (`pkg.Service`, `Method`).
pub(crate) fn parse_service_name(path: &str) -> (String, String) {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.rfind('/') {
        Some(pos) => (path[..pos].to_string(), path[pos + 1..].to_string()),
        None => (UNKNOWN.to_string(), UNKNOWN.to_string()),
    }
}

/// Last dotted segment of a service name.
pub(crate) fn parse_interface_name(service_name: &str) -> String {
    match service_name.rfind('.') {
        Some(pos) => service_name[pos + 1..].to_string(),
        None => UNKNOWN.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_splits_on_last_slash() {
        let (service, method) = parse_service_name("/pkg.Svc/Method");
        assert_eq!(service, "pkg.Svc");
        assert_eq!(method, "Method");
        let (service, method) = parse_service_name("no-slashes");
        assert_eq!(service, UNKNOWN);
        assert_eq!(method, UNKNOWN);
    }

    #[test]
    fn interface_name_is_last_dotted_segment() {
        assert_eq!(parse_interface_name("grpc.logreplay.Echo"), "Echo");
        assert_eq!(parse_interface_name("nodots"), UNKNOWN);
    }

    #[test]
    fn unknown_protocol_decodes_empty() {
        let header = header_codec("thrift").decode(b"whatever").unwrap();
        assert_eq!(header, ProtocolHeader::default());
    }
}
