use anyhow::{anyhow, Context, Result};

use super::{HeaderCodec, ProtocolHeader};

const MAX_PARSED_HEADERS: usize = 64;

/// HTTP request naming: the api is the path without its query string, the
/// service is the last dotted segment of the path's first element (URLs of
/// the `/grpc.pkg.EchoHttp/SayHello` shape), falling back to the api name.
pub struct HttpHeaderCodec;

impl HeaderCodec for HttpHeaderCodec {
    fn decode(&self, request: &[u8]) -> Result<ProtocolHeader> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        parsed
            .parse(request)
            .context("parse http request header")?;
        let path = parsed
            .path
            .ok_or_else(|| anyhow!("request without path"))?;
        let api_name = path.split('?').next().unwrap_or(path).to_string();
        Ok(ProtocolHeader {
            service_name: service_from_api(&api_name),
            api_name,
            ..ProtocolHeader::default()
        })
    }
}

fn service_from_api(api_name: &str) -> String {
    let mut segments = api_name.split('/');
    let _ = segments.next(); // leading empty segment
    let Some(first) = segments.next().filter(|s| !s.is_empty()) else {
        return api_name.to_string();
    };
    match first.rsplit('.').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ => api_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_path_and_service() {
        let header = HttpHeaderCodec
            .decode(b"POST /grpc.logreplay.EchoHttp/SayHello?x=1 HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap();
        assert_eq!(header.api_name, "/grpc.logreplay.EchoHttp/SayHello");
        assert_eq!(header.service_name, "EchoHttp");
    }

    #[test]
    fn plain_paths_fall_back_to_api_name() {
        let header = HttpHeaderCodec
            .decode(b"GET /healthz HTTP/1.1\r\n\r\n")
            .unwrap();
        assert_eq!(header.api_name, "/healthz");
        assert_eq!(header.service_name, "healthz");
    }
}
