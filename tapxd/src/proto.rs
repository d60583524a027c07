//! Byte-level HTTP/1.x helpers.
//!
//! The capture path never materialises an HTTP request object; framing and
//! rewriting operate directly on the captured bytes, so everything here
//! works on `&[u8]` and returns owned buffers only when it must edit.

const CRLF: &[u8] = b"\r\n";
const HEADERS_END: &[u8] = b"\r\n\r\n";

const METHODS: &[&[u8]] = &[
    b"GET", b"HEAD", b"POST", b"PUT", b"PATCH", b"DELETE", b"OPTIONS", b"CONNECT", b"TRACE",
];

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// True when the payload begins with an HTTP request line.
pub fn has_request_title(payload: &[u8]) -> bool {
    let Some(eol) = find(payload, CRLF) else {
        return false;
    };
    let title = &payload[..eol];
    let mut parts = title.split(|&b| b == b' ');
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if parts.next().is_some() {
        return false;
    }
    METHODS.contains(&method) && !uri.is_empty() && version.starts_with(b"HTTP/")
}

/// True when the payload begins with an HTTP status line.
pub fn has_response_title(payload: &[u8]) -> bool {
    let Some(eol) = find(payload, CRLF) else {
        return false;
    };
    let title = &payload[..eol];
    if !title.starts_with(b"HTTP/") {
        return false;
    }
    let Some(space) = title.iter().position(|&b| b == b' ') else {
        return false;
    };
    let status = &title[space + 1..];
    status.len() >= 3 && status[..3].iter().all(u8::is_ascii_digit)
}

/// Offset one past the header terminator, if headers are complete.
pub fn headers_end(payload: &[u8]) -> Option<usize> {
    find(payload, HEADERS_END).map(|pos| pos + HEADERS_END.len())
}

/// Header value lookup, case-insensitive, whitespace-trimmed. Empty slice
/// when absent.
pub fn header<'a>(payload: &'a [u8], name: &[u8]) -> &'a [u8] {
    match header_span(payload, name) {
        Some((_, value_start, value_end)) => &payload[value_start..value_end],
        None => &[],
    }
}

/// (line_start, value_start, value_end) of a header, bounded by the header
/// section.
fn header_span(payload: &[u8], name: &[u8]) -> Option<(usize, usize, usize)> {
    let end = headers_end(payload).unwrap_or(payload.len());
    let section = &payload[..end];
    let mut pos = find(section, CRLF)? + 2;
    while pos < section.len() {
        let line_end = match find(&section[pos..], CRLF) {
            Some(rel) => pos + rel,
            None => section.len(),
        };
        let line = &section[pos..line_end];
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(name) {
                let mut value_start = pos + colon + 1;
                while value_start < line_end && payload[value_start] == b' ' {
                    value_start += 1;
                }
                return Some((pos, value_start, line_end));
            }
        }
        pos = line_end + 2;
    }
    None
}

/// Sets a header: replaces the value in place when present, otherwise
/// inserts the line before `Content-Length` (or right after the title when
/// there is none).
pub fn set_header(payload: &[u8], name: &[u8], value: &[u8]) -> Vec<u8> {
    if let Some((_, value_start, value_end)) = header_span(payload, name) {
        let mut out = Vec::with_capacity(payload.len() - (value_end - value_start) + value.len());
        out.extend_from_slice(&payload[..value_start]);
        out.extend_from_slice(value);
        out.extend_from_slice(&payload[value_end..]);
        return out;
    }

    let insert_at = match header_span(payload, b"Content-Length") {
        Some((line_start, _, _)) => line_start,
        None => match find(payload, CRLF) {
            Some(eol) => eol + 2,
            None => return payload.to_vec(),
        },
    };
    let mut out = Vec::with_capacity(payload.len() + name.len() + value.len() + 4);
    out.extend_from_slice(&payload[..insert_at]);
    out.extend_from_slice(name);
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(CRLF);
    out.extend_from_slice(&payload[insert_at..]);
    out
}

/// Removes a header line entirely.
pub fn delete_header(payload: &[u8], name: &[u8]) -> Vec<u8> {
    match header_span(payload, name) {
        Some((line_start, _, value_end)) => {
            let mut out = Vec::with_capacity(payload.len());
            out.extend_from_slice(&payload[..line_start]);
            out.extend_from_slice(&payload[value_end + 2..]);
            out
        }
        None => payload.to_vec(),
    }
}

/// Request method, empty on malformed titles.
pub fn method(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == b' ') {
        Some(space) => &payload[..space],
        None => &[],
    }
}

/// Request path (including the query string).
pub fn path(payload: &[u8]) -> &[u8] {
    let Some(first) = payload.iter().position(|&b| b == b' ') else {
        return &[];
    };
    let rest = &payload[first + 1..];
    match rest.iter().position(|&b| b == b' ') {
        Some(second) => &rest[..second],
        None => &[],
    }
}

/// Replaces the request path.
pub fn set_path(payload: &[u8], new_path: &[u8]) -> Vec<u8> {
    let Some(first) = payload.iter().position(|&b| b == b' ') else {
        return payload.to_vec();
    };
    let rest = &payload[first + 1..];
    let Some(second) = rest.iter().position(|&b| b == b' ') else {
        return payload.to_vec();
    };
    let mut out = Vec::with_capacity(payload.len());
    out.extend_from_slice(&payload[..first + 1]);
    out.extend_from_slice(new_path);
    out.extend_from_slice(&rest[second..]);
    out
}

/// Value span of a query parameter: `(value, start, end)` within the
/// payload, or `start == -1` when the parameter is absent.
pub fn path_param<'a>(payload: &'a [u8], name: &str) -> (&'a [u8], isize, isize) {
    let p = path(payload);
    let Some(query_rel) = p.iter().position(|&b| b == b'?') else {
        return (&[], -1, -1);
    };
    let path_off = match payload.iter().position(|&b| b == b' ') {
        Some(first) => first + 1,
        None => return (&[], -1, -1),
    };
    let query = &p[query_rel + 1..];
    let mut pos = 0;
    for pair in query.split(|&b| b == b'&') {
        let eq = pair.iter().position(|&b| b == b'=').unwrap_or(pair.len());
        if &pair[..eq] == name.as_bytes() {
            let name_end = path_off + query_rel + 1 + pos + eq;
            let (value, value_start): (&[u8], usize) = if eq < pair.len() {
                (&pair[eq + 1..], name_end + 1)
            } else {
                (&[], name_end)
            };
            let value_end = value_start + value.len();
            return (value, value_start as isize, value_end as isize);
        }
        pos += pair.len() + 1;
    }
    (&[], -1, -1)
}

/// Sets a query parameter, replacing an existing value or appending to the
/// query string.
pub fn set_path_param(payload: &[u8], name: &str, value: &[u8]) -> Vec<u8> {
    let (_, start, end) = path_param(payload, name);
    if start >= 0 {
        let mut out = Vec::with_capacity(payload.len());
        out.extend_from_slice(&payload[..start as usize]);
        out.extend_from_slice(value);
        out.extend_from_slice(&payload[end as usize..]);
        return out;
    }
    let current = path(payload).to_vec();
    let mut new_path = current.clone();
    if current.contains(&b'?') {
        new_path.push(b'&');
    } else {
        new_path.push(b'?');
    }
    new_path.extend_from_slice(name.as_bytes());
    new_path.push(b'=');
    new_path.extend_from_slice(value);
    set_path(payload, &new_path)
}

/// Whether the payload is a complete HTTP/1.x message: terminated headers
/// plus either a fully received chunked body, `Content-Length` bytes of
/// body, or no body indicator at all.
pub fn has_full_payload(payload: &[u8]) -> bool {
    let Some(body_start) = headers_end(payload) else {
        return false;
    };
    let body = &payload[body_start..];

    let transfer_encoding = header(payload, b"Transfer-Encoding");
    if transfer_encoding.eq_ignore_ascii_case(b"chunked") {
        return chunked_complete(body);
    }

    let content_length = header(payload, b"Content-Length");
    if !content_length.is_empty() {
        return match std::str::from_utf8(content_length)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
        {
            Some(expected) => body.len() >= expected,
            None => false,
        };
    }

    true
}

/// Walks the chunk stream; complete once the zero chunk and its (possibly
/// empty) trailer section have arrived.
fn chunked_complete(body: &[u8]) -> bool {
    let mut pos = 0;
    loop {
        let Some(rel) = find(&body[pos..], CRLF) else {
            return false;
        };
        let size_line = &body[pos..pos + rel];
        let size_hex = match size_line.iter().position(|&b| b == b';') {
            Some(semi) => &size_line[..semi],
            None => size_line,
        };
        let Some(size) = std::str::from_utf8(size_hex)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
        else {
            return false;
        };
        pos += rel + 2;
        if size == 0 {
            let rest = &body[pos..];
            return rest.starts_with(CRLF) || find(rest, HEADERS_END).is_some();
        }
        if body.len() < pos + size + 2 {
            return false;
        }
        if &body[pos + size..pos + size + 2] != CRLF {
            return false;
        }
        pos += size + 2;
    }
}

/// 32-bit FNV-1a, the hash behind the consistent sampling filters and
/// worker bucketing.
pub fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] =
        b"POST /a?b=1 HTTP/1.1\r\nHost: w3.org\r\nContent-Length: 7\r\n\r\na=1&b=2";

    #[test]
    fn titles() {
        assert!(has_request_title(REQUEST));
        assert!(!has_request_title(b"BREW /pot HTCPCP/1.0\r\n"));
        assert!(!has_request_title(b"GET /nocrlf HTTP/1.1"));
        assert!(has_response_title(b"HTTP/1.1 200 OK\r\n\r\n"));
        assert!(has_response_title(b"HTTP/1.0 404 Not Found\r\n"));
        assert!(!has_response_title(b"HTTP/1.1 abc\r\n"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        assert_eq!(header(REQUEST, b"host"), b"w3.org");
        assert_eq!(header(REQUEST, b"Content-Length"), b"7");
        assert_eq!(header(REQUEST, b"X-Missing"), b"");
    }

    #[test]
    fn set_header_replaces_in_place() {
        let out = set_header(REQUEST, b"Host", b"example.com");
        assert_eq!(header(&out, b"Host"), b"example.com");
        assert!(has_full_payload(&out));
    }

    #[test]
    fn set_header_inserts_before_content_length() {
        let out = set_header(REQUEST, b"X-Real-IP", b"10.0.0.9");
        let cl = find(&out, b"Content-Length").unwrap();
        let real = find(&out, b"X-Real-IP").unwrap();
        assert!(real < cl);
        assert_eq!(header(&out, b"X-Real-IP"), b"10.0.0.9");
    }

    #[test]
    fn delete_header_removes_line() {
        let out = delete_header(REQUEST, b"Host");
        assert_eq!(header(&out, b"Host"), b"");
        assert!(has_request_title(&out));
    }

    #[test]
    fn path_and_params() {
        assert_eq!(method(REQUEST), b"POST");
        assert_eq!(path(REQUEST), b"/a?b=1");
        let (value, start, _) = path_param(REQUEST, "b");
        assert_eq!(value, b"1");
        assert!(start > 0);
        let (_, start, _) = path_param(REQUEST, "missing");
        assert_eq!(start, -1);
    }

    #[test]
    fn set_path_param_replaces_and_appends() {
        let replaced = set_path_param(REQUEST, "b", b"9");
        assert_eq!(path(&replaced), b"/a?b=9");
        let appended = set_path_param(b"GET /a HTTP/1.1\r\n\r\n", "q", b"1");
        assert_eq!(path(&appended), b"/a?q=1");
    }

    #[test]
    fn full_payload_content_length() {
        assert!(has_full_payload(REQUEST));
        assert!(!has_full_payload(&REQUEST[..REQUEST.len() - 1]));
        assert!(has_full_payload(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"));
        assert!(!has_full_payload(b"GET / HTTP/1.1\r\nHost: a\r\n"));
    }

    #[test]
    fn full_payload_chunked() {
        let complete =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n";
        assert!(has_full_payload(complete));
        let open = &complete[..complete.len() - 5];
        assert!(!has_full_payload(open));
        let trailers = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\nX-Sum: 1\r\n\r\n";
        assert!(has_full_payload(trailers));
    }

    #[test]
    fn fnv32a_reference_values() {
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9cf968);
    }
}
