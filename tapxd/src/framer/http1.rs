use crate::proto;
use crate::tcp::packet::{default_message_key, MessageKey, Packet};
use crate::tcp::pool::Message;

use super::{is_response, Framer};

/// HTTP/1.x message boundaries: a message starts at a request or status
/// line and ends when the payload is complete per its body indicators.
pub struct Http1Framer {
    listen_addr: String,
}

impl Http1Framer {
    pub fn new(listen_addr: &str) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
        }
    }
}

impl Framer for Http1Framer {
    fn start(&mut self, pckt: &Packet) -> (bool, bool) {
        // Handshake and keep-alive segments carry no payload.
        if pckt.payload.is_empty() {
            return (false, false);
        }
        if proto::has_request_title(&pckt.payload) {
            return (true, false);
        }
        (false, proto::has_response_title(&pckt.payload))
    }

    fn end(&mut self, msg: &Message) -> bool {
        proto::has_full_payload(msg.data())
    }

    fn message_key(&mut self, pckt: &Packet, peer: bool) -> MessageKey {
        default_message_key(pckt, peer)
    }

    fn req_rsp_key(&mut self, pckt: &Packet) -> MessageKey {
        // Responses take the peer orientation so both directions share a key.
        let is_out = is_response(pckt, &self.listen_addr);
        self.message_key(pckt, is_out)
    }

    fn message_group_by(&mut self, pckt: &Packet) -> Vec<(MessageKey, Packet)> {
        vec![(self.message_key(pckt, false), pckt.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn packet(src_port: u16, dst_port: u16, payload: &[u8]) -> Packet {
        Packet {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port,
            dst_port,
            seq: 10,
            ack: 20,
            syn: false,
            has_ack: true,
            fin: false,
            rst: false,
            psh: true,
            urg: false,
            payload: payload.to_vec(),
            captured_len: payload.len(),
            lost: 0,
            ip_version: 4,
            timestamp_ns: 0,
        }
    }

    #[test]
    fn start_detects_direction_from_title() {
        let mut framer = Http1Framer::new("10.0.0.2:8000");
        assert_eq!(
            framer.start(&packet(40000, 8000, b"GET / HTTP/1.1\r\n\r\n")),
            (true, false)
        );
        assert_eq!(
            framer.start(&packet(8000, 40000, b"HTTP/1.1 200 OK\r\n\r\n")),
            (false, true)
        );
        assert_eq!(framer.start(&packet(40000, 8000, b"")), (false, false));
        assert_eq!(
            framer.start(&packet(40000, 8000, b"garbage bytes here")),
            (false, false)
        );
    }

    #[test]
    fn req_rsp_key_matches_between_directions() {
        let mut framer = Http1Framer::new("10.0.0.2:8000");
        let request = packet(40000, 8000, b"GET / HTTP/1.1\r\n\r\n");
        let mut response = packet(8000, 40000, b"HTTP/1.1 200 OK\r\n\r\n");
        std::mem::swap(&mut response.src_ip, &mut response.dst_ip);
        assert_eq!(
            framer.req_rsp_key(&request),
            framer.req_rsp_key(&response)
        );
    }
}
