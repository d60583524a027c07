use anyhow::{anyhow, Result};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

/// Key that buckets packets of one directional stream. Plain TCP flows use
/// the low 64 bits; HTTP/2 substreams shift the flow key up and or in the
/// stream id.
pub type MessageKey = u128;

/// One captured TCP (or UDP) segment, decoded from a raw frame.
#[derive(Debug, Clone)]
pub struct Packet {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub has_ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
    pub payload: Vec<u8>,
    /// Bytes present in the capture, before any snaplen truncation.
    pub captured_len: usize,
    /// Estimated bytes lost to snaplen truncation (wire length − captured).
    pub lost: u32,
    pub ip_version: u8,
    /// Capture timestamp, nanoseconds since the epoch.
    pub timestamp_ns: u64,
}

impl Packet {
    /// Decodes an ethernet frame into a packet record. Frames that do not
    /// carry an IP/TCP (or UDP) payload are not an error; they decode to
    /// `None` and the capture loop skips them.
    pub fn parse_ethernet(
        data: &[u8],
        wire_len: u32,
        timestamp_ns: u64,
    ) -> Result<Option<Packet>> {
        let sliced = SlicedPacket::from_ethernet(data)
            .map_err(|e| anyhow!("frame decode failed: {e}"))?;
        Self::from_sliced(sliced, data.len(), wire_len, timestamp_ns)
    }

    /// Decodes a frame that starts at the IP header (raw-socket engines).
    pub fn parse_ip(data: &[u8], wire_len: u32, timestamp_ns: u64) -> Result<Option<Packet>> {
        let sliced =
            SlicedPacket::from_ip(data).map_err(|e| anyhow!("ip decode failed: {e}"))?;
        Self::from_sliced(sliced, data.len(), wire_len, timestamp_ns)
    }

    fn from_sliced(
        sliced: SlicedPacket<'_>,
        captured_len: usize,
        wire_len: u32,
        timestamp_ns: u64,
    ) -> Result<Option<Packet>> {
        let (src_ip, dst_ip, ip_version) = match &sliced.net {
            Some(NetSlice::Ipv4(v4)) => (
                IpAddr::V4(v4.header().source_addr()),
                IpAddr::V4(v4.header().destination_addr()),
                4u8,
            ),
            Some(NetSlice::Ipv6(v6)) => (
                IpAddr::V6(v6.header().source_addr()),
                IpAddr::V6(v6.header().destination_addr()),
                6u8,
            ),
            _ => return Ok(None),
        };

        let lost = (wire_len as usize).saturating_sub(captured_len) as u32;

        match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => Ok(Some(Packet {
                src_ip,
                dst_ip,
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                syn: tcp.syn(),
                has_ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                urg: tcp.urg(),
                payload: tcp.payload().to_vec(),
                captured_len,
                lost,
                ip_version,
                timestamp_ns,
            })),
            // UDP datagrams ride the same record: one datagram, one payload,
            // no sequencing or control flags.
            Some(TransportSlice::Udp(udp)) => Ok(Some(Packet {
                src_ip,
                dst_ip,
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                seq: 0,
                ack: 0,
                syn: false,
                has_ack: false,
                fin: false,
                rst: false,
                psh: true,
                urg: false,
                payload: udp.payload().to_vec(),
                captured_len,
                lost,
                ip_version,
                timestamp_ns,
            })),
            _ => Ok(None),
        }
    }

    pub fn src(&self) -> String {
        format!("{}:{}", self.src_ip, self.src_port)
    }

    pub fn dst(&self) -> String {
        format!("{}:{}", self.dst_ip, self.dst_port)
    }

    /// Compact flag rendering for debug logs.
    pub fn flag(&self) -> String {
        let mut out = String::new();
        for (set, ch) in [
            (self.syn, 'S'),
            (self.has_ack, 'A'),
            (self.psh, 'P'),
            (self.fin, 'F'),
            (self.rst, 'R'),
            (self.urg, 'U'),
        ] {
            if set {
                out.push(ch);
            }
        }
        out
    }
}

fn low32(ip: &IpAddr) -> u32 {
    match ip {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            u32::from_be_bytes([octets[12], octets[13], octets[14], octets[15]])
        }
    }
}

/// 64-bit flow key: `src_port << 48 | dst_port << 32 | low-32-of-src-IP`.
/// With `peer` set, source and destination swap, so a request's peer key
/// equals its response's as-seen key.
pub fn default_message_key(pckt: &Packet, peer: bool) -> MessageKey {
    let (src_ip, src_port, dst_port) = if peer {
        (&pckt.dst_ip, pckt.dst_port, pckt.src_port)
    } else {
        (&pckt.src_ip, pckt.src_port, pckt.dst_port)
    };
    let key =
        ((src_port as u64) << 48) | ((dst_port as u64) << 32) | (low32(src_ip) as u64);
    key as MessageKey
}

/// Extends a flow key with an HTTP/2 stream id in the high bits.
pub fn extend_key(key: MessageKey, stream_id: u32) -> MessageKey {
    (key << 32) | stream_id as MessageKey
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_packet(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Packet {
        Packet {
            src_ip: IpAddr::V4(src.0),
            dst_ip: IpAddr::V4(dst.0),
            src_port: src.1,
            dst_port: dst.1,
            seq: 1,
            ack: 1,
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
            timestamp_ns: 1,
        }
    }

    #[test]
    fn key_symmetry() {
        let a = test_packet((Ipv4Addr::new(10, 0, 0, 1), 34567), (Ipv4Addr::new(10, 0, 0, 2), 80), b"");
        let mut b = a.clone();
        std::mem::swap(&mut b.src_ip, &mut b.dst_ip);
        std::mem::swap(&mut b.src_port, &mut b.dst_port);
        assert_eq!(default_message_key(&a, true), default_message_key(&b, false));
        assert_eq!(default_message_key(&a, false), default_message_key(&b, true));
    }

    #[test]
    fn key_packs_ports_and_ip() {
        let pckt = test_packet(
            (Ipv4Addr::new(1, 2, 3, 4), 0x1234),
            (Ipv4Addr::new(5, 6, 7, 8), 0x5678),
            b"",
        );
        let key = default_message_key(&pckt, false);
        assert_eq!(key >> 48, 0x1234);
        assert_eq!((key >> 32) & 0xffff, 0x5678);
        assert_eq!(key & 0xffff_ffff, 0x0102_0304);
    }

    #[test]
    fn extended_key_keeps_stream_id() {
        let base = 0xdead_beef_u128;
        let ext = extend_key(base, 7);
        assert_eq!(ext & 0xffff_ffff, 7);
        assert_eq!(ext >> 32, base);
    }

    #[test]
    fn parses_a_tcp_syn_frame() {
        use etherparse::PacketBuilder;
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(34567, 8000, 100, 1024);
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();
        let wire_len = frame.len() as u32;
        let pckt = Packet::parse_ethernet(&frame, wire_len, 42)
            .unwrap()
            .expect("tcp packet");
        assert_eq!(pckt.src_port, 34567);
        assert_eq!(pckt.dst_port, 8000);
        assert_eq!(pckt.seq, 100);
        assert!(pckt.payload.is_empty());
        assert_eq!(pckt.timestamp_ns, 42);
    }
}
