use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::ack::AckCache;
use super::packet::{default_message_key, MessageKey, Packet};
use crate::framer::{is_response, Framer};

/// Initial message buffer when the payload gives no better estimate.
const DEFAULT_BUFFER_CAPACITY: usize = 20_000;
const DEFAULT_MAX_SIZE: usize = 5 << 20;
const MIN_MESSAGE_EXPIRE: Duration = Duration::from_millis(100);
/// Capacity of the request/response UUID match cache, sized like the
/// original 20 MiB byte-bounded cache at ~64 bytes per entry.
const UUID_CACHE_ENTRIES: usize = (20 << 20) / 64;

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Byte-size and timing facts carried alongside every message.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub lost: u32,
    pub length: usize,
    pub start_ns: u64,
    pub end_ns: u64,
    pub src_addr: String,
    pub dst_addr: String,
    pub is_incoming: bool,
    /// Expiry hit before the message ended naturally.
    pub timed_out: bool,
    /// Size cap hit; the last payload was cropped to fit.
    pub truncated: bool,
    pub ip_version: u8,
}

/// An in-flight (or dispatched) application message: the packets that built
/// it plus their concatenated payloads.
#[derive(Debug)]
pub struct Message {
    req_rsp_key: MessageKey,
    uuid: Option<String>,
    packets: Vec<Packet>,
    buf: Vec<u8>,
    pub stats: Stats,
}

impl Message {
    pub fn new(
        src_addr: String,
        dst_addr: String,
        ip_version: u8,
        capacity: usize,
        start_ns: u64,
    ) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_BUFFER_CAPACITY
        } else {
            capacity
        };
        Self {
            req_rsp_key: 0,
            uuid: None,
            packets: Vec::new(),
            buf: Vec::with_capacity(capacity),
            stats: Stats {
                src_addr,
                dst_addr,
                ip_version,
                start_ns,
                ..Stats::default()
            },
        }
    }

    pub fn add(&mut self, pckt: Packet) {
        self.stats.length += pckt.payload.len();
        self.stats.lost += pckt.lost;
        self.stats.end_ns = pckt.timestamp_ns;
        self.buf.extend_from_slice(&pckt.payload);
        self.packets.push(pckt);
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Orders packets by TCP sequence; consumers that care call this before
    /// walking `packets()`.
    pub fn sort(&mut self) {
        self.packets.sort_by_key(|p| p.seq);
    }

    pub fn req_rsp_key(&self) -> MessageKey {
        self.req_rsp_key
    }

    /// Stamped by the pool at dispatch; empty before that.
    pub fn uuid(&self) -> &str {
        self.uuid.as_deref().unwrap_or("")
    }

    /// Flow key of the underlying connection.
    pub fn connection_id(&self) -> MessageKey {
        self.packets
            .first()
            .map(|p| default_message_key(p, false))
            .unwrap_or(0)
    }
}

pub type Handler = Box<dyn FnMut(Message) + Send>;

/// Holds every message still receiving packets, keyed by flow key (extended
/// with the substream for multiplexed protocols). Single-owner: the capture
/// loop drives it packet by packet, and the handler runs inline, so it must
/// only hand the message off and return.
pub struct MessagePool {
    max_size: usize,
    message_expire: Duration,
    pool: HashMap<MessageKey, Message>,
    uuid_cache: Option<LruCache<MessageKey, (String, u64)>>,
    handler: Handler,
    address: String,
    protocol: String,
    framer: Option<Box<dyn Framer>>,
    long_connection: bool,
    acks: Arc<AckCache>,
}

impl MessagePool {
    pub fn new(
        max_size: usize,
        message_expire: Duration,
        acks: Arc<AckCache>,
        handler: Handler,
    ) -> Self {
        Self {
            max_size: if max_size == 0 {
                DEFAULT_MAX_SIZE
            } else {
                max_size
            },
            message_expire: message_expire.max(MIN_MESSAGE_EXPIRE),
            pool: HashMap::new(),
            uuid_cache: None,
            handler,
            address: String::new(),
            protocol: String::new(),
            framer: None,
            long_connection: false,
            acks,
        }
    }

    /// Destination address being recorded, `ip:port`.
    pub fn set_address(&mut self, address: &str) {
        self.address = address.to_string();
    }

    /// Installs the protocol framer; protocols with a framer are treated as
    /// long-lived connections for ACK bookkeeping.
    pub fn set_framer(&mut self, protocol: &str, framer: Option<Box<dyn Framer>>) {
        self.protocol = protocol.to_string();
        self.long_connection = framer.is_some();
        self.framer = framer;
    }

    /// Share one UUID between a request and its response, matched through
    /// the correlation key.
    pub fn match_uuid(&mut self, enable: bool) {
        self.uuid_cache = enable.then(|| {
            LruCache::new(NonZeroUsize::new(UUID_CACHE_ENTRIES).unwrap())
        });
    }

    pub fn in_flight(&self) -> usize {
        self.pool.len()
    }

    fn message_key(&mut self, pckt: &Packet, peer: bool) -> MessageKey {
        match self.framer.as_mut() {
            Some(framer) => framer.message_key(pckt, peer),
            None => default_message_key(pckt, peer),
        }
    }

    fn group_by(&mut self, pckt: &Packet) -> Vec<(MessageKey, Packet)> {
        match self.framer.as_mut() {
            Some(framer) => framer.message_group_by(pckt),
            None => vec![(default_message_key(pckt, false), pckt.clone())],
        }
    }

    /// Feeds one decoded packet through the pool.
    pub fn handle_packet(&mut self, pckt: Packet) {
        debug!(
            src = %pckt.src(),
            dst = %pckt.dst(),
            seq = pckt.seq,
            ack = pckt.ack,
            len = pckt.payload.len(),
            flags = %pckt.flag(),
            "packet"
        );

        let groups = self.group_by(&pckt);
        for (key, item) in groups {
            if item.rst {
                if self.pool.contains_key(&key) {
                    self.dispatch(key);
                }
                let peer = self.message_key(&item, true);
                if self.pool.contains_key(&peer) {
                    self.dispatch(peer);
                }
                debug!(src = %item.src(), dst = %item.dst(), "rst drained flow");
                continue;
            }

            if self.pool.contains_key(&key) {
                self.add_packet(key, item);
                continue;
            }

            let is_in = match self.framer.as_mut() {
                None => {
                    if !item.syn || item.has_ack {
                        continue;
                    }
                    true
                }
                Some(framer) => {
                    let (is_in, is_out) = framer.start(&item);
                    if !(is_in || is_out) {
                        debug!(protocol = %self.protocol, "packet is not a frame start");
                        continue;
                    }
                    is_in
                }
            };

            let mut m = Message::new(
                item.src(),
                item.dst(),
                item.ip_version,
                3 * item.payload.len(),
                item.timestamp_ns,
            );
            m.stats.is_incoming = is_in;
            m.req_rsp_key = match self.framer.as_mut() {
                Some(framer) => framer.req_rsp_key(&pckt),
                None => default_message_key(&pckt, !is_in),
            };
            self.pool.insert(key, m);
            self.add_packet(key, item);
        }

        self.after_handler(&pckt);
    }

    fn add_packet(&mut self, key: MessageKey, mut pckt: Packet) {
        let max_size = self.max_size;
        let Some(m) = self.pool.get_mut(&key) else {
            return;
        };

        let overflow =
            m.stats.length as i64 + pckt.payload.len() as i64 - max_size as i64;
        if overflow > 0 {
            m.stats.truncated = true;
            pckt.payload.truncate(max_size - m.stats.length);
        }

        let fin = pckt.fin;
        let ack = pckt.ack;
        let pckt_dst = pckt.dst();
        let pckt_key = default_message_key(&pckt, false);
        m.add(pckt);

        let should_dispatch = if overflow >= 0 || fin {
            true
        } else {
            let framer_end = match (self.framer.as_mut(), self.pool.get(&key)) {
                (Some(framer), Some(m)) => framer.end(m),
                _ => false,
            };
            if framer_end {
                // This ACK is where the response stream will start.
                let request = pckt_dst == self.address;
                if self.long_connection && request && !fin {
                    self.acks.put_client_ack(pckt_key, ack);
                }
                true
            } else {
                let m = self.pool.get_mut(&key).expect("message inserted above");
                let age = now_ns().saturating_sub(m.stats.start_ns);
                if age > self.message_expire.as_nanos() as u64 {
                    m.stats.timed_out = true;
                    true
                } else {
                    false
                }
            }
        };

        if should_dispatch {
            self.dispatch(key);
        }
    }

    fn dispatch(&mut self, key: MessageKey) {
        if let Some(mut m) = self.pool.remove(&key) {
            m.uuid = Some(self.derive_uuid(&m));
            (self.handler)(m);
        }
    }

    /// Server-to-client ACKs on long connections mark where the next
    /// request will start.
    fn after_handler(&mut self, pckt: &Packet) {
        if self.long_connection
            && pckt.has_ack
            && is_response(pckt, &self.address)
            && !pckt.payload.is_empty()
        {
            let key = default_message_key(pckt, false);
            self.acks.put_server_ack(key, pckt.ack);
            debug!(src = %pckt.src(), dst = %pckt.dst(), ack = pckt.ack, "cached response ack");
        }
    }

    /// 24 hex characters: the first packet's sequence number and the
    /// message end timestamp. With UUID matching on, the correlation key
    /// resolves a previously cached id first, so a response inherits its
    /// request's UUID.
    fn derive_uuid(&mut self, m: &Message) -> String {
        let now = now_ns();
        let ttl = self.message_expire.max(Duration::from_secs(1));
        if let Some(cache) = self.uuid_cache.as_mut() {
            if let Some((uuid, expires_ns)) = cache.pop(&m.req_rsp_key) {
                if expires_ns >= now {
                    return uuid;
                }
            }
        }

        let seq = m.packets.first().map(|p| p.seq).unwrap_or(0);
        let mut id = [0u8; 12];
        id[..4].copy_from_slice(&seq.to_be_bytes());
        id[4..].copy_from_slice(&m.stats.end_ns.to_be_bytes());
        let uuid: String = id.iter().map(|b| format!("{b:02x}")).collect();

        if let Some(cache) = self.uuid_cache.as_mut() {
            cache.put(
                m.req_rsp_key,
                (uuid.clone(), now + ttl.as_nanos() as u64),
            );
        }
        uuid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::FramerRegistry;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    const LISTEN: &str = "10.0.0.2:8000";

    fn packet(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Packet {
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
            seq,
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
            timestamp_ns: now_ns(),
        }
    }

    fn collecting_pool(
        max_size: usize,
        expire: Duration,
        protocol: &str,
    ) -> (MessagePool, Arc<Mutex<Vec<Message>>>) {
        let sink: Arc<Mutex<Vec<Message>>> = Arc::default();
        let captured = sink.clone();
        let mut pool = MessagePool::new(
            max_size,
            expire,
            Arc::new(AckCache::default()),
            Box::new(move |m| captured.lock().unwrap().push(m)),
        );
        pool.set_address(LISTEN);
        let registry = FramerRegistry::with_defaults();
        pool.set_framer(protocol, registry.build(protocol, LISTEN));
        (pool, sink)
    }

    #[test]
    fn reassembles_split_http_request() {
        let (mut pool, sink) = collecting_pool(0, Duration::from_secs(5), "http");
        pool.handle_packet(packet(
            40000,
            8000,
            100,
            b"POST /a HTTP/1.1\r\nContent-Length: 7\r\nHost: w3.org\r\n\r\n",
        ));
        assert_eq!(pool.in_flight(), 1);
        pool.handle_packet(packet(40000, 8000, 154, b"a=1&b=2"));

        let messages = sink.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert!(m.stats.is_incoming);
        assert_eq!(m.stats.length, 60);
        assert_eq!(m.data().len(), 60);
        assert!(m.data().ends_with(b"a=1&b=2"));
        assert!(!m.stats.truncated);
        assert!(!m.stats.timed_out);
        assert_eq!(m.uuid().len(), 24);
    }

    #[test]
    fn truncates_oversized_message() {
        let (mut pool, sink) = collecting_pool(1024, Duration::from_secs(5), "http");
        let mut payload = b"POST /big HTTP/1.1\r\nContent-Length: 5000\r\n\r\n".to_vec();
        payload.resize(2000, b'x');
        pool.handle_packet(packet(40000, 8000, 1, &payload));

        let messages = sink.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].stats.truncated);
        assert_eq!(messages[0].stats.length, 1024);
        assert_eq!(messages[0].data().len(), 1024);
    }

    #[test]
    fn fin_dispatches_immediately() {
        let (mut pool, sink) = collecting_pool(0, Duration::from_secs(5), "http");
        pool.handle_packet(packet(
            40000,
            8000,
            1,
            b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
        ));
        let mut fin = packet(40000, 8000, 43, b"partial");
        fin.fin = true;
        pool.handle_packet(fin);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[test]
    fn rst_drains_both_directions() {
        let (mut pool, sink) = collecting_pool(0, Duration::from_secs(5), "http");
        pool.handle_packet(packet(
            40000,
            8000,
            1,
            b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
        ));
        pool.handle_packet(packet(8000, 40000, 1, b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n"));
        assert_eq!(pool.in_flight(), 2);
        let mut rst = packet(40000, 8000, 50, b"");
        rst.rst = true;
        pool.handle_packet(rst);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(sink.lock().unwrap().len(), 2);
    }

    #[test]
    fn expiry_marks_timed_out() {
        let (mut pool, sink) = collecting_pool(0, Duration::from_millis(100), "http");
        let mut first = packet(
            40000,
            8000,
            1,
            b"POST /a HTTP/1.1\r\nContent-Length: 100\r\n\r\n",
        );
        first.timestamp_ns = now_ns() - 1_000_000_000;
        pool.handle_packet(first);
        // The pool evaluates expiry lazily, on the next packet for the flow.
        assert_eq!(pool.in_flight(), 1);
        pool.handle_packet(packet(40000, 8000, 43, b"more"));
        let messages = sink.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].stats.timed_out);
    }

    #[test]
    fn matched_uuid_is_stable_across_request_and_response() {
        let (mut pool, sink) = collecting_pool(0, Duration::from_secs(5), "http");
        pool.match_uuid(true);
        pool.handle_packet(packet(40000, 8000, 1, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n"));
        pool.handle_packet(packet(
            8000,
            40000,
            700,
            b"HTTP/1.1 204 No Content\r\n\r\n",
        ));
        let messages = sink.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].uuid(), messages[1].uuid());
        assert!(messages[0].stats.is_incoming);
        assert!(!messages[1].stats.is_incoming);
    }

    #[test]
    fn without_framer_only_syn_opens_a_bucket() {
        let sink: Arc<Mutex<Vec<Message>>> = Arc::default();
        let captured = sink.clone();
        let mut pool = MessagePool::new(
            0,
            Duration::from_secs(5),
            Arc::new(AckCache::default()),
            Box::new(move |m| captured.lock().unwrap().push(m)),
        );
        pool.set_address(LISTEN);

        pool.handle_packet(packet(40000, 8000, 1, b"data with no syn"));
        assert_eq!(pool.in_flight(), 0);

        let mut syn = packet(40000, 8000, 1, b"");
        syn.syn = true;
        syn.has_ack = false;
        pool.handle_packet(syn);
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn request_end_records_client_ack() {
        let acks = Arc::new(AckCache::default());
        let mut pool = MessagePool::new(
            0,
            Duration::from_secs(5),
            acks.clone(),
            Box::new(|_| {}),
        );
        pool.set_address(LISTEN);
        let registry = FramerRegistry::with_defaults();
        pool.set_framer("http", registry.build("http", LISTEN));

        let mut request = packet(40000, 8000, 9, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        request.ack = 777;
        let key = default_message_key(&request, false);
        pool.handle_packet(request);
        assert_eq!(acks.client_ack(key), 777);
    }
}
