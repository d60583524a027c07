//! Last-seen ACK bookkeeping for long-lived connections.
//!
//! On a keep-alive connection the sequence number of the next request equals
//! the last ACK the server sent, and the next response starts at the last
//! ACK the client sent. Two bounded LRUs keep those ACKs per flow key so a
//! framer can recognise the first packet of the next exchange.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use super::packet::{MessageKey, Packet};

const CACHE_CAPACITY: usize = 65_535;

#[derive(Debug)]
pub struct AckCache {
    client: Mutex<LruCache<MessageKey, u32>>,
    server: Mutex<LruCache<MessageKey, u32>>,
}

impl Default for AckCache {
    fn default() -> Self {
        let cap = NonZeroUsize::new(CACHE_CAPACITY).unwrap();
        Self {
            client: Mutex::new(LruCache::new(cap)),
            server: Mutex::new(LruCache::new(cap)),
        }
    }
}

impl AckCache {
    pub fn put_server_ack(&self, key: MessageKey, ack: u32) {
        self.server.lock().expect("ack cache mutex").put(key, ack);
    }

    /// 0 on miss.
    pub fn server_ack(&self, key: MessageKey) -> u32 {
        self.server
            .lock()
            .expect("ack cache mutex")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    pub fn put_client_ack(&self, key: MessageKey, ack: u32) {
        self.client.lock().expect("ack cache mutex").put(key, ack);
    }

    /// 0 on miss.
    pub fn client_ack(&self, key: MessageKey) -> u32 {
        self.client
            .lock()
            .expect("ack cache mutex")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// A packet opens the next exchange when its sequence number equals the
    /// last ACK recorded for the peer direction: request seq matches the last
    /// server ACK, response seq matches the last client ACK.
    pub fn is_exchange_start(
        &self,
        pckt: &Packet,
        peer_key: MessageKey,
        is_request: bool,
        is_response: bool,
    ) -> bool {
        let seq = if is_request {
            self.server_ack(peer_key)
        } else if is_response {
            self.client_ack(peer_key)
        } else {
            return false;
        };
        pckt.seq == seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::packet::default_message_key;
    use std::net::{IpAddr, Ipv4Addr};

    fn packet(seq: u32) -> Packet {
        Packet {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 40000,
            dst_port: 8000,
            seq,
            ack: 0,
            syn: false,
            has_ack: true,
            fin: false,
            rst: false,
            psh: true,
            urg: false,
            payload: b"x".to_vec(),
            captured_len: 1,
            lost: 0,
            ip_version: 4,
            timestamp_ns: 0,
        }
    }

    #[test]
    fn miss_returns_zero() {
        let cache = AckCache::default();
        assert_eq!(cache.server_ack(42), 0);
        assert_eq!(cache.client_ack(42), 0);
    }

    #[test]
    fn last_write_wins() {
        let cache = AckCache::default();
        cache.put_server_ack(7, 100);
        cache.put_server_ack(7, 200);
        assert_eq!(cache.server_ack(7), 200);
    }

    #[test]
    fn request_start_matches_server_ack() {
        let cache = AckCache::default();
        let pckt = packet(500);
        let peer = default_message_key(&pckt, true);
        cache.put_server_ack(peer, 500);
        assert!(cache.is_exchange_start(&pckt, peer, true, false));
        assert!(!cache.is_exchange_start(&packet(501), peer, true, false));
    }

    #[test]
    fn response_start_matches_client_ack() {
        let cache = AckCache::default();
        let pckt = packet(900);
        let peer = default_message_key(&pckt, true);
        cache.put_client_ack(peer, 900);
        assert!(cache.is_exchange_start(&pckt, peer, false, true));
    }
}
