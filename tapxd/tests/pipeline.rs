//! End-to-end reassembly scenarios driven straight through the message
//! pool and the emitter.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tapxd::emitter::Emitter;
use tapxd::framer::http2::{write_data_frame, write_headers_frame, CLIENT_PREFACE};
use tapxd::framer::FramerRegistry;
use tapxd::payload;
use tapxd::plugin::{Envelope, PluginError, PluginReader, PluginWriter};
use tapxd::tcp::ack::AckCache;
use tapxd::tcp::pool::now_ns;
use tapxd::tcp::{Message, MessagePool, Packet};

use async_trait::async_trait;
use tapx_core::config::{EmitterConfig, ModifierConfig};

const LISTEN: &str = "10.0.0.2:8000";

fn packet(to_server: bool, seq: u32, payload: Vec<u8>) -> Packet {
    let (src_ip, src_port, dst_ip, dst_port) = if to_server {
        (Ipv4Addr::new(10, 0, 0, 1), 40000, Ipv4Addr::new(10, 0, 0, 2), 8000)
    } else {
        (Ipv4Addr::new(10, 0, 0, 2), 8000, Ipv4Addr::new(10, 0, 0, 1), 40000)
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
        captured_len: payload.len(),
        payload,
        lost: 0,
        ip_version: 4,
        timestamp_ns: now_ns(),
    }
}

fn pool_for(protocol: &str) -> (MessagePool, Arc<Mutex<Vec<Message>>>) {
    let sink: Arc<Mutex<Vec<Message>>> = Arc::default();
    let captured = sink.clone();
    let mut pool = MessagePool::new(
        0,
        Duration::from_secs(5),
        Arc::new(AckCache::default()),
        Box::new(move |m| captured.lock().unwrap().push(m)),
    );
    pool.set_address(LISTEN);
    let registry = FramerRegistry::with_defaults();
    pool.set_framer(protocol, registry.build(protocol, LISTEN));
    pool.match_uuid(true);
    (pool, sink)
}

#[test]
fn http_request_reassembles_across_two_packets() {
    let (mut pool, sink) = pool_for("http");

    // Control-only handshake packets open no bucket under the http framer.
    let mut syn = packet(true, 99, Vec::new());
    syn.syn = true;
    syn.has_ack = false;
    pool.handle_packet(syn);
    let mut syn_ack = packet(false, 0, Vec::new());
    syn_ack.syn = true;
    pool.handle_packet(syn_ack);
    assert_eq!(pool.in_flight(), 0);

    pool.handle_packet(packet(
        true,
        100,
        b"POST /a HTTP/1.1\r\nContent-Length: 7\r\nHost: w3.org\r\n\r\n".to_vec(),
    ));
    pool.handle_packet(packet(true, 154, b"a=1&b=2".to_vec()));

    let messages = sink.lock().unwrap();
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.stats.length, 60);
    assert_eq!(message.stats.length, message.data().len());
    assert!(message.stats.is_incoming);

    let meta = payload::payload_header(
        payload::REQUEST_PAYLOAD,
        message.uuid(),
        message.stats.start_ns as i64,
        (message.stats.end_ns - message.stats.start_ns) as i64,
    );
    let fields = payload::payload_meta(&meta).unwrap();
    assert_eq!(fields[0], b"1");
    assert_eq!(fields[1].len(), 24);
    assert!(message
        .data()
        .starts_with(b"POST /a HTTP/1.1\r\n"));
    assert!(message.data().ends_with(b"a=1&b=2"));
}

#[test]
fn grpc_request_response_pair_share_a_uuid() {
    let (mut pool, sink) = pool_for("grpc");

    let mut client_headers = hpack::Encoder::new();
    let request_block = client_headers.encode(vec![
        (b":method".as_slice(), b"POST".as_slice()),
        (b":path".as_slice(), b"/pkg.Svc/Method".as_slice()),
    ]);
    let mut request_payload = CLIENT_PREFACE.to_vec();
    request_payload.extend_from_slice(&write_headers_frame(1, false, true, &request_block));
    pool.handle_packet(packet(true, 10, request_payload));

    let mut grpc_body = vec![0u8, 0, 0, 0, 8];
    grpc_body.extend_from_slice(b"protobuf");
    pool.handle_packet(packet(true, 50, write_data_frame(1, true, &grpc_body)));

    let mut server_headers = hpack::Encoder::new();
    let response_block = server_headers.encode(vec![(b":status".as_slice(), b"200".as_slice())]);
    pool.handle_packet(packet(false, 70, write_headers_frame(1, false, true, &response_block)));
    let response_data = write_data_frame(1, true, &grpc_body);
    pool.handle_packet(packet(false, 90, response_data.clone()));

    let messages = sink.lock().unwrap();
    assert_eq!(messages.len(), 2);
    let request = messages.iter().find(|m| m.stats.is_incoming).unwrap();
    let response = messages.iter().find(|m| !m.stats.is_incoming).unwrap();
    assert_eq!(request.uuid().len(), 24);
    assert_eq!(request.uuid(), response.uuid());
    // The response carries the DATA frame bytes for its stream.
    assert!(response
        .data()
        .windows(response_data.len())
        .any(|window| window == response_data));
}

#[test]
fn chunked_response_closes_only_when_terminated() {
    let (mut pool, sink) = pool_for("http");

    pool.handle_packet(packet(
        false,
        10,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n".to_vec(),
    ));
    assert_eq!(pool.in_flight(), 1, "open until the zero chunk arrives");

    pool.handle_packet(packet(false, 64, b"0\r\n\r\n".to_vec()));
    assert_eq!(pool.in_flight(), 0);
    let messages = sink.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(!messages[0].stats.timed_out);
}

struct OneShotInput {
    messages: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl PluginReader for OneShotInput {
    async fn plugin_read(&self) -> Result<Envelope, PluginError> {
        let mut messages = self.messages.lock().unwrap();
        if messages.is_empty() {
            return Err(PluginError::Stopped);
        }
        Ok(messages.remove(0))
    }
}

#[derive(Default)]
struct RecordingOutput {
    written: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl PluginWriter for RecordingOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        self.written.lock().unwrap().push(msg.clone());
        Ok(msg.data.len())
    }
}

#[tokio::test]
async fn modifier_rewrites_paths_through_the_emitter() {
    let input = Arc::new(OneShotInput {
        messages: Mutex::new(vec![
            Envelope {
                meta: payload::payload_header(b'1', "aabbccddeeff001122334455", 1, -1),
                data: b"POST /v1/user/ping HTTP/1.1\r\n\r\n".to_vec(),
                ..Envelope::default()
            },
            Envelope {
                meta: payload::payload_header(b'1', "aabbccddeeff001122334456", 1, -1),
                data: b"POST /v1/user/bob/ping HTTP/1.1\r\n\r\n".to_vec(),
                ..Envelope::default()
            },
        ]),
    });
    let sink = Arc::new(RecordingOutput::default());

    let modifier = ModifierConfig {
        url_rewrite: vec!["/v1/user/([^/]+)/ping:/v2/user/$1/ping".to_string()],
        ..ModifierConfig::default()
    };
    let mut emitter = Emitter::new(&EmitterConfig::default(), &modifier).unwrap();
    emitter.start(vec![input], vec![sink.clone()]);
    emitter.close().await;

    let written = sink.written.lock().unwrap();
    assert_eq!(written.len(), 2);
    assert!(written[0].data.starts_with(b"POST /v1/user/ping HTTP/1.1"));
    assert!(written[1].data.starts_with(b"POST /v2/user/bob/ping HTTP/1.1"));
}
