//! Protocol framers decide where application messages start and end inside
//! a TCP stream, and how a response is correlated back to its request.

pub mod grpc;
pub mod http1;
pub mod http2;

use std::collections::HashMap;

use crate::tcp::packet::{MessageKey, Packet};
use crate::tcp::pool::Message;

pub trait Framer: Send {
    /// Whether this packet opens a new message, as `(incoming, outgoing)`.
    fn start(&mut self, pckt: &Packet) -> (bool, bool);

    /// Whether the accumulated data is a complete application message.
    fn end(&mut self, msg: &Message) -> bool;

    /// Bucket key for this packet; `peer` swaps the orientation.
    fn message_key(&mut self, pckt: &Packet, peer: bool) -> MessageKey;

    /// Correlation key shared by a request and its response.
    fn req_rsp_key(&mut self, pckt: &Packet) -> MessageKey;

    /// Splits one captured packet into per-substream slices. Non-multiplexed
    /// protocols return the identity mapping.
    fn message_group_by(&mut self, pckt: &Packet) -> Vec<(MessageKey, Packet)>;
}

pub type FramerBuilder = fn(listen_addr: &str) -> Box<dyn Framer>;

/// Construction-time framer table; built once at startup and handed to each
/// message pool.
#[derive(Default)]
pub struct FramerRegistry {
    builders: HashMap<String, FramerBuilder>,
}

impl FramerRegistry {
    /// Registry with the built-in framers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("http", |addr| Box::new(http1::Http1Framer::new(addr)));
        registry.register("grpc", |addr| Box::new(grpc::GrpcFramer::new(addr)));
        registry
    }

    pub fn register(&mut self, protocol: &str, builder: FramerBuilder) {
        self.builders.insert(protocol.to_string(), builder);
    }

    /// `None` for unregistered protocols; the pool then falls back to plain
    /// connection-oriented reassembly.
    pub fn build(&self, protocol: &str, listen_addr: &str) -> Option<Box<dyn Framer>> {
        self.builders
            .get(protocol)
            .map(|builder| builder(listen_addr))
    }
}

/// A packet headed at the recorded address is a request.
pub(crate) fn is_request(pckt: &Packet, listen_addr: &str) -> bool {
    pckt.dst() == listen_addr
}

/// A packet leaving the recorded address is a response.
pub(crate) fn is_response(pckt: &Packet, listen_addr: &str) -> bool {
    pckt.src() == listen_addr
}
