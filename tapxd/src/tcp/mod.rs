pub mod ack;
pub mod packet;
pub mod pool;

pub use packet::{default_message_key, extend_key, MessageKey, Packet};
pub use pool::{Message, MessagePool, Stats};
