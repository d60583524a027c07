pub mod raw;
pub mod tcp;

pub use raw::RawInput;
pub use tcp::TcpInput;
