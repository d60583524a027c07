pub mod binary;
pub mod file;
pub mod http;
pub mod stdout;
pub mod tcp;

pub use binary::BinaryOutput;
pub use file::FileOutput;
pub use http::HttpOutput;
pub use stdout::StdoutOutput;
pub use tcp::TcpOutput;
