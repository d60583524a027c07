pub mod capture;
pub mod client;
pub mod codec;
pub mod emitter;
pub mod framer;
pub mod input;
pub mod logreplay;
pub mod modifier;
pub mod payload;
pub mod plugin;
pub mod prettify;
pub mod proto;
pub mod runtime;
pub mod sink;
pub mod stat;
pub mod tcp;
