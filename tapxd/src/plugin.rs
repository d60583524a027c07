//! Reader/writer seams between inputs, the emitter, and outputs.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin shut down; the consuming loop should end cleanly.
    #[error("plugin stopped")]
    Stopped,
    /// Message rejected by the source-host whitelist.
    #[error("source host filtered")]
    FilteredFromIp,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One message moving through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Meta line including the trailing newline; see `payload`.
    pub meta: Vec<u8>,
    pub data: Vec<u8>,
    /// Source host of the original request, recorded on responses for
    /// correlation.
    pub src_addr: String,
    /// Flow key of the connection the message came from.
    pub connection_id: u128,
}

#[async_trait]
pub trait PluginReader: Send + Sync {
    async fn plugin_read(&self) -> Result<Envelope, PluginError>;
}

#[async_trait]
pub trait PluginWriter: Send + Sync {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError>;
}
