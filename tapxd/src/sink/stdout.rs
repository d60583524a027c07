//! Debug sink: envelopes go to stdout, separator and all.

use async_trait::async_trait;
use std::io::Write;

use crate::payload::PAYLOAD_SEPARATOR;
use crate::plugin::{Envelope, PluginError, PluginWriter};

#[derive(Debug, Default)]
pub struct StdoutOutput;

#[async_trait]
impl PluginWriter for StdoutOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        let mut out = std::io::stdout().lock();
        out.write_all(&msg.meta)?;
        out.write_all(&msg.data)?;
        out.write_all(PAYLOAD_SEPARATOR)?;
        Ok(msg.meta.len() + msg.data.len())
    }
}
