//! Builds the running pipeline out of the configuration: inputs, outputs,
//! and the emitter wiring between them.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use tapx_core::config::Config;

use crate::framer::FramerRegistry;
use crate::input::{RawInput, TcpInput};
use crate::logreplay::LogReplayOutput;
use crate::plugin::{PluginReader, PluginWriter};
use crate::sink::{BinaryOutput, FileOutput, HttpOutput, StdoutOutput, TcpOutput};

pub struct Pipeline {
    pub inputs: Vec<Arc<dyn PluginReader>>,
    pub outputs: Vec<Arc<dyn PluginWriter>>,
    raw_inputs: Vec<Arc<RawInput>>,
    tcp_inputs: Vec<Arc<TcpInput>>,
    file_outputs: Vec<Arc<FileOutput>>,
    http_outputs: Vec<Arc<HttpOutput>>,
    binary_outputs: Vec<Arc<BinaryOutput>>,
    logreplay_output: Option<Arc<LogReplayOutput>>,
}

impl Pipeline {
    pub async fn build(config: &Config) -> Result<Pipeline> {
        let registry = FramerRegistry::with_defaults();
        let mut pipeline = Pipeline {
            inputs: Vec::new(),
            outputs: Vec::new(),
            raw_inputs: Vec::new(),
            tcp_inputs: Vec::new(),
            file_outputs: Vec::new(),
            http_outputs: Vec::new(),
            binary_outputs: Vec::new(),
            logreplay_output: None,
        };

        for raw_config in &config.inputs.raw {
            let input = RawInput::start(raw_config.clone(), &registry)
                .await
                .with_context(|| format!("raw input {}", raw_config.address))?;
            pipeline.raw_inputs.push(input.clone());
            pipeline.inputs.push(input);
        }
        for tcp_config in &config.inputs.tcp {
            let input = TcpInput::start(tcp_config.clone())
                .await
                .with_context(|| format!("tcp input {}", tcp_config.listen))?;
            pipeline.tcp_inputs.push(input.clone());
            pipeline.inputs.push(input);
        }

        if config.outputs.stdout {
            pipeline.outputs.push(Arc::new(StdoutOutput));
        }
        for file_config in &config.outputs.file {
            let output = FileOutput::new(file_config.clone());
            pipeline.file_outputs.push(output.clone());
            pipeline.outputs.push(output);
        }
        for http_config in &config.outputs.http {
            let output = HttpOutput::new(http_config.clone())
                .with_context(|| format!("http output {}", http_config.url))?;
            if http_config.track_responses {
                // Replayed responses feed back through the emitter.
                pipeline.inputs.push(output.clone());
            }
            pipeline.http_outputs.push(output.clone());
            pipeline.outputs.push(output);
        }
        for tcp_config in &config.outputs.tcp {
            pipeline.outputs.push(Arc::new(TcpOutput::new(tcp_config)));
        }
        for binary_config in &config.outputs.binary {
            let output = BinaryOutput::new(binary_config.clone());
            if binary_config.track_responses {
                pipeline.inputs.push(output.clone());
            }
            pipeline.binary_outputs.push(output.clone());
            pipeline.outputs.push(output);
        }
        if let Some(logreplay_config) = config.outputs.logreplay.clone() {
            let listen_addr = pipeline
                .raw_inputs
                .first()
                .map(|input| input.address().to_string())
                .unwrap_or_default();
            let output = LogReplayOutput::start(logreplay_config.clone(), &listen_addr)
                .await
                .context("logreplay output")?;
            if logreplay_config.track_responses {
                pipeline.inputs.push(output.clone());
            }
            pipeline.logreplay_output = Some(output.clone());
            pipeline.outputs.push(output);
        }

        info!(
            inputs = pipeline.inputs.len(),
            outputs = pipeline.outputs.len(),
            "pipeline assembled"
        );
        Ok(pipeline)
    }

    /// Stops the inputs, unblocks response readers, and flushes the file
    /// outputs.
    pub fn shutdown(&self) {
        for input in &self.raw_inputs {
            input.close();
        }
        for input in &self.tcp_inputs {
            input.close();
        }
        for output in &self.http_outputs {
            output.close();
        }
        for output in &self.binary_outputs {
            output.close();
        }
        if let Some(output) = &self.logreplay_output {
            output.close();
        }
        for output in &self.file_outputs {
            output.close();
        }
    }
}
