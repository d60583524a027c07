//! Fan-in over inputs, fan-out over outputs, with the modifier and
//! prettifier applied in line.

use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tapx_core::config::{EmitterConfig, ModifierConfig};

use crate::modifier::HttpModifier;
use crate::payload;
use crate::plugin::{Envelope, PluginError, PluginReader, PluginWriter};
use crate::prettify::prettify_http;
use crate::tcp::pool::now_ns;

const DEFAULT_COPY_BUFFER: usize = 5 << 20;
const SKIP_MAP_TTL_NS: u64 = 60 * 1_000_000_000;
const GC_EVERY_MESSAGES: u64 = 1000;

pub struct Emitter {
    copy_buffer_size: usize,
    prettify_http: bool,
    split: bool,
    modifier: Option<Arc<HttpModifier>>,
    tasks: JoinSet<()>,
}

impl Emitter {
    pub fn new(settings: &EmitterConfig, modifier_config: &ModifierConfig) -> anyhow::Result<Self> {
        let copy_buffer_size = if settings.copy_buffer_bytes == 0 {
            DEFAULT_COPY_BUFFER
        } else {
            settings.copy_buffer_bytes
        };
        Ok(Self {
            copy_buffer_size,
            prettify_http: settings.prettify_http,
            split: settings.split_output,
            modifier: HttpModifier::new(modifier_config)?.map(Arc::new),
            tasks: JoinSet::new(),
        })
    }

    /// One reader task per input; each broadcasts (or round-robins) into
    /// every output.
    pub fn start(
        &mut self,
        inputs: Vec<Arc<dyn PluginReader>>,
        outputs: Vec<Arc<dyn PluginWriter>>,
    ) {
        for input in inputs {
            let outputs = outputs.clone();
            let modifier = self.modifier.clone();
            let copy_buffer_size = self.copy_buffer_size;
            let prettify = self.prettify_http;
            let split = self.split;
            self.tasks.spawn(async move {
                copy_multi(input, outputs, modifier, copy_buffer_size, prettify, split).await;
            });
        }
    }

    /// Waits for all reader loops to drain.
    pub async fn close(mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

async fn copy_multi(
    src: Arc<dyn PluginReader>,
    writers: Vec<Arc<dyn PluginWriter>>,
    modifier: Option<Arc<HttpModifier>>,
    copy_buffer_size: usize,
    prettify: bool,
    split: bool,
) {
    let mut write_index = 0usize;
    // Requests the modifier dropped, by UUID; their responses are dropped
    // too when they show up.
    let mut skipped: HashMap<String, u64> = HashMap::new();
    let mut processed: u64 = 0;

    loop {
        let mut msg = match src.plugin_read().await {
            Ok(msg) => msg,
            Err(PluginError::FilteredFromIp) => {
                counter!("tapx_emitter_filtered_source_total").increment(1);
                continue;
            }
            Err(PluginError::Stopped) => return,
            Err(err) => {
                debug!(?err, "input read failed, stopping reader");
                return;
            }
        };

        if msg.data.is_empty() {
            continue;
        }
        if msg.data.len() > copy_buffer_size {
            debug!(
                len = msg.data.len(),
                limit = copy_buffer_size,
                "truncating oversized message"
            );
            msg.data.truncate(copy_buffer_size);
        }

        let Some(meta) = payload::payload_meta(&msg.meta) else {
            debug!("malformed record without meta line");
            continue;
        };
        if meta.len() < 3 {
            debug!(meta = ?String::from_utf8_lossy(&msg.meta), "malformed record meta");
            continue;
        }
        let uuid = String::from_utf8_lossy(meta[1]).into_owned();

        if let Some(modifier) = modifier.as_deref() {
            if payload::is_request_payload(&msg.meta) {
                msg.data = modifier.rewrite(std::mem::take(&mut msg.data));
                if msg.data.is_empty() {
                    skipped.insert(uuid, now_ns());
                    counter!("tapx_emitter_modifier_dropped_total").increment(1);
                    continue;
                }
            } else if skipped.remove(&uuid).is_some() {
                // The request was dropped; its response follows it out.
                continue;
            }
        }

        if prettify {
            msg.data = prettify_http(std::mem::take(&mut msg.data));
            if msg.data.is_empty() {
                continue;
            }
        }

        write_outputs(&writers, &mut write_index, split, &msg).await;

        processed += 1;
        if processed % GC_EVERY_MESSAGES == 0 {
            collect_skipped(&mut skipped);
        }
    }
}

async fn write_outputs(
    writers: &[Arc<dyn PluginWriter>],
    write_index: &mut usize,
    split: bool,
    msg: &Envelope,
) {
    if writers.is_empty() {
        return;
    }
    if split {
        // Simple round robin.
        let writer = &writers[*write_index];
        if let Err(err) = writer.plugin_write(msg).await {
            warn!(?err, "output write failed");
            counter!("tapx_emitter_write_errors_total").increment(1);
        }
        *write_index = (*write_index + 1) % writers.len();
        return;
    }
    for writer in writers {
        if let Err(err) = writer.plugin_write(msg).await {
            warn!(?err, "output write failed");
            counter!("tapx_emitter_write_errors_total").increment(1);
        }
    }
}

fn collect_skipped(skipped: &mut HashMap<String, u64>) {
    let now = now_ns();
    skipped.retain(|_, stamped| now.saturating_sub(*stamped) <= SKIP_MAP_TTL_NS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedInput {
        messages: Mutex<Vec<Result<Envelope, PluginError>>>,
    }

    #[async_trait]
    impl PluginReader for ScriptedInput {
        async fn plugin_read(&self) -> Result<Envelope, PluginError> {
            let mut messages = self.messages.lock().unwrap();
            if messages.is_empty() {
                return Err(PluginError::Stopped);
            }
            messages.remove(0)
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

    fn envelope(payload_type: u8, uuid: &str, data: &[u8]) -> Envelope {
        Envelope {
            meta: payload::payload_header(payload_type, uuid, 1, -1),
            data: data.to_vec(),
            ..Envelope::default()
        }
    }

    async fn run_pipeline(
        messages: Vec<Result<Envelope, PluginError>>,
        modifier_config: ModifierConfig,
        split: bool,
        outputs: usize,
    ) -> Vec<Arc<RecordingOutput>> {
        let input = Arc::new(ScriptedInput {
            messages: Mutex::new(messages),
        });
        let sinks: Vec<Arc<RecordingOutput>> =
            (0..outputs).map(|_| Arc::default()).collect();
        let writers: Vec<Arc<dyn PluginWriter>> = sinks
            .iter()
            .map(|s| s.clone() as Arc<dyn PluginWriter>)
            .collect();
        let mut emitter = Emitter::new(
            &EmitterConfig {
                split_output: split,
                prettify_http: false,
                copy_buffer_bytes: 1024,
            },
            &modifier_config,
        )
        .unwrap();
        emitter.start(vec![input], writers);
        emitter.close().await;
        sinks
    }

    #[tokio::test]
    async fn broadcasts_to_every_output() {
        let sinks = run_pipeline(
            vec![Ok(envelope(b'1', "aa", b"GET / HTTP/1.1\r\n\r\n"))],
            ModifierConfig::default(),
            false,
            2,
        )
        .await;
        assert_eq!(sinks[0].written.lock().unwrap().len(), 1);
        assert_eq!(sinks[1].written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn split_round_robins() {
        let sinks = run_pipeline(
            vec![
                Ok(envelope(b'1', "aa", b"GET /1 HTTP/1.1\r\n\r\n")),
                Ok(envelope(b'1', "bb", b"GET /2 HTTP/1.1\r\n\r\n")),
                Ok(envelope(b'1', "cc", b"GET /3 HTTP/1.1\r\n\r\n")),
            ],
            ModifierConfig::default(),
            true,
            2,
        )
        .await;
        assert_eq!(sinks[0].written.lock().unwrap().len(), 2);
        assert_eq!(sinks[1].written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_request_takes_its_response_along() {
        let modifier = ModifierConfig {
            url_negative_regexp: vec!["^/private".to_string()],
            ..ModifierConfig::default()
        };
        let sinks = run_pipeline(
            vec![
                Ok(envelope(b'1', "dead", b"GET /private HTTP/1.1\r\n\r\n")),
                Ok(envelope(b'2', "dead", b"HTTP/1.1 200 OK\r\n\r\n")),
                Ok(envelope(b'1', "beef", b"GET /public HTTP/1.1\r\n\r\n")),
                Ok(envelope(b'2', "beef", b"HTTP/1.1 200 OK\r\n\r\n")),
            ],
            modifier,
            false,
            1,
        )
        .await;
        let written = sinks[0].written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert!(written
            .iter()
            .all(|m| payload::payload_id(&m.meta) == b"beef"));
    }

    #[tokio::test]
    async fn oversized_messages_are_truncated() {
        let sinks = run_pipeline(
            vec![Ok(envelope(b'2', "aa", &vec![b'x'; 4096]))],
            ModifierConfig::default(),
            false,
            1,
        )
        .await;
        let written = sinks[0].written.lock().unwrap();
        assert_eq!(written[0].data.len(), 1024);
    }

    #[tokio::test]
    async fn filter_errors_do_not_stop_the_loop() {
        let sinks = run_pipeline(
            vec![
                Err(PluginError::FilteredFromIp),
                Ok(envelope(b'1', "aa", b"GET / HTTP/1.1\r\n\r\n")),
            ],
            ModifierConfig::default(),
            false,
            1,
        )
        .await;
        assert_eq!(sinks[0].written.lock().unwrap().len(), 1);
    }
}
