//! Raw TCP forwarder: streams captured request envelopes to another tapx
//! instance (or anything speaking the separator framing).

use async_trait::async_trait;
use metrics::counter;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tapx_core::config::TcpOutputConfig;

use crate::client::{RetryPolicy, TcpClient, TcpClientConfig};
use crate::payload::{is_origin_payload, is_request_payload, payload_id, PAYLOAD_SEPARATOR};
use crate::plugin::{Envelope, PluginError, PluginWriter};
use crate::proto::fnv32a;
use crate::stat::QueueStats;

const WORKER_QUEUE: usize = 100;
const QUEUE_STATS_INTERVAL_MS: u64 = 5_000;

pub struct TcpOutput {
    address: String,
    sticky: bool,
    buffers: Vec<mpsc::Sender<Envelope>>,
    round_robin: AtomicU32,
    queue_stats: Option<QueueStats>,
}

impl TcpOutput {
    pub fn new(config: &TcpOutputConfig) -> Self {
        let mut buffers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            let client = TcpClient::new(
                &config.address,
                TcpClientConfig {
                    timeout: std::time::Duration::from_millis(config.timeout_ms),
                    retry: RetryPolicy::None,
                    ..TcpClientConfig::default()
                },
            );
            tokio::spawn(worker(client, rx));
            buffers.push(tx);
        }
        Self {
            address: config.address.clone(),
            sticky: config.sticky,
            buffers,
            round_robin: AtomicU32::new(0),
            queue_stats: config
                .stats
                .then(|| QueueStats::new("output_tcp", QUEUE_STATS_INTERVAL_MS)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sticky routing keeps one UUID on one worker so request order is
    /// preserved per exchange.
    fn bucket_index(&self, msg: &Envelope) -> usize {
        if !self.sticky {
            let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
            return next as usize % self.buffers.len();
        }
        fnv32a(payload_id(&msg.meta)) as usize % self.buffers.len()
    }
}

async fn worker(client: TcpClient, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(msg) = rx.recv().await {
        if !is_request_payload(&msg.meta) {
            continue;
        }
        let mut frame =
            Vec::with_capacity(msg.meta.len() + msg.data.len() + PAYLOAD_SEPARATOR.len());
        frame.extend_from_slice(&msg.meta);
        frame.extend_from_slice(&msg.data);
        frame.extend_from_slice(PAYLOAD_SEPARATOR);
        let (result, _) = client.send(&frame).await;
        if let Err(err) = result {
            counter!("tapx_tcp_output_send_errors_total").increment(1);
            warn!(?err, addr = client.addr(), "tcp output send failed");
        } else {
            debug!(addr = client.addr(), bytes = frame.len(), "tcp output sent");
        }
    }
}

#[async_trait]
impl PluginWriter for TcpOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        if !is_origin_payload(&msg.meta) {
            return Ok(msg.data.len());
        }
        let index = self.bucket_index(msg);
        if self.buffers[index].send(msg.clone()).await.is_err() {
            return Err(PluginError::Stopped);
        }
        if let Some(stats) = &self.queue_stats {
            stats.write(WORKER_QUEUE - self.buffers[index].capacity());
        }
        Ok(msg.data.len() + msg.meta.len())
    }
}
