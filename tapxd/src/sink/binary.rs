//! Binary forwarder: replays captured request bytes over TCP and, when
//! response tracking is on, re-emits whatever the target answered.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use tapx_core::config::BinaryOutputConfig;

use crate::client::{RetryPolicy, TcpClient, TcpClientConfig};
use crate::payload::{
    is_request_payload, payload_header, payload_id, REPLAYED_RESPONSE_PAYLOAD,
};
use crate::plugin::{Envelope, PluginError, PluginReader, PluginWriter};
use crate::tcp::pool::now_ns;

const QUEUE_CAPACITY: usize = 1000;
const INITIAL_DYNAMIC_WORKERS: usize = 10;
const IDLE_POLL: Duration = Duration::from_millis(100);
const IDLE_POLLS_BEFORE_EXIT: u32 = 20;

struct Replayed {
    payload: Vec<u8>,
    uuid: Vec<u8>,
    started_at: i64,
    round_trip: i64,
}

pub struct BinaryOutput {
    address: String,
    config: BinaryOutputConfig,
    queue_tx: mpsc::Sender<Envelope>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    responses_tx: mpsc::Sender<Replayed>,
    responses_rx: tokio::sync::Mutex<mpsc::Receiver<Replayed>>,
    need_worker: mpsc::Sender<usize>,
    active_workers: Arc<AtomicI64>,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl BinaryOutput {
    pub fn new(config: BinaryOutputConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (responses_tx, responses_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (need_tx, mut need_rx) = mpsc::channel(1);
        let output = Arc::new(Self {
            address: config.address.clone(),
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            responses_tx,
            responses_rx: tokio::sync::Mutex::new(responses_rx),
            need_worker: need_tx,
            active_workers: Arc::new(AtomicI64::new(0)),
            stop_tx: tokio::sync::watch::channel(false).0,
            config,
        });

        let initial = if output.config.workers == 0 {
            INITIAL_DYNAMIC_WORKERS
        } else {
            output.config.workers
        };
        let _ = output.need_worker.try_send(initial);

        let master = output.clone();
        tokio::spawn(async move {
            while let Some(wanted) = need_rx.recv().await {
                for _ in 0..wanted {
                    master.clone().spawn_worker();
                }
                // Fixed-size pools never rescale.
                if !master.dynamic() {
                    break;
                }
            }
        });
        output
    }

    fn dynamic(&self) -> bool {
        self.config.workers == 0
    }

    /// Unblocks response readers.
    pub fn close(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn spawn_worker(self: Arc<Self>) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let client = TcpClient::new(
                &self.address,
                TcpClientConfig {
                    timeout: Duration::from_millis(self.config.timeout_ms),
                    response_buffer_size: self.config.buffer_bytes,
                    retry: RetryPolicy::None,
                    debug: self.config.debug,
                },
            );
            let mut idle_polls = 0u32;
            loop {
                let msg = {
                    let mut rx = self.queue_rx.lock().await;
                    tokio::time::timeout(IDLE_POLL, rx.recv()).await
                };
                match msg {
                    Ok(Some(msg)) => {
                        idle_polls = 0;
                        self.send_request(&client, msg).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        if !self.dynamic() {
                            continue;
                        }
                        // Idle dynamic workers die off, down to the last one.
                        idle_polls += 1;
                        if idle_polls > IDLE_POLLS_BEFORE_EXIT
                            && self.active_workers.load(Ordering::SeqCst) > 1
                        {
                            break;
                        }
                    }
                }
            }
            self.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn send_request(&self, client: &TcpClient, msg: Envelope) {
        if !is_request_payload(&msg.meta) {
            return;
        }
        let uuid = payload_id(&msg.meta).to_vec();
        let start = now_ns();
        let (result, _) = client.send(&msg.data).await;
        let stop = now_ns();
        let payload = match result {
            Ok(payload) => payload,
            Err(err) => {
                warn!(?err, addr = %self.address, "binary output request failed");
                return;
            }
        };
        if self.config.track_responses {
            let _ = self
                .responses_tx
                .send(Replayed {
                    payload,
                    uuid,
                    started_at: start as i64,
                    round_trip: (stop - start) as i64,
                })
                .await;
        }
    }
}

#[async_trait]
impl PluginWriter for BinaryOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        if !is_request_payload(&msg.meta) {
            return Ok(msg.data.len());
        }
        if self.queue_tx.send(msg.clone()).await.is_err() {
            return Err(PluginError::Stopped);
        }
        // Ask for more hands while the queue is falling behind.
        if self.dynamic() {
            let backlog = QUEUE_CAPACITY - self.queue_tx.capacity();
            if backlog > self.active_workers.load(Ordering::SeqCst).max(0) as usize {
                let _ = self.need_worker.try_send(backlog);
            }
        }
        Ok(msg.data.len() + msg.meta.len())
    }
}

#[async_trait]
impl PluginReader for BinaryOutput {
    async fn plugin_read(&self) -> Result<Envelope, PluginError> {
        if !self.config.track_responses {
            return Err(PluginError::Stopped);
        }
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Err(PluginError::Stopped);
        }
        let replayed = {
            let mut rx = self.responses_rx.lock().await;
            tokio::select! {
                _ = stop_rx.changed() => return Err(PluginError::Stopped),
                replayed = rx.recv() => replayed.ok_or(PluginError::Stopped)?,
            }
        };
        let uuid = String::from_utf8_lossy(&replayed.uuid).into_owned();
        Ok(Envelope {
            meta: payload_header(
                REPLAYED_RESPONSE_PAYLOAD,
                &uuid,
                replayed.started_at,
                replayed.round_trip,
            ),
            data: replayed.payload,
            ..Envelope::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::payload_header;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn replays_requests_and_tracks_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let _ = stream.read_to_end(&mut buf).await;
                    let _ = stream.write_all(b"pong").await;
                });
            }
        });

        let output = BinaryOutput::new(BinaryOutputConfig {
            address: addr,
            workers: 1,
            timeout_ms: 1_000,
            buffer_bytes: 1024,
            track_responses: true,
            debug: false,
        });

        let mut msg = Envelope {
            meta: payload_header(b'1', "aabbccddeeff00112233aabb", 1, -1),
            data: b"ping".to_vec(),
            ..Envelope::default()
        };
        output.plugin_write(&msg).await.unwrap();

        let replayed = output.plugin_read().await.unwrap();
        assert!(replayed.meta.starts_with(b"3 aabbccddeeff00112233aabb"));
        assert_eq!(replayed.data, b"pong");

        // Responses are not replayed.
        msg.meta = payload_header(b'2', "aabbccddeeff00112233aabb", 1, -1);
        let n = output.plugin_write(&msg).await.unwrap();
        assert_eq!(n, msg.data.len());
    }
}
