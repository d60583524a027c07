//! The raw input owns a listener and a message pool and exposes the
//! completed-message stream to the emitter.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use anyhow::{anyhow, Context, Result};
use tapx_core::config::RawInputConfig;

use crate::capture::{self, Listener, PcapOptions};
use crate::framer::FramerRegistry;
use crate::payload::{self, REQUEST_PAYLOAD, RESPONSE_PAYLOAD};
use crate::plugin::{Envelope, PluginError, PluginReader};
use crate::proto;
use crate::tcp::ack::AckCache;
use crate::tcp::{Message, MessagePool, Stats};

const MESSAGE_CHANNEL_CAPACITY: usize = 1000;
const STATS_RING_CAPACITY: usize = 10_000;
const LOGREPLAY_DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_secs(3);

pub struct RawInput {
    address: String,
    real_ip_header: Option<String>,
    select_hosts: HashSet<String>,
    track_stats: bool,
    message_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    stats: Mutex<Vec<Stats>>,
    listener: capture::ListenerHandle,
}

impl RawInput {
    pub async fn start(config: RawInputConfig, registry: &FramerRegistry) -> Result<Arc<Self>> {
        let (mut host, port) = split_address(&config.address)?;
        let mut bpf_filter = config.bpf_filter.clone();
        let mut buffer_timeout_ms = config.buffer_timeout_ms;

        if config.logreplay {
            if host.parse::<std::net::IpAddr>().is_err() {
                host = auto_select_ip()?;
            }
            info!(%host, port, "recording for logreplay");
            bpf_filter = Some(capture::sampling_filter(
                &config.transport,
                port,
                &host,
                config.sample_rate,
            ));
            if buffer_timeout_ms == 0 {
                buffer_timeout_ms = LOGREPLAY_DEFAULT_BUFFER_TIMEOUT.as_millis() as u64;
            }
        }

        let address = format!("{host}:{port}");
        let mut listener = Listener::new(
            &host,
            port,
            &config.transport,
            config.engine,
            config.track_response,
        )?;
        listener.set_options(PcapOptions {
            bpf_filter,
            promiscuous: config.promiscuous,
            override_snaplen: config.override_snaplen,
            buffer_bytes: config.buffer_bytes,
            buffer_timeout_ms,
            pcap_path: config.pcap_path.clone(),
        });
        listener.activate()?;

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let mut pool = MessagePool::new(
            config.max_message_bytes,
            Duration::from_millis(config.expire_ms),
            Arc::new(AckCache::default()),
            Box::new(move |message| {
                // Back-pressure: a full channel stalls the capture thread.
                if message_tx.blocking_send(message).is_err() {
                    debug!("message channel closed, dropping message");
                }
            }),
        );
        pool.set_address(&address);
        pool.set_framer(&config.protocol, registry.build(&config.protocol, &address));
        pool.match_uuid(config.track_response);

        let pool = Arc::new(Mutex::new(pool));
        let handler_pool = pool.clone();
        let mut handle = listener.listen_background(Arc::new(move |pckt| {
            handler_pool.lock().expect("pool mutex").handle_packet(pckt);
        }))?;

        // Block startup until a capture loop is actually reading, the way a
        // fatal activation error should surface before traffic flows.
        if let Some(ready) = handle.ready.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), ready).await;
        }
        let mut errors = std::mem::replace(&mut handle.errors, mpsc::channel(1).1);
        tokio::spawn(async move {
            if let Some(err) = errors.recv().await {
                // A dead listener cannot record anything; bail out loudly.
                error!(?err, "capture listener failed");
                std::process::exit(1);
            }
        });

        info!("intercepting traffic from {address}");
        Ok(Arc::new(Self {
            address,
            real_ip_header: config.real_ip_header.clone(),
            select_hosts: config.select_hosts.iter().cloned().collect(),
            track_stats: config.stats,
            message_rx: tokio::sync::Mutex::new(message_rx),
            stats: Mutex::new(Vec::new()),
            listener: handle,
        }))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn close(&self) {
        self.listener.stop();
    }

    /// Returns the collected per-message stats and resets the ring.
    pub fn take_stats(&self) -> Vec<Stats> {
        std::mem::take(&mut *self.stats.lock().expect("stats mutex"))
    }

    fn record_stats(&self, stats: Stats) {
        let mut ring = self.stats.lock().expect("stats mutex");
        if ring.len() >= STATS_RING_CAPACITY {
            ring.clear();
        }
        ring.push(stats);
    }
}

#[async_trait]
impl PluginReader for RawInput {
    async fn plugin_read(&self) -> Result<Envelope, PluginError> {
        let message = {
            let mut rx = self.message_rx.lock().await;
            rx.recv().await.ok_or(PluginError::Stopped)?
        };

        if message.stats.lost > 0 {
            debug!(
                length = message.stats.length,
                lost = message.stats.lost,
                "truncated capture, consider overriding the snaplen"
            );
        }
        if message.stats.truncated {
            debug!("message truncated, increase the copy buffer size");
        }
        if message.stats.timed_out && message.stats.length > 0 {
            debug!("message expired before completing, increase the input expiry");
        }

        let mut envelope = Envelope {
            connection_id: message.connection_id(),
            ..Envelope::default()
        };

        let payload_type = if message.stats.is_incoming {
            REQUEST_PAYLOAD
        } else {
            RESPONSE_PAYLOAD
        };

        let stats = message.stats.clone();
        let uuid = message.uuid().to_string();
        envelope.data = message.into_data();

        if payload_type == REQUEST_PAYLOAD {
            if let Some(header) = self.real_ip_header.as_deref() {
                if proto::has_request_title(&envelope.data) {
                    envelope.data = proto::set_header(
                        &envelope.data,
                        header.as_bytes(),
                        stats.src_addr.as_bytes(),
                    );
                }
            }
            if !self.select_hosts.is_empty() {
                let src_host = host_part(&stats.src_addr);
                if !self.select_hosts.contains(src_host) {
                    debug!(host = src_host, "source host not selected, dropping");
                    return Err(PluginError::FilteredFromIp);
                }
            }
        } else {
            // Responses remember where the original request came from.
            envelope.src_addr = host_part(&stats.dst_addr).to_string();
        }

        let latency = stats.end_ns.saturating_sub(stats.start_ns);
        envelope.meta = payload::payload_header(
            payload_type,
            &uuid,
            stats.start_ns as i64,
            latency as i64,
        );

        if self.track_stats {
            self.record_stats(stats);
        }

        Ok(envelope)
    }
}

fn split_address(address: &str) -> Result<(String, u16)> {
    let idx = address
        .rfind(':')
        .ok_or_else(|| anyhow!("input address must be host:port, got {address}"))?;
    let port: u16 = address[idx + 1..]
        .parse()
        .with_context(|| format!("invalid port in input address {address}"))?;
    let host = address[..idx]
        .trim_start_matches('[')
        .trim_end_matches(']');
    Ok((host.to_string(), port))
}

fn host_part(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(idx) => &addr[..idx],
        None => addr,
    }
}

fn auto_select_ip() -> Result<String> {
    let ips = capture::local_ips()?;
    let first = ips
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no non-loopback interface address found"))?;
    if ips.len() > 1 {
        warn!(selected = %first, candidates = ?ips, "multiple local IPs, using the first");
    }
    Ok(first)
}
