//! LogReplay sink: correlates captured requests and responses by UUID,
//! rate-limits recording, optionally replays requests against a live
//! target, and ships batched report records to the collector.

pub mod client;
pub mod models;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use anyhow::{Context, Result};
use tapx_core::config::LogReplayOutputConfig;

use crate::client::{RetryPolicy, SendOutcome, TcpClient, TcpClientConfig};
use crate::codec::{header_codec, HeaderCodec, ProtocolHeader, GRPC_NAME};
use crate::framer::http2::{empty_settings_frame, CLIENT_PREFACE};
use crate::payload::{
    is_origin_payload, payload_header, payload_id, REPLAYED_RESPONSE_PAYLOAD, REQUEST_PAYLOAD,
    RESPONSE_PAYLOAD,
};
use crate::plugin::{Envelope, PluginError, PluginReader, PluginWriter};
use crate::proto::fnv32a;
use crate::tcp::pool::now_ns;

use client::GatewayClient;
use models::{GoReplayMessage, GoReplayTaskReq, ReportItem, REPORT_TYPE};

const CACHE_TTL: Duration = Duration::from_secs(60);
const WORKER_QUEUE: usize = 100;
const REPORTER_COUNT: usize = 5;
const REPORT_BATCH_SIZE: usize = 100;
const REPORT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const OPERATOR: &str = "tapx";

/// Sharded byte cache with a 60 s entry TTL, bounded by total payload
/// bytes.
struct TtlCache {
    map: DashMap<String, (Vec<u8>, u64)>,
    bytes: AtomicU64,
    max_bytes: u64,
}

impl TtlCache {
    fn new(max_bytes: u64) -> Self {
        Self {
            map: DashMap::new(),
            bytes: AtomicU64::new(0),
            max_bytes,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.map.get(key)?;
        let (value, expires_ns) = entry.value();
        if *expires_ns < now_ns() {
            drop(entry);
            self.del(key);
            return None;
        }
        Some(value.clone())
    }

    fn set(&self, key: String, value: Vec<u8>) {
        if self.bytes.load(Ordering::Relaxed) > self.max_bytes {
            self.evict_expired();
            if self.bytes.load(Ordering::Relaxed) > self.max_bytes {
                warn!("logreplay cache full, clearing");
                self.map.clear();
                self.bytes.store(0, Ordering::Relaxed);
            }
        }
        let expires_ns = now_ns() + CACHE_TTL.as_nanos() as u64;
        self.bytes.fetch_add(value.len() as u64, Ordering::Relaxed);
        if let Some((old, _)) = self.map.insert(key, (value, expires_ns)) {
            self.bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
    }

    fn del(&self, key: &str) {
        if let Some((_, (old, _))) = self.map.remove(key) {
            self.bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
    }

    fn evict_expired(&self) {
        let now = now_ns();
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|entry| entry.value().1 < now)
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.del(&key);
        }
    }
}

struct PendingReports {
    items: Vec<ReportItem>,
    last_flush: std::time::Instant,
}

impl PendingReports {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            last_flush: std::time::Instant::now(),
        }
    }
}

fn request_key(uuid: &str) -> String {
    format!("req_{uuid}")
}

fn request_header_key(uuid: &str) -> String {
    format!("req_header_{uuid}")
}

fn replay_response_key(uuid: &str) -> String {
    format!("replay_rsp_{uuid}")
}

struct Replayed {
    payload: Vec<u8>,
    uuid: String,
    started_at: i64,
    round_trip: i64,
}

pub struct LogReplayOutput {
    conf: LogReplayOutputConfig,
    protocol_service_name: String,
    instance_name: String,
    listen_addr: String,
    gateway: Arc<GatewayClient>,
    codec: Box<dyn HeaderCodec>,
    cache: TtlCache,
    buffers: Vec<mpsc::Sender<Envelope>>,
    report_tx: mpsc::Sender<ReportItem>,
    responses_tx: mpsc::Sender<Replayed>,
    responses_rx: tokio::sync::Mutex<mpsc::Receiver<Replayed>>,
    target_client: Option<TcpClient>,
    record_num: AtomicU64,
    cur_qps: AtomicU32,
    last_sample_ns: AtomicI64,
    task_id: AtomicU32,
    success: AtomicU32,
    dial_fail: AtomicU32,
    write_fail: AtomicU32,
    read_fail: AtomicU32,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

impl LogReplayOutput {
    /// Verifies module authorisation, resolves the service name, and spins
    /// up workers, reporters and the heartbeat.
    pub async fn start(
        mut conf: LogReplayOutputConfig,
        listen_addr: &str,
    ) -> Result<Arc<Self>> {
        clamp_config(&mut conf);

        let gateway = Arc::new(GatewayClient::new(
            &conf.gateway,
            &conf.app_id,
            &conf.app_key,
            &conf.env,
        ));
        gateway
            .check_module_auth(&conf.module_id)
            .await
            .context("logreplay module auth check failed")?;
        let protocol_service_name = match conf.protocol_service_name.clone() {
            Some(name) => name,
            None => {
                let name = gateway
                    .module_service_name(&conf.module_id)
                    .await
                    .context("logreplay service name lookup failed")?;
                info!(service_name = %name, "resolved protocol service name");
                name
            }
        };

        let target_client = conf.target.as_deref().map(|target| {
            TcpClient::new(
                target,
                TcpClientConfig {
                    timeout: Duration::from_millis(conf.target_timeout_ms),
                    retry: RetryPolicy::None,
                    debug: true,
                    ..TcpClientConfig::default()
                },
            )
        });

        let workers = conf.workers;
        let mut buffers = Vec::with_capacity(workers);
        let mut buffer_rxs = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            buffers.push(tx);
            buffer_rxs.push(rx);
        }
        let (report_tx, report_rx) = mpsc::channel(1);
        let (responses_tx, responses_rx) = mpsc::channel(WORKER_QUEUE);

        let output = Arc::new(Self {
            protocol_service_name,
            instance_name: hostname(),
            listen_addr: listen_addr.to_string(),
            gateway: gateway.clone(),
            codec: header_codec(&conf.protocol),
            cache: TtlCache::new((conf.cache_mb as u64) << 20),
            buffers,
            report_tx,
            responses_tx,
            responses_rx: tokio::sync::Mutex::new(responses_rx),
            target_client,
            record_num: AtomicU64::new(0),
            cur_qps: AtomicU32::new(0),
            last_sample_ns: AtomicI64::new(0),
            task_id: AtomicU32::new(0),
            success: AtomicU32::new(0),
            dial_fail: AtomicU32::new(0),
            write_fail: AtomicU32::new(0),
            read_fail: AtomicU32::new(0),
            stop_tx: tokio::sync::watch::channel(false).0,
            conf,
        });

        for rx in buffer_rxs {
            let worker = output.clone();
            tokio::spawn(async move { worker.run_worker(rx).await });
        }

        let report_rx = Arc::new(tokio::sync::Mutex::new(report_rx));
        let pending = Arc::new(std::sync::Mutex::new(PendingReports::new()));
        for _ in 0..REPORTER_COUNT {
            let reporter = output.clone();
            let report_rx = report_rx.clone();
            let pending = pending.clone();
            tokio::spawn(async move { reporter.run_reporter(report_rx, pending).await });
        }
        let flusher = output.clone();
        let flush_pending = pending.clone();
        tokio::spawn(async move { flusher.run_flush_timer(flush_pending).await });

        let heartbeat = output.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = heartbeat.gateway.heartbeat(&heartbeat.listen_addr).await {
                    warn!(?err, "heartbeat failed");
                }
            }
        });

        info!(module = %output.conf.module_id, "logreplay output ready");
        Ok(output)
    }

    /// Unblocks response readers.
    pub fn close(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn run_worker(&self, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            if self.record_num.load(Ordering::SeqCst) > self.conf.record_limit {
                error!(
                    limit = self.conf.record_limit,
                    "record limit reached, stopping logreplay worker"
                );
                return;
            }
            let Some(msg) = rx.recv().await else {
                return;
            };
            if !is_origin_payload(&msg.meta) {
                continue;
            }
            self.handle_message(msg).await;
        }
    }

    async fn handle_message(&self, msg: Envelope) {
        let uuid = String::from_utf8_lossy(payload_id(&msg.meta)).into_owned();
        match msg.meta.first() {
            Some(&REQUEST_PAYLOAD) => self.handle_request(msg, &uuid).await,
            Some(&RESPONSE_PAYLOAD) => self.handle_response(msg, &uuid).await,
            _ => {}
        }
    }

    async fn handle_request(&self, msg: Envelope, uuid: &str) {
        let header = match self.codec.decode(&msg.data) {
            Ok(header) => header,
            Err(err) => {
                warn!(?err, uuid, "request header decode failed");
                return;
            }
        };

        if self.is_qps_over() {
            debug!(
                qps = self.cur_qps.load(Ordering::Relaxed),
                limit = self.conf.qps_limit,
                "qps limit hit, dropping request"
            );
            return;
        }

        let header_json = match serde_json::to_vec(&header) {
            Ok(json) => json,
            Err(err) => {
                warn!(?err, uuid, "request header encode failed");
                return;
            }
        };
        let replay = self.replay(&msg, &header, uuid).await;

        self.cache.set(request_key(uuid), msg.data);
        self.cache.set(request_header_key(uuid), header_json);
        self.cache.set(replay_response_key(uuid), replay);
    }

    async fn handle_response(&self, msg: Envelope, uuid: &str) {
        let Some(cached_request) = self.cache.get(&request_key(uuid)) else {
            // Orphaned response: the request was rate-limited or expired.
            debug!(uuid, "discarding response without cached request");
            return;
        };

        let record = self.build_record(&msg, cached_request, uuid);
        self.cache.del(&request_key(uuid));
        self.cache.del(&request_header_key(uuid));
        self.cache.del(&replay_response_key(uuid));

        let Some(mut record) = record else {
            return;
        };

        if self.conf.target.is_some() && self.task_id.load(Ordering::SeqCst) == 0 {
            match self.create_task().await {
                Ok(task_id) => self.task_id.store(task_id, Ordering::SeqCst),
                Err(err) => {
                    warn!(?err, uuid, "replay task creation failed");
                    return;
                }
            }
        }
        record.task_id = self.task_id.load(Ordering::SeqCst);
        record.success = self.success.load(Ordering::Relaxed);
        record.dial_failed = self.dial_fail.load(Ordering::Relaxed);
        record.write_failed = self.write_fail.load(Ordering::Relaxed);
        record.read_failed = self.read_fail.load(Ordering::Relaxed);
        record.send_failed = record.dial_failed + record.write_failed + record.read_failed;

        let data = match serde_json::to_string(&record) {
            Ok(data) => data,
            Err(err) => {
                warn!(?err, uuid, "record encode failed");
                return;
            }
        };
        let _ = self
            .report_tx
            .send(ReportItem {
                item_type: REPORT_TYPE.to_string(),
                data,
            })
            .await;
    }

    fn build_record(
        &self,
        msg: &Envelope,
        cached_request: Vec<u8>,
        uuid: &str,
    ) -> Option<GoReplayMessage> {
        let header_bytes = self.cache.get(&request_header_key(uuid))?;
        let header: ProtocolHeader = serde_json::from_slice(&header_bytes).ok()?;

        let trace_id = if header.cus_trace_id.is_empty() {
            uuid.to_string()
        } else {
            header.cus_trace_id.clone()
        };

        let mut tag = HashMap::new();
        tag.insert("isGoReplay".to_string(), "true".to_string());
        tag.insert(
            "realServerName".to_string(),
            self.conf.real_server_name.clone().unwrap_or_default(),
        );
        tag.insert("serverAddr".to_string(), self.listen_addr.clone());
        tag.insert("clientAddr".to_string(), msg.src_addr.clone());

        Some(GoReplayMessage {
            module_id: self.conf.module_id.clone(),
            commit_id: self.conf.commit_id.clone(),
            time: now_ns() as f64,
            trace_id,
            instance_name: self.instance_name.clone(),
            service_name: header.service_name,
            api_name: header.api_name,
            protocol: self.conf.protocol.clone(),
            src: OPERATOR.to_string(),
            request_bytes: encode_bytes(&self.with_client_preface(cached_request)),
            response_bytes: encode_bytes(&msg.data),
            replay_bytes: encode_bytes(
                &self.cache.get(&replay_response_key(uuid)).unwrap_or_default(),
            ),
            protocol_service_name: self.protocol_service_name.clone(),
            method_name: header.method_name,
            interface_name: header.interface_name,
            tag,
            ..GoReplayMessage::default()
        })
    }

    /// Live replay of a captured request; the target's answer rides along
    /// in the report record.
    async fn replay(&self, msg: &Envelope, header: &ProtocolHeader, uuid: &str) -> Vec<u8> {
        let Some(client) = self.target_client.as_ref() else {
            return Vec::new();
        };
        if self.conf.protocol == GRPC_NAME {
            if let Some(methods) = self.conf.grpc_replay_method.as_deref() {
                if !methods.contains(header.method_name.as_str()) {
                    debug!(
                        method = %header.method_name,
                        "grpc method not selected for replay"
                    );
                    return Vec::new();
                }
            }
        }

        let data = self.with_client_preface(msg.data.clone());
        let started_at = now_ns();
        let (result, outcome) = client.send(&data).await;
        let round_trip = now_ns().saturating_sub(started_at);
        match outcome {
            SendOutcome::Success => self.success.fetch_add(1, Ordering::Relaxed),
            SendOutcome::DialFailed => self.dial_fail.fetch_add(1, Ordering::Relaxed),
            SendOutcome::WriteFailed => self.write_fail.fetch_add(1, Ordering::Relaxed),
            SendOutcome::ReadFailed => self.read_fail.fetch_add(1, Ordering::Relaxed),
        };
        match result {
            Ok(payload) => {
                if self.conf.track_responses {
                    let _ = self
                        .responses_tx
                        .send(Replayed {
                            payload: payload.clone(),
                            uuid: uuid.to_string(),
                            started_at: started_at as i64,
                            round_trip: round_trip as i64,
                        })
                        .await;
                }
                payload
            }
            Err(err) => {
                debug!(?err, uuid, "replay send failed");
                Vec::new()
            }
        }
    }

    /// gRPC targets need a connection opener ahead of the captured frames.
    fn with_client_preface(&self, data: Vec<u8>) -> Vec<u8> {
        if self.conf.protocol != GRPC_NAME {
            return data;
        }
        let settings = empty_settings_frame();
        let mut out = Vec::with_capacity(CLIENT_PREFACE.len() + settings.len() + data.len());
        out.extend_from_slice(CLIENT_PREFACE);
        out.extend_from_slice(&settings);
        out.extend_from_slice(&data);
        out
    }

    async fn create_task(&self) -> Result<u32> {
        self.gateway
            .create_task(&GoReplayTaskReq {
                module_id: self.conf.module_id.clone(),
                operator: OPERATOR.to_string(),
                total: self.conf.record_limit,
                rate: 100,
                record_commit_id: OPERATOR.to_string(),
                comment: String::new(),
                addrs: self.conf.target.clone().unwrap_or_default(),
                replay_type: 0,
                target_module_id: self.conf.module_id.clone(),
            })
            .await
    }

    /// The pending buffer is shared across the reporter tasks, so batches
    /// fill to the full size regardless of which reporter picked the items
    /// up. A full batch flushes immediately; the flush timer picks up
    /// whatever is left after three quiet seconds.
    async fn run_reporter(
        &self,
        report_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ReportItem>>>,
        pending: Arc<std::sync::Mutex<PendingReports>>,
    ) {
        loop {
            let item = {
                let mut rx = report_rx.lock().await;
                rx.recv().await
            };
            match item {
                Some(item) => {
                    let full = {
                        let mut buf = pending.lock().expect("report buffer");
                        buf.items.push(item);
                        buf.items.len() >= REPORT_BATCH_SIZE
                    };
                    if full {
                        self.commit(&pending).await;
                    }
                }
                None => {
                    self.commit(&pending).await;
                    return;
                }
            }
        }
    }

    async fn run_flush_timer(&self, pending: Arc<std::sync::Mutex<PendingReports>>) {
        loop {
            let deadline = {
                let buf = pending.lock().expect("report buffer");
                buf.last_flush + REPORT_FLUSH_INTERVAL
            };
            tokio::time::sleep_until(deadline.into()).await;
            let due = {
                let buf = pending.lock().expect("report buffer");
                buf.last_flush.elapsed() >= REPORT_FLUSH_INTERVAL && !buf.items.is_empty()
            };
            if due {
                self.commit(&pending).await;
            }
        }
    }

    async fn commit(&self, pending: &Arc<std::sync::Mutex<PendingReports>>) {
        let batch = {
            let mut buf = pending.lock().expect("report buffer");
            buf.last_flush = std::time::Instant::now();
            std::mem::take(&mut buf.items)
        };
        if batch.is_empty() {
            return;
        }
        match self.gateway.report(batch).await {
            Ok(succeed) => {
                let total = self.record_num.fetch_add(succeed, Ordering::SeqCst) + succeed;
                info!(total, "reported records");
            }
            Err(err) => {
                metrics::counter!("tapx_logreplay_report_errors_total").increment(1);
                warn!(?err, "report to collector failed");
            }
        }
    }

    /// Single-second sliding window on atomics.
    fn is_qps_over(&self) -> bool {
        let now = now_ns() as i64;
        if now - self.last_sample_ns.load(Ordering::SeqCst) > 1_000_000_000 {
            self.last_sample_ns.store(now, Ordering::SeqCst);
            self.cur_qps.store(0, Ordering::SeqCst);
        } else {
            self.cur_qps.fetch_add(1, Ordering::SeqCst);
        }
        self.cur_qps.load(Ordering::SeqCst) > self.conf.qps_limit
    }
}

#[async_trait]
impl PluginWriter for LogReplayOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        if !is_origin_payload(&msg.meta) {
            return Ok(msg.data.len());
        }
        // Same UUID, same worker: the response must find its request cache.
        let uuid = payload_id(&msg.meta);
        let bucket = fnv32a(uuid) as usize % self.buffers.len();
        if self.buffers[bucket].send(msg.clone()).await.is_err() {
            return Err(PluginError::Stopped);
        }
        Ok(msg.data.len() + msg.meta.len())
    }
}

#[async_trait]
impl PluginReader for LogReplayOutput {
    async fn plugin_read(&self) -> Result<Envelope, PluginError> {
        if !self.conf.track_responses {
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
        Ok(Envelope {
            meta: payload_header(
                REPLAYED_RESPONSE_PAYLOAD,
                &replayed.uuid,
                replayed.round_trip,
                replayed.started_at,
            ),
            data: replayed.payload,
            ..Envelope::default()
        })
    }
}

fn clamp_config(conf: &mut LogReplayOutputConfig) {
    if conf.timeout_ms < 100 {
        conf.timeout_ms = 1_000;
    }
    if conf.target_timeout_ms == 0 {
        conf.target_timeout_ms = 1_000;
    }
    if conf.workers == 0 {
        conf.workers = 1;
    }
    if conf.cache_mb == 0 {
        conf.cache_mb = 100;
    }
    if conf.record_limit == 0 {
        conf.record_limit = 10_000;
    }
    if conf.qps_limit == 0 {
        conf.qps_limit = 10;
    }
}

fn encode_bytes(data: &[u8]) -> String {
    use base64::Engine as _;
    if data.is_empty() {
        return String::new();
    }
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "127.0.0.1".to_string();
    }
    CStr::from_bytes_until_nul(&buf)
        .ok()
        .and_then(|s| s.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string()
}
