//! HTTP replay sink: a dynamic worker pool that re-sends captured HTTP/1.x
//! requests against a configured target and optionally re-emits the
//! responses.

use async_trait::async_trait;
use anyhow::{anyhow, Context, Result};
use hyper::body::HttpBody;
use hyper::client::conn::Builder as ClientConnBuilder;
use hyper::{Body, Request};
use metrics::counter;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use tapx_core::config::HttpOutputConfig;

use crate::payload::{
    is_request_payload, payload_header, payload_id, REPLAYED_RESPONSE_PAYLOAD,
};
use crate::plugin::{Envelope, PluginError, PluginReader, PluginWriter};
use crate::stat::QueueStats;
use crate::tcp::pool::now_ns;

const MAX_PARSED_HEADERS: usize = 64;
const MAX_WORKERS_MIN: usize = 1000;

struct Replayed {
    payload: Vec<u8>,
    uuid: Vec<u8>,
    started_at: i64,
    round_trip: i64,
}

#[derive(Clone)]
struct Target {
    scheme: String,
    authority: String,
    host: String,
    /// Set when the output URL carries a path or query of its own; it then
    /// replaces the captured path entirely.
    path_override: Option<String>,
}

pub struct HttpOutput {
    config: HttpOutputConfig,
    target: Target,
    tls: Option<tokio_native_tls::TlsConnector>,
    queue_tx: mpsc::Sender<Envelope>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    responses_tx: mpsc::Sender<Replayed>,
    responses_rx: tokio::sync::Mutex<mpsc::Receiver<Replayed>>,
    need_worker: mpsc::Sender<()>,
    active_workers: Arc<AtomicI64>,
    queue_stats: Option<QueueStats>,
    stop_tx: tokio::sync::watch::Sender<bool>,
}

const QUEUE_STATS_INTERVAL_MS: u64 = 5_000;

impl HttpOutput {
    pub fn new(mut config: HttpOutputConfig) -> Result<Arc<Self>> {
        let raw = if config.url.contains("://") {
            config.url.clone()
        } else {
            format!("http://{}", config.url)
        };
        let url = url::Url::parse(&raw).with_context(|| format!("output url {raw}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("output url has no host: {raw}"))?
            .to_string();
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None if url.scheme() == "https" => format!("{host}:443"),
            None => format!("{host}:80"),
        };
        let path_override = if url.path() == "/" && url.query().is_none() {
            None
        } else {
            let mut path = url.path().to_string();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            Some(path)
        };

        clamp_worker_config(&mut config);

        let tls = if url.scheme() == "https" {
            let mut builder = native_tls::TlsConnector::builder();
            if config.skip_verify {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            Some(tokio_native_tls::TlsConnector::from(
                builder.build().context("tls connector")?,
            ))
        } else {
            None
        };

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_len);
        let (responses_tx, responses_rx) = mpsc::channel(config.queue_len);
        let (need_tx, mut need_rx) = mpsc::channel(1);
        let output = Arc::new(Self {
            target: Target {
                scheme: url.scheme().to_string(),
                authority,
                host,
                path_override,
            },
            tls,
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            responses_tx,
            responses_rx: tokio::sync::Mutex::new(responses_rx),
            need_worker: need_tx,
            active_workers: Arc::new(AtomicI64::new(0)),
            queue_stats: config
                .stats
                .then(|| QueueStats::new("output_http", QUEUE_STATS_INTERVAL_MS)),
            stop_tx: tokio::sync::watch::channel(false).0,
            config,
        });
        for _ in 0..output.config.workers_min {
            output.clone().spawn_worker();
        }
        let master = output.clone();
        tokio::spawn(async move {
            while need_rx.recv().await.is_some() {
                if (master.active_workers.load(Ordering::SeqCst) as usize)
                    < master.config.workers_max
                {
                    master.clone().spawn_worker();
                }
            }
        });
        Ok(output)
    }

    /// Unblocks response readers; the worker pool drains on its own.
    pub fn close(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn spawn_worker(self: Arc<Self>) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let idle = Duration::from_millis(self.config.worker_timeout_ms.max(1));
            loop {
                let msg = {
                    let mut rx = self.queue_rx.lock().await;
                    tokio::time::timeout(idle, rx.recv()).await
                };
                match msg {
                    Ok(Some(msg)) => self.send_request(msg).await,
                    Ok(None) => break,
                    Err(_) => {
                        // Idle workers above the floor wind down.
                        if self.active_workers.load(Ordering::SeqCst)
                            > self.config.workers_min as i64
                        {
                            break;
                        }
                    }
                }
            }
            self.active_workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn send_request(&self, msg: Envelope) {
        if !is_request_payload(&msg.meta) {
            return;
        }
        let uuid = payload_id(&msg.meta).to_vec();
        let start = now_ns();
        let response = self.send(&msg.data).await;
        let stop = now_ns();
        match response {
            Ok(Some(payload)) => {
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
            Ok(None) => {}
            Err(err) => {
                counter!("tapx_http_output_send_errors_total").increment(1);
                debug!(?err, target = %self.target.authority, "replay request failed");
            }
        }
    }

    /// Re-sends one captured request. `Ok(None)` means the request was
    /// skipped (CONNECT) or responses are not tracked.
    async fn send(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let parsed = parse_request(data)?;
        if parsed.method == "CONNECT" {
            return Ok(None);
        }

        let mut target = self.target.clone();
        let mut method = parsed.method.clone();
        let mut path = target
            .path_override
            .clone()
            .unwrap_or_else(|| parsed.path.clone());
        let mut body = parsed.body.clone();
        let mut redirects_left = self.config.redirect_limit;

        loop {
            let response = self
                .round_trip(&target, &method, &path, &parsed, body.clone())
                .await?;

            let status = response.0;
            if !(300..400).contains(&status) || redirects_left == 0 {
                if self.config.track_responses {
                    return Ok(Some(response.1));
                }
                return Ok(None);
            }
            let Some(location) = response.2 else {
                if self.config.track_responses {
                    return Ok(Some(response.1));
                }
                return Ok(None);
            };
            redirects_left -= 1;
            debug!(%location, status, "following replay redirect");
            if status == 303 {
                method = "GET".to_string();
                body = Vec::new();
            }
            match url::Url::parse(&location) {
                Ok(absolute) => {
                    let host = absolute
                        .host_str()
                        .ok_or_else(|| anyhow!("redirect location has no host"))?
                        .to_string();
                    target.authority = match absolute.port() {
                        Some(port) => format!("{host}:{port}"),
                        None if absolute.scheme() == "https" => format!("{host}:443"),
                        None => format!("{host}:80"),
                    };
                    target.scheme = absolute.scheme().to_string();
                    target.host = host;
                    path = absolute.path().to_string();
                    if let Some(query) = absolute.query() {
                        path.push('?');
                        path.push_str(query);
                    }
                }
                // Relative redirect stays on the same target.
                Err(_) => path = location,
            }
        }
    }

    async fn round_trip(
        &self,
        target: &Target,
        method: &str,
        path: &str,
        parsed: &ParsedRequest,
        body: Vec<u8>,
    ) -> Result<(u16, Vec<u8>, Option<String>)> {
        let io_timeout = Duration::from_millis(self.config.timeout_ms.max(100));

        let mut builder = Request::builder().method(method).uri(path);
        let mut saw_host = false;
        for (name, value) in &parsed.headers {
            if name.eq_ignore_ascii_case("host") {
                saw_host = true;
                if self.config.original_host {
                    builder = builder.header(name.as_str(), value.as_slice());
                } else {
                    builder = builder.header("Host", target.host.as_str());
                }
                continue;
            }
            builder = builder.header(name.as_str(), value.as_slice());
        }
        if !saw_host {
            builder = builder.header("Host", target.host.as_str());
        }
        let request = builder.body(Body::from(body)).context("build request")?;

        let tcp = timeout(io_timeout, TcpStream::connect(&target.authority))
            .await
            .context("connect timed out")??;

        let mut response = if target.scheme == "https" {
            let connector = self
                .tls
                .as_ref()
                .ok_or_else(|| anyhow!("https target without tls connector"))?;
            let tls = timeout(io_timeout, connector.connect(&target.host, tcp))
                .await
                .context("tls handshake timed out")?
                .context("tls handshake")?;
            let (mut sender, conn) =
                timeout(io_timeout, ClientConnBuilder::new().handshake(tls))
                    .await
                    .context("handshake timed out")??;
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    debug!(?err, "replay connection closed");
                }
            });
            timeout(io_timeout, sender.send_request(request))
                .await
                .context("request timed out")??
        } else {
            let (mut sender, conn) =
                timeout(io_timeout, ClientConnBuilder::new().handshake(tcp))
                    .await
                    .context("handshake timed out")??;
            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    debug!(?err, "replay connection closed");
                }
            });
            timeout(io_timeout, sender.send_request(request))
                .await
                .context("request timed out")??
        };

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(hyper::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let mut dump = Vec::new();
        dump.extend_from_slice(format!("HTTP/1.1 {}", response.status()).as_bytes());
        dump.extend_from_slice(b"\r\n");
        for (name, value) in response.headers() {
            dump.extend_from_slice(name.as_str().as_bytes());
            dump.extend_from_slice(b": ");
            dump.extend_from_slice(value.as_bytes());
            dump.extend_from_slice(b"\r\n");
        }
        dump.extend_from_slice(b"\r\n");

        let mut received = 0usize;
        while let Some(chunk) = timeout(io_timeout, response.body_mut().data())
            .await
            .context("response body timed out")?
        {
            let chunk = chunk.context("response body")?;
            received += chunk.len();
            if received <= self.config.buffer_bytes {
                dump.extend_from_slice(&chunk);
            }
        }
        Ok((status, dump, location))
    }
}

fn clamp_worker_config(config: &mut HttpOutputConfig) {
    if config.workers_min == 0 {
        config.workers_min = 1;
    }
    if config.workers_min > MAX_WORKERS_MIN {
        config.workers_min = MAX_WORKERS_MIN;
    }
    if config.workers_max == 0 {
        config.workers_max = usize::MAX;
    }
    if config.workers_max < config.workers_min {
        config.workers_max = config.workers_min;
    }
    if config.queue_len == 0 {
        config.queue_len = 1000;
    }
    if config.timeout_ms < 100 {
        config.timeout_ms = 1_000;
    }
    if config.worker_timeout_ms == 0 {
        config.worker_timeout_ms = 2_000;
    }
    if config.buffer_bytes == 0 {
        config.buffer_bytes = 100 * 1024;
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
}

fn parse_request(data: &[u8]) -> Result<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_PARSED_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let body_offset = match request.parse(data).context("parse captured request")? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Err(anyhow!("captured request is incomplete")),
    };
    Ok(ParsedRequest {
        method: request
            .method
            .ok_or_else(|| anyhow!("request without method"))?
            .to_string(),
        path: request
            .path
            .ok_or_else(|| anyhow!("request without path"))?
            .to_string(),
        headers: request
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
        body: data[body_offset..].to_vec(),
    })
}

#[async_trait]
impl PluginWriter for HttpOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        if !is_request_payload(&msg.meta) {
            return Ok(msg.data.len());
        }
        if self.queue_tx.send(msg.clone()).await.is_err() {
            return Err(PluginError::Stopped);
        }
        // Grow the pool while the queue is non-empty.
        let backlog = self.config.queue_len - self.queue_tx.capacity();
        if let Some(stats) = &self.queue_stats {
            stats.write(backlog);
        }
        if backlog > 0
            && (self.active_workers.load(Ordering::SeqCst) as usize) < self.config.workers_max
        {
            let _ = self.need_worker.try_send(());
        }
        Ok(msg.data.len() + msg.meta.len())
    }
}

#[async_trait]
impl PluginReader for HttpOutput {
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
                replayed.round_trip,
                replayed.started_at,
            ),
            data: replayed.payload,
            ..Envelope::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_captured_requests() {
        let parsed =
            parse_request(b"POST /a HTTP/1.1\r\nHost: w3.org\r\nContent-Length: 7\r\n\r\na=1&b=2")
                .unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.path, "/a");
        assert_eq!(parsed.body, b"a=1&b=2");
        assert!(parsed
            .headers
            .iter()
            .any(|(name, value)| name == "Host" && value == b"w3.org"));
    }

    #[test]
    fn worker_config_is_clamped() {
        let mut config = HttpOutputConfig {
            url: "http://example.com".to_string(),
            timeout_ms: 1,
            workers_min: 0,
            workers_max: 0,
            worker_timeout_ms: 0,
            queue_len: 0,
            redirect_limit: 0,
            track_responses: false,
            skip_verify: false,
            original_host: false,
            buffer_bytes: 0,
            stats: false,
        };
        clamp_worker_config(&mut config);
        assert_eq!(config.workers_min, 1);
        assert_eq!(config.workers_max, usize::MAX);
        assert_eq!(config.timeout_ms, 1_000);
        assert_eq!(config.queue_len, 1000);
    }
}
