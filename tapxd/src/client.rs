//! Persistent TCP client used by the forwarding sinks and the LogReplay
//! live-replay path: write the captured bytes, half-close, read whatever
//! the target answers.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const READ_CHUNK_SIZE: usize = 64 * 1024;
const MAX_RESPONSE_SIZE: usize = 1 << 30;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESPONSE_BUFFER: usize = 100 * 1024;

/// How a send attempt ended, for the per-endpoint failure tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    DialFailed,
    WriteFailed,
    ReadFailed,
}

/// Whether a failed send may be retried. The default policy never retries;
/// retry behaviour belongs to the replay target, not the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    #[default]
    None,
    Fixed(u32),
}

impl RetryPolicy {
    pub fn attempts(self) -> u32 {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Fixed(n) => n.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub timeout: Duration,
    pub response_buffer_size: usize,
    pub retry: RetryPolicy,
    pub debug: bool,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER,
            retry: RetryPolicy::None,
            debug: false,
        }
    }
}

pub struct TcpClient {
    addr: String,
    config: TcpClientConfig,
}

impl TcpClient {
    pub fn new(addr: &str, mut config: TcpClientConfig) -> Self {
        if config.timeout.is_zero() {
            config.timeout = DEFAULT_TIMEOUT;
        }
        if config.response_buffer_size == 0 {
            config.response_buffer_size = DEFAULT_RESPONSE_BUFFER;
        }
        Self {
            addr: addr.to_string(),
            config,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one payload and reads the reply. The returned buffer is capped
    /// at the configured response size; overflow bytes are drained and
    /// dropped.
    pub async fn send(&self, data: &[u8]) -> (Result<Vec<u8>>, SendOutcome) {
        let mut last: Option<(anyhow::Error, SendOutcome)> = None;
        for attempt in 0..self.config.retry.attempts() {
            match self.send_once(data).await {
                Ok(response) => return (Ok(response), SendOutcome::Success),
                Err((err, outcome)) => {
                    if self.config.debug {
                        debug!(?err, attempt, addr = %self.addr, "send attempt failed");
                    }
                    last = Some((err, outcome));
                }
            }
        }
        let (err, outcome) = last.expect("at least one attempt");
        (Err(err), outcome)
    }

    async fn send_once(&self, data: &[u8]) -> std::result::Result<Vec<u8>, (anyhow::Error, SendOutcome)> {
        let io_timeout = self.config.timeout;

        let mut conn = match timeout(io_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => return Err((anyhow!("dial {}: {err}", self.addr), SendOutcome::DialFailed)),
            Err(_) => return Err((anyhow!("dial {} timed out", self.addr), SendOutcome::DialFailed)),
        };

        match timeout(io_timeout, conn.write_all(data)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err((anyhow!("write: {err}"), SendOutcome::WriteFailed)),
            Err(_) => return Err((anyhow!("write timed out"), SendOutcome::WriteFailed)),
        }
        // Half-close tells simple echo-style targets we are done sending.
        if let Err(err) = conn.shutdown().await {
            return Err((anyhow!("close write: {err}"), SendOutcome::WriteFailed));
        }

        let mut response = Vec::with_capacity(self.config.response_buffer_size.min(READ_CHUNK_SIZE));
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let mut total = 0usize;
        loop {
            let n = match timeout(io_timeout, conn.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err((anyhow!("read: {err}"), SendOutcome::ReadFailed)),
                Err(_) => break,
            };
            total += n;
            if response.len() < self.config.response_buffer_size {
                let keep = n.min(self.config.response_buffer_size - response.len());
                response.extend_from_slice(&chunk[..keep]);
            }
            if total >= MAX_RESPONSE_SIZE {
                debug!(addr = %self.addr, total, "response exceeds maximum size, truncating");
                break;
            }
        }
        Ok(response)
    }
}
