//! Framed TCP input: accepts connections carrying envelopes separated by
//! the payload separator, typically another tapx instance's TCP output.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use anyhow::{Context, Result};
use tapx_core::config::TcpInputConfig;

use crate::payload::{meta_with_body, PAYLOAD_SEPARATOR};
use crate::plugin::{Envelope, PluginError, PluginReader};

const MESSAGE_CHANNEL_CAPACITY: usize = 1000;
const READ_CHUNK: usize = 64 * 1024;

pub struct TcpInput {
    listen: String,
    message_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TcpInput {
    pub async fn start(config: TcpInputConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("tcp input bind {}", config.listen))?;
        info!(listen = %config.listen, "tcp input listening");

        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "tcp input connection");
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = read_connection(stream, tx).await {
                                debug!(?err, %peer, "tcp input connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(?err, "tcp input accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            listen: config.listen,
            message_rx: tokio::sync::Mutex::new(rx),
            accept_task,
        }))
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn close(&self) {
        self.accept_task.abort();
    }
}

async fn read_connection(mut stream: TcpStream, tx: mpsc::Sender<Envelope>) -> Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // Trailing unterminated message flushes on close.
            if !buf.is_empty() {
                deliver(&buf, &tx).await;
            }
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        while let Some(pos) = find_separator(&buf) {
            let message: Vec<u8> = buf[..pos].to_vec();
            buf.drain(..pos + PAYLOAD_SEPARATOR.len());
            if !message.is_empty() {
                deliver(&message, &tx).await;
            }
        }
    }
}

async fn deliver(raw: &[u8], tx: &mpsc::Sender<Envelope>) {
    let (meta, data) = meta_with_body(raw);
    if meta.is_empty() {
        debug!(bytes = raw.len(), "tcp input message without meta, dropping");
        return;
    }
    let envelope = Envelope {
        meta: meta.to_vec(),
        data: data.to_vec(),
        ..Envelope::default()
    };
    let _ = tx.send(envelope).await;
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    if buf.len() < PAYLOAD_SEPARATOR.len() {
        return None;
    }
    buf.windows(PAYLOAD_SEPARATOR.len())
        .position(|window| window == PAYLOAD_SEPARATOR)
}

#[async_trait]
impl PluginReader for TcpInput {
    async fn plugin_read(&self) -> Result<Envelope, PluginError> {
        let mut rx = self.message_rx.lock().await;
        rx.recv().await.ok_or(PluginError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::payload_header;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn splits_framed_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(10);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_connection(stream, tx).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut first = payload_header(b'1', "aabbccddeeff00112233aabb", 1, -1);
        first.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        first.extend_from_slice(PAYLOAD_SEPARATOR);
        let mut second = payload_header(b'2', "aabbccddeeff00112233aabb", 2, 5);
        second.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\n");
        second.extend_from_slice(PAYLOAD_SEPARATOR);
        client.write_all(&first).await.unwrap();
        client.write_all(&second).await.unwrap();
        client.shutdown().await.unwrap();

        let one = rx.recv().await.expect("first envelope");
        assert!(one.meta.starts_with(b"1 "));
        assert!(one.data.starts_with(b"GET /"));
        let two = rx.recv().await.expect("second envelope");
        assert!(two.meta.starts_with(b"2 "));
        assert!(two.data.starts_with(b"HTTP/1.1 200"));
    }
}
