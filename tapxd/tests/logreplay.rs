//! LogReplay sink against a miniature collector: auth check on startup,
//! request/response correlation, and batch flushing behaviour.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tapx_core::config::LogReplayOutputConfig;
use tapxd::logreplay::LogReplayOutput;
use tapxd::payload::payload_header;
use tapxd::plugin::{Envelope, PluginWriter};

/// Batch sizes posted to /dataproxy/Report, in arrival order.
async fn collector(batches: mpsc::UnboundedSender<usize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let batches = batches.clone();
            tokio::spawn(async move {
                loop {
                    let Some((path, body)) = read_request(&mut stream).await else {
                        return;
                    };
                    let response_body = match path.as_str() {
                        "/logreplay/app/GetCasKey" => {
                            r#"{"id":"app-1","key":"key-1"}"#.to_string()
                        }
                        "/logreplay/app/GetModule" => {
                            r#"{"module":{"app_name_en":"demo","module_name_en":"echo"}}"#
                                .to_string()
                        }
                        "/dataproxy/Report" => {
                            let parsed: serde_json::Value =
                                serde_json::from_slice(&body).unwrap();
                            let count =
                                parsed["batch"].as_array().map(|b| b.len()).unwrap_or(0);
                            let _ = batches.send(count);
                            format!(
                                r#"{{"base_rsp":{{"code":100000,"msg":"success"}},"succeed":{count}}}"#
                            )
                        }
                        _ => r#"{"base_rsp":{"code":100000,"msg":"success"}}"#.to_string(),
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        response_body.len(),
                        response_body
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let path = head.split_whitespace().nth(1)?.to_string();
    let content_length: usize = head
        .lines()
        .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Some((path, body))
}

fn config(gateway: String) -> LogReplayOutputConfig {
    LogReplayOutputConfig {
        gateway,
        module_id: "mod-1".to_string(),
        app_id: "app-1".to_string(),
        app_key: "key-1".to_string(),
        commit_id: "abc123".to_string(),
        protocol: "http".to_string(),
        env: "test".to_string(),
        protocol_service_name: None,
        target: None,
        target_timeout_ms: 1_000,
        grpc_replay_method: None,
        workers: 1,
        cache_mb: 10,
        record_limit: 100_000,
        qps_limit: 10_000,
        timeout_ms: 1_000,
        real_server_name: Some("echo.demo".to_string()),
        track_responses: false,
    }
}

fn exchange(uuid: &str) -> (Envelope, Envelope) {
    let request = Envelope {
        meta: payload_header(b'1', uuid, 1, -1),
        data: b"POST /v1/echo HTTP/1.1\r\nHost: echo\r\nContent-Length: 2\r\n\r\nhi".to_vec(),
        ..Envelope::default()
    };
    let response = Envelope {
        meta: payload_header(b'2', uuid, 2, 10),
        data: b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec(),
        src_addr: "10.0.0.1".to_string(),
        ..Envelope::default()
    };
    (request, response)
}

#[tokio::test]
async fn startup_fails_on_credential_mismatch() {
    let (batch_tx, _batch_rx) = mpsc::unbounded_channel();
    let gateway = collector(batch_tx).await;
    let mut conf = config(gateway);
    conf.app_key = "wrong".to_string();
    let result = LogReplayOutput::start(conf, "10.0.0.2:8000").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn orphaned_responses_are_dropped() {
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let gateway = collector(batch_tx).await;
    let output = LogReplayOutput::start(config(gateway), "10.0.0.2:8000")
        .await
        .unwrap();

    let (_, response) = exchange("aabbccddeeff001122334455");
    output.plugin_write(&response).await.unwrap();

    // Nothing correlates, so no report flush fires.
    let waited =
        tokio::time::timeout(Duration::from_secs(4), batch_rx.recv()).await;
    assert!(waited.is_err());
}

#[tokio::test]
async fn correlated_pairs_flush_in_batches() {
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let gateway = collector(batch_tx).await;
    let output: Arc<LogReplayOutput> =
        LogReplayOutput::start(config(gateway), "10.0.0.2:8000")
            .await
            .unwrap();

    // 250 exchanges at a steady 50 Hz.
    for i in 0..250u32 {
        let uuid = format!("{i:024x}");
        let (request, response) = exchange(&uuid);
        output.plugin_write(&request).await.unwrap();
        output.plugin_write(&response).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut sizes = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
    while sizes.iter().sum::<usize>() < 250 {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_default();
        match tokio::time::timeout(remaining, batch_rx.recv()).await {
            Ok(Some(size)) => sizes.push(size),
            _ => break,
        }
    }

    assert_eq!(sizes.iter().sum::<usize>(), 250, "batches: {sizes:?}");
    assert_eq!(sizes.len(), 3, "batches: {sizes:?}");
    let mut sorted = sizes.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![50, 100, 100], "batches: {sizes:?}");
}
