use crate::config::{MetricsConfig, SystemLogConfig};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tracing_subscriber::EnvFilter;

const MAX_METRICS_REQUEST_BYTES: usize = 16 * 1024;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct LogGuards {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init_logging(system: &SystemLogConfig) -> Result<LogGuards> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(system.level.clone()));

    let mut guards = LogGuards::default();
    let json = system.format.eq_ignore_ascii_case("json");

    let layer = match system.file.as_deref() {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("system_log.file must name a file")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards._file = Some(guard);
            if json {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer)
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer)
                    .boxed()
            }
        }
        None => {
            if json {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer().with_target(false).boxed()
            }
        }
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;
    Ok(guards)
}

/// Installs the Prometheus recorder and serves the scrape endpoint on a
/// bare TCP listener.
pub fn start_metrics(config: &MetricsConfig) -> Result<()> {
    let listen: SocketAddr = config.listen.parse()?;
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("metrics recorder install failed: {}", e))?;

    let runtime = tokio::runtime::Handle::try_current()
        .context("metrics endpoint requires running Tokio runtime")?;
    runtime.spawn(async move {
        let listener = match TcpListener::bind(listen).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to bind metrics listener");
                return;
            }
        };
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = ?err, "metrics accept failed");
                    continue;
                }
            };
            let handle = handle.clone();
            let path = path.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_METRICS_REQUEST_BYTES];
                let n = match timeout(METRICS_READ_TIMEOUT, stream.read(&mut buf)).await {
                    Ok(Ok(n)) => n,
                    _ => return,
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                let ok = request
                    .lines()
                    .next()
                    .map(|line| {
                        let mut parts = line.split_whitespace();
                        parts.next() == Some("GET")
                            && parts.next().map(|p| p == path).unwrap_or(false)
                    })
                    .unwrap_or(false);
                let response = if ok {
                    let body = handle.render();
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    )
                } else {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                };
                let _ = timeout(METRICS_READ_TIMEOUT, stream.write_all(response.as_bytes())).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    Ok(())
}
