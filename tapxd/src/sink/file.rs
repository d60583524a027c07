//! Append-or-rotate file sink. Chunks rotate on size or entry limits, path
//! templates expand timestamps and message identity, and a `.gz` suffix
//! switches the writer to gzip.

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use tapx_core::config::FileOutputConfig;

use crate::payload::{payload_meta, PAYLOAD_SEPARATOR};
use crate::plugin::{Envelope, PluginError, PluginWriter};

enum ChunkWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<File>),
}

impl ChunkWriter {
    fn open(path: &str) -> std::io::Result<ChunkWriter> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        if path.ends_with(".gz") {
            Ok(ChunkWriter::Gzip(GzEncoder::new(file, Compression::default())))
        } else {
            Ok(ChunkWriter::Plain(BufWriter::new(file)))
        }
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.write_all(data),
            ChunkWriter::Gzip(w) => w.write_all(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.flush(),
            ChunkWriter::Gzip(w) => w.flush(),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(mut w) => w.flush(),
            ChunkWriter::Gzip(w) => w.finish().map(|_| ()),
        }
    }
}

struct FileInner {
    current_name: String,
    writer: Option<ChunkWriter>,
    queue_length: usize,
    chunk_size: u64,
    total_size: u64,
    current_id: String,
    payload_type: String,
    closed: bool,
}

pub struct FileOutput {
    path_template: String,
    request_per_file: bool,
    config: FileOutputConfig,
    inner: Arc<Mutex<FileInner>>,
}

impl FileOutput {
    pub fn new(config: FileOutputConfig) -> Arc<Self> {
        let output = Arc::new(Self {
            path_template: config.path.clone(),
            request_per_file: config.path.contains("%r"),
            inner: Arc::new(Mutex::new(FileInner {
                current_name: String::new(),
                writer: None,
                queue_length: 0,
                chunk_size: 0,
                total_size: 0,
                current_id: String::new(),
                payload_type: String::new(),
                closed: false,
            })),
            config,
        });

        let flusher = output.clone();
        let interval = Duration::from_millis(flusher.config.flush_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if flusher.is_closed() {
                    break;
                }
                flusher.update_name();
                flusher.flush();
            }
        });

        output
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().expect("file sink mutex").closed
    }

    /// Expands the template and advances the chunk index when the current
    /// chunk is full.
    fn filename(&self, inner: &FileInner) -> String {
        let now = chrono::Local::now();
        let mut path = self.path_template.clone();
        for (token, value) in [
            ("%Y", now.format("%Y").to_string()),
            ("%m", now.format("%m").to_string()),
            ("%d", now.format("%d").to_string()),
            ("%H", now.format("%H").to_string()),
            ("%M", now.format("%M").to_string()),
            ("%NS", now.format("%f").to_string()),
            ("%S", now.format("%S").to_string()),
            ("%r", inner.current_id.clone()),
            ("%t", inner.payload_type.clone()),
        ] {
            path = path.replace(token, &value);
        }

        if self.config.append {
            return path;
        }

        let next_chunk = inner.current_name.is_empty()
            || (self.config.queue_limit > 0 && inner.queue_length >= self.config.queue_limit)
            || (self.config.size_limit_bytes > 0
                && inner.chunk_size >= self.config.size_limit_bytes);

        match last_chunk(&path) {
            None => set_file_index(&path, 0),
            Some(last) => {
                let mut index = file_index(&last).unwrap_or(0);
                if next_chunk {
                    index += 1;
                }
                set_file_index(&last, index)
            }
        }
    }

    fn update_name(&self) {
        let mut inner = self.inner.lock().expect("file sink mutex");
        let name = self.filename(&inner);
        inner.current_name = name;
    }

    fn flush(&self) {
        // A panic while flushing must not take the pipeline down.
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut inner = self.inner.lock().expect("file sink mutex");
            if let Some(writer) = inner.writer.as_mut() {
                if let Err(err) = writer.flush() {
                    warn!(?err, "file flush failed");
                }
            }
            if let Ok(meta) = fs::metadata(&inner.current_name) {
                inner.chunk_size = meta.len();
            }
        }));
        if let Err(panic) = result {
            error!(
                backtrace = %std::backtrace::Backtrace::force_capture(),
                "panic while flushing file output: {panic:?}"
            );
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("file sink mutex");
        if let Some(writer) = inner.writer.take() {
            if let Err(err) = writer.finish() {
                warn!(?err, "file close failed");
            }
        }
        inner.closed = true;
        info!(file = %inner.current_name, "file output closed");
    }
}

#[async_trait]
impl PluginWriter for FileOutput {
    async fn plugin_write(&self, msg: &Envelope) -> Result<usize, PluginError> {
        let mut inner = self.inner.lock().expect("file sink mutex");
        if inner.closed {
            return Err(PluginError::Stopped);
        }

        if self.request_per_file {
            if let Some(meta) = payload_meta(&msg.meta) {
                if meta.len() >= 2 {
                    inner.payload_type = String::from_utf8_lossy(meta[0]).into_owned();
                    inner.current_id = String::from_utf8_lossy(meta[1]).into_owned();
                }
            }
        }

        let name = self.filename(&inner);
        if inner.writer.is_none() || name != inner.current_name {
            if let Some(writer) = inner.writer.take() {
                if let Err(err) = writer.finish() {
                    warn!(?err, "finishing previous chunk failed");
                }
            }
            if let Some(parent) = Path::new(&name).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            inner.writer = Some(ChunkWriter::open(&name)?);
            inner.current_name = name;
            inner.queue_length = 0;
            inner.chunk_size = 0;
        }

        let writer = inner.writer.as_mut().expect("writer opened above");
        writer.write_all(&msg.meta)?;
        writer.write_all(&msg.data)?;
        writer.write_all(PAYLOAD_SEPARATOR)?;

        let written = msg.meta.len() + msg.data.len() + PAYLOAD_SEPARATOR.len();
        inner.total_size += written as u64;
        inner.queue_length += 1;

        if self.config.max_total_bytes > 0 && inner.total_size >= self.config.max_total_bytes {
            return Err(PluginError::Io(std::io::Error::other(
                "file output reached size limit",
            )));
        }
        Ok(written)
    }
}

fn file_index(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(&extension(name)).unwrap_or(name);
    let idx = stem.rfind('_')?;
    stem[idx + 1..].parse().ok()
}

fn set_file_index(name: &str, index: u32) -> String {
    let ext = extension(name);
    let mut stem = name.strip_suffix(&ext).unwrap_or(name).to_string();
    if let Some(idx) = stem.rfind('_') {
        if stem[idx + 1..].parse::<u32>().is_ok() {
            stem.truncate(idx);
        }
    }
    format!("{stem}_{index}{ext}")
}

/// `.gz` files keep their real extension underneath.
fn extension(name: &str) -> String {
    let path = Path::new(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!(".{ext}"),
        None => String::new(),
    }
}

/// Highest-indexed existing chunk matching the expanded template.
fn last_chunk(path: &str) -> Option<String> {
    let ext = extension(path);
    let stem = path.strip_suffix(&ext).unwrap_or(path);
    let parent = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty());
    let dir = parent.unwrap_or_else(|| Path::new("."));
    let prefix = Path::new(stem)
        .file_name()
        .and_then(|n| n.to_str())?
        .to_string();

    let mut matches: Vec<String> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&prefix) && name.ends_with(ext.as_str()))
        .map(|name| match parent {
            Some(parent) => parent.join(&name).to_string_lossy().into_owned(),
            None => name,
        })
        .collect();
    if matches.is_empty() {
        return None;
    }
    matches.sort_by_key(|name| file_index(name).unwrap_or(0));
    matches.pop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::payload_header;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_dir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        dir.push(format!("tapx-file-sink-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn envelope(data: &[u8]) -> Envelope {
        Envelope {
            meta: payload_header(b'1', "aabbccddeeff00112233aabb", 1, -1),
            data: data.to_vec(),
            ..Envelope::default()
        }
    }

    #[test]
    fn file_index_round_trip() {
        assert_eq!(file_index("cap_3.log"), Some(3));
        assert_eq!(file_index("cap.log"), None);
        assert_eq!(set_file_index("cap.log", 0), "cap_0.log");
        assert_eq!(set_file_index("cap_3.log", 4), "cap_4.log");
    }

    #[tokio::test]
    async fn writes_envelopes_with_separator() {
        let dir = tmp_dir();
        let path = dir.join("capture.log").to_string_lossy().into_owned();
        let output = FileOutput::new(FileOutputConfig {
            path,
            append: true,
            flush_interval_ms: 10,
            size_limit_bytes: 32 << 20,
            queue_limit: 0,
            max_total_bytes: 1 << 40,
        });
        output
            .plugin_write(&envelope(b"GET / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        output.close();

        let written = fs::read(dir.join("capture.log")).unwrap();
        assert!(written.starts_with(b"1 "));
        assert!(written.ends_with(PAYLOAD_SEPARATOR));
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn rotates_chunks_on_queue_limit() {
        let dir = tmp_dir();
        let path = dir.join("chunked.log").to_string_lossy().into_owned();
        let output = FileOutput::new(FileOutputConfig {
            path,
            append: false,
            flush_interval_ms: 1000,
            size_limit_bytes: 0,
            queue_limit: 1,
            max_total_bytes: 0,
        });
        output.plugin_write(&envelope(b"one")).await.unwrap();
        output.flush();
        output.plugin_write(&envelope(b"two")).await.unwrap();
        output.close();

        assert!(dir.join("chunked_0.log").exists());
        assert!(dir.join("chunked_1.log").exists());
        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn total_size_cap_errors() {
        let dir = tmp_dir();
        let path = dir.join("capped.log").to_string_lossy().into_owned();
        let output = FileOutput::new(FileOutputConfig {
            path,
            append: true,
            flush_interval_ms: 1000,
            size_limit_bytes: 0,
            queue_limit: 0,
            max_total_bytes: 10,
        });
        let result = output.plugin_write(&envelope(b"0123456789abcdef")).await;
        assert!(result.is_err());
        output.close();
        fs::remove_dir_all(dir).ok();
    }
}
