use super::defaults::*;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct Config {
    pub version: u32,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub system_log: SystemLogConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    /// Wall-clock lifetime of the daemon; 0 keeps the default of six hours.
    #[serde(default)]
    pub exit_after_secs: u64,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub inputs: InputsConfig,
    #[serde(default)]
    pub outputs: OutputsConfig,
    #[serde(default)]
    pub modifier: ModifierConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub worker_threads: Option<usize>,
    #[serde(default)]
    pub max_blocking_threads: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SystemLogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for SystemLogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    pub listen: String,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EmitterConfig {
    /// Round-robin messages over the outputs instead of broadcasting.
    #[serde(default)]
    pub split_output: bool,
    /// Decompress and dechunk HTTP bodies before writing to outputs.
    #[serde(default)]
    pub prettify_http: bool,
    #[serde(default = "default_copy_buffer_bytes")]
    pub copy_buffer_bytes: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            split_output: false,
            prettify_http: false,
            copy_buffer_bytes: default_copy_buffer_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct InputsConfig {
    #[serde(default)]
    pub raw: Vec<RawInputConfig>,
    #[serde(default)]
    pub tcp: Vec<TcpInputConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureEngine {
    #[default]
    Libpcap,
    PcapFile,
    RawSocket,
    AfPacket,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RawInputConfig {
    /// `host:port` to record. Empty host selects all non-loopback v4
    /// interfaces, port 0 means any port.
    pub address: String,
    #[serde(default)]
    pub engine: CaptureEngine,
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Application protocol framer: `http`, `grpc`, or empty for
    /// connection-oriented reassembly.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub track_response: bool,
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,
    #[serde(default = "default_copy_buffer_bytes")]
    pub max_message_bytes: usize,
    #[serde(default)]
    pub bpf_filter: Option<String>,
    #[serde(default)]
    pub buffer_timeout_ms: u64,
    #[serde(default)]
    pub buffer_bytes: usize,
    #[serde(default)]
    pub override_snaplen: bool,
    #[serde(default)]
    pub promiscuous: bool,
    /// Header to stamp with the packet source address on requests.
    #[serde(default)]
    pub real_ip_header: Option<String>,
    /// Record only requests originating from these IPs.
    #[serde(default)]
    pub select_hosts: Vec<String>,
    #[serde(default)]
    pub stats: bool,
    /// Recording for a LogReplay module: resolves the host IP and applies
    /// the sampling BPF clauses.
    #[serde(default)]
    pub logreplay: bool,
    /// Sampling rate in [0, 16]; 16 records everything.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u8,
    /// Source file for the `pcap_file` engine.
    #[serde(default)]
    pub pcap_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TcpInputConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct OutputsConfig {
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub file: Vec<FileOutputConfig>,
    #[serde(default)]
    pub http: Vec<HttpOutputConfig>,
    #[serde(default)]
    pub tcp: Vec<TcpOutputConfig>,
    #[serde(default)]
    pub binary: Vec<BinaryOutputConfig>,
    #[serde(default)]
    pub logreplay: Option<LogReplayOutputConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct FileOutputConfig {
    /// Path template; `%Y %m %d %H %M %S %NS %r %t` are substituted and a
    /// `_N` suffix avoids chunk collisions. A `.gz` suffix enables gzip.
    pub path: String,
    #[serde(default)]
    pub append: bool,
    #[serde(default = "default_file_flush_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_file_size_limit")]
    pub size_limit_bytes: u64,
    #[serde(default)]
    pub queue_limit: usize,
    #[serde(default = "default_file_max_total")]
    pub max_total_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HttpOutputConfig {
    pub url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_workers_min")]
    pub workers_min: usize,
    #[serde(default)]
    pub workers_max: usize,
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
    #[serde(default)]
    pub redirect_limit: usize,
    #[serde(default)]
    pub track_responses: bool,
    #[serde(default)]
    pub skip_verify: bool,
    /// Keep the captured Host header instead of the output URL host.
    #[serde(default)]
    pub original_host: bool,
    #[serde(default = "default_response_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default)]
    pub stats: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TcpOutputConfig {
    pub address: String,
    #[serde(default = "default_tcp_workers")]
    pub workers: usize,
    /// Route messages with the same UUID to the same worker.
    #[serde(default)]
    pub sticky: bool,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub stats: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BinaryOutputConfig {
    pub address: String,
    /// 0 enables dynamic scaling.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_response_buffer_bytes")]
    pub buffer_bytes: usize,
    #[serde(default)]
    pub track_responses: bool,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogReplayOutputConfig {
    /// Collector gateway, `host:port`.
    pub gateway: String,
    pub module_id: String,
    pub app_id: String,
    pub app_key: String,
    pub commit_id: String,
    /// Protocol of the recorded service: `http` or `grpc`.
    pub protocol: String,
    #[serde(default = "default_logreplay_env")]
    pub env: String,
    #[serde(default)]
    pub protocol_service_name: Option<String>,
    /// Live replay target, `host:port`. Empty disables live replay.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_target_timeout_ms")]
    pub target_timeout_ms: u64,
    /// Restrict gRPC live replay to methods whose name appears here.
    #[serde(default)]
    pub grpc_replay_method: Option<String>,
    #[serde(default = "default_logreplay_workers")]
    pub workers: usize,
    #[serde(default = "default_cache_mb")]
    pub cache_mb: usize,
    #[serde(default = "default_record_limit")]
    pub record_limit: u64,
    #[serde(default = "default_qps_limit")]
    pub qps_limit: u32,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub real_server_name: Option<String>,
    #[serde(default)]
    pub track_responses: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct ModifierConfig {
    /// Headers set on every request (replace or insert).
    #[serde(default)]
    pub headers: Vec<HeaderValue>,
    /// URL query parameters set on every request.
    #[serde(default)]
    pub params: Vec<HeaderValue>,
    /// Allowed methods; empty allows everything.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Requests whose path does not match any entry are dropped.
    #[serde(default)]
    pub url_regexp: Vec<String>,
    /// Requests whose path matches any entry are dropped.
    #[serde(default)]
    pub url_negative_regexp: Vec<String>,
    /// `pattern:replacement` path rewrites; first match wins.
    #[serde(default)]
    pub url_rewrite: Vec<String>,
    /// `Header:pattern:replacement` header value rewrites.
    #[serde(default)]
    pub header_rewrite: Vec<String>,
    /// `Header:pattern`: drop unless the header exists and matches.
    #[serde(default)]
    pub header_filters: Vec<String>,
    /// `Header:pattern`: drop when the header exists and matches.
    #[serde(default)]
    pub header_negative_filters: Vec<String>,
    /// Drop when decoded basic-auth credentials do not match.
    #[serde(default)]
    pub header_basic_auth_filters: Vec<String>,
    /// `Header:percent` consistent-hash sampling on header values.
    #[serde(default)]
    pub header_hash_filters: Vec<String>,
    /// `name:percent` consistent-hash sampling on query parameters.
    #[serde(default)]
    pub param_hash_filters: Vec<String>,
}

impl ModifierConfig {
    /// True when no rule is configured and the rewrite pass can be skipped
    /// entirely.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.params.is_empty()
            && self.methods.is_empty()
            && self.url_regexp.is_empty()
            && self.url_negative_regexp.is_empty()
            && self.url_rewrite.is_empty()
            && self.header_rewrite.is_empty()
            && self.header_filters.is_empty()
            && self.header_negative_filters.is_empty()
            && self.header_basic_auth_filters.is_empty()
            && self.header_hash_filters.is_empty()
            && self.param_hash_filters.is_empty()
    }
}
