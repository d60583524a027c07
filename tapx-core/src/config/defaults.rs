pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "text".to_string()
}

pub(super) fn default_metrics_path() -> String {
    "/metrics".to_string()
}

pub(super) fn default_transport() -> String {
    "tcp".to_string()
}

pub(super) fn default_protocol() -> String {
    "http".to_string()
}

pub(super) fn default_expire_ms() -> u64 {
    2_000
}

pub(super) fn default_copy_buffer_bytes() -> usize {
    5 << 20
}

pub(super) fn default_sample_rate() -> u8 {
    16
}

pub(super) fn default_file_flush_ms() -> u64 {
    100
}

pub(super) fn default_file_size_limit() -> u64 {
    32 << 20
}

pub(super) fn default_file_max_total() -> u64 {
    1 << 40
}

pub(super) fn default_http_timeout_ms() -> u64 {
    1_000
}

pub(super) fn default_workers_min() -> usize {
    1
}

pub(super) fn default_worker_timeout_ms() -> u64 {
    2_000
}

pub(super) fn default_queue_len() -> usize {
    1_000
}

pub(super) fn default_response_buffer_bytes() -> usize {
    100 * 1024
}

pub(super) fn default_tcp_workers() -> usize {
    10
}

pub(super) fn default_logreplay_env() -> String {
    "formal".to_string()
}

pub(super) fn default_target_timeout_ms() -> u64 {
    1_000
}

pub(super) fn default_logreplay_workers() -> usize {
    1
}

pub(super) fn default_cache_mb() -> usize {
    100
}

pub(super) fn default_record_limit() -> u64 {
    10_000
}

pub(super) fn default_qps_limit() -> u32 {
    10
}
