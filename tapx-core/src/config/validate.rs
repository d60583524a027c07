use anyhow::{anyhow, Result};
use std::net::IpAddr;

use super::types::*;
use crate::matchers;

pub(super) fn validate_config(config: &Config) -> Result<()> {
    if config.version != 1 {
        return Err(anyhow!(
            "unsupported config.version {} (expected 1)",
            config.version
        ));
    }
    if config.inputs.raw.is_empty() && config.inputs.tcp.is_empty() {
        return Err(anyhow!("at least one input is required"));
    }
    if !has_output(&config.outputs) {
        return Err(anyhow!("at least one output is required"));
    }
    for raw in &config.inputs.raw {
        validate_raw_input(raw)?;
    }
    for tcp in &config.inputs.tcp {
        parse_host_port(&tcp.listen)
            .map_err(|e| anyhow!("inputs.tcp.listen {}: {e}", tcp.listen))?;
    }
    for http in &config.outputs.http {
        validate_http_output(http)?;
    }
    for tcp in &config.outputs.tcp {
        parse_host_port(&tcp.address)
            .map_err(|e| anyhow!("outputs.tcp.address {}: {e}", tcp.address))?;
        if tcp.workers == 0 {
            return Err(anyhow!("outputs.tcp.workers must be at least 1"));
        }
    }
    for binary in &config.outputs.binary {
        parse_host_port(&binary.address)
            .map_err(|e| anyhow!("outputs.binary.address {}: {e}", binary.address))?;
    }
    if let Some(logreplay) = config.outputs.logreplay.as_ref() {
        validate_logreplay(logreplay)?;
    }
    // Compiling the rules up front surfaces bad patterns at startup.
    matchers::compile(&config.modifier)?;
    Ok(())
}

fn has_output(outputs: &OutputsConfig) -> bool {
    outputs.stdout
        || !outputs.file.is_empty()
        || !outputs.http.is_empty()
        || !outputs.tcp.is_empty()
        || !outputs.binary.is_empty()
        || outputs.logreplay.is_some()
}

fn validate_raw_input(raw: &RawInputConfig) -> Result<()> {
    let (_, port) = split_address(&raw.address)
        .map_err(|e| anyhow!("inputs.raw.address {}: {e}", raw.address))?;
    let _ = port;
    match raw.transport.as_str() {
        "tcp" | "udp" => {}
        other => return Err(anyhow!("inputs.raw.transport must be tcp or udp, got {other}")),
    }
    match raw.protocol.as_str() {
        "" | "http" | "grpc" => {}
        other => {
            return Err(anyhow!(
                "inputs.raw.protocol must be http, grpc or empty, got {other}"
            ))
        }
    }
    if raw.sample_rate > 16 {
        return Err(anyhow!(
            "inputs.raw.sample_rate must be in [0, 16], got {}",
            raw.sample_rate
        ));
    }
    if raw.engine == CaptureEngine::PcapFile && raw.pcap_path.is_none() {
        return Err(anyhow!(
            "inputs.raw.pcap_path is required for the pcap_file engine"
        ));
    }
    for host in &raw.select_hosts {
        host.parse::<IpAddr>()
            .map_err(|_| anyhow!("inputs.raw.select_hosts entry is not an IP: {host}"))?;
    }
    Ok(())
}

fn validate_http_output(http: &HttpOutputConfig) -> Result<()> {
    let parsed = url::Url::parse(&http.url)
        .or_else(|_| url::Url::parse(&format!("http://{}", http.url)))
        .map_err(|_| anyhow!("outputs.http.url is invalid: {}", http.url))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("outputs.http.url scheme must be http/https, got {other}")),
    }
    if http.workers_min == 0 || http.workers_min > 1000 {
        return Err(anyhow!(
            "outputs.http.workers_min must be in [1, 1000], got {}",
            http.workers_min
        ));
    }
    if http.workers_max != 0 && http.workers_max < http.workers_min {
        return Err(anyhow!(
            "outputs.http.workers_max must be >= workers_min when set"
        ));
    }
    Ok(())
}

fn validate_logreplay(conf: &LogReplayOutputConfig) -> Result<()> {
    for (field, value) in [
        ("gateway", &conf.gateway),
        ("module_id", &conf.module_id),
        ("app_id", &conf.app_id),
        ("app_key", &conf.app_key),
        ("commit_id", &conf.commit_id),
        ("protocol", &conf.protocol),
    ] {
        if value.trim().is_empty() {
            return Err(anyhow!("outputs.logreplay.{field} must not be empty"));
        }
    }
    match conf.protocol.as_str() {
        "http" | "grpc" => {}
        other => {
            return Err(anyhow!(
                "outputs.logreplay.protocol must be http or grpc, got {other}"
            ))
        }
    }
    match conf.env.as_str() {
        "formal" | "test" => {}
        other => {
            return Err(anyhow!(
                "outputs.logreplay.env must be formal or test, got {other}"
            ))
        }
    }
    if let Some(target) = conf.target.as_deref() {
        let (host, _) = parse_host_port(target)
            .map_err(|e| anyhow!("outputs.logreplay.target {target}: {e}"))?;
        host.parse::<IpAddr>()
            .map_err(|_| anyhow!("outputs.logreplay.target host must be an IP: {target}"))?;
    }
    if conf.workers == 0 {
        return Err(anyhow!("outputs.logreplay.workers must be at least 1"));
    }
    if conf.qps_limit == 0 {
        return Err(anyhow!("outputs.logreplay.qps_limit must be at least 1"));
    }
    Ok(())
}

/// `host:port` where both parts are required.
fn parse_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = split_address(address)?;
    if host.is_empty() {
        return Err(anyhow!("host must not be empty"));
    }
    Ok((host, port))
}

/// `host:port` where the host may be empty and the port may be 0 ("any").
pub(super) fn split_address(address: &str) -> Result<(String, u16)> {
    let idx = address
        .rfind(':')
        .ok_or_else(|| anyhow!("expected host:port"))?;
    let (host, port) = address.split_at(idx);
    let port: u16 = port[1..]
        .parse()
        .map_err(|_| anyhow!("invalid port in {address}"))?;
    // Bracketed IPv6 hosts keep their brackets out of the parsed host.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
