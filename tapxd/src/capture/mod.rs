//! Packet source adapter: abstracts live capture, pcap-file replay, and a
//! raw datalink socket behind one listener that feeds decoded packets to a
//! handler on a dedicated thread per interface.

mod engine;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::tcp::packet::Packet;
use engine::EngineHandle;
pub use tapx_core::config::CaptureEngine;

/// Capture tuning knobs, applied before activation.
#[derive(Debug, Clone, Default)]
pub struct PcapOptions {
    pub bpf_filter: Option<String>,
    pub promiscuous: bool,
    /// Capture full frames instead of the default 64 KiB snaplen.
    pub override_snaplen: bool,
    pub buffer_bytes: usize,
    pub buffer_timeout_ms: u64,
    /// Source file for the pcap-file engine.
    pub pcap_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaptureInterface {
    pub name: String,
    pub ip: Option<IpAddr>,
}

pub type PacketHandler = Arc<dyn Fn(Packet) + Send + Sync>;

pub struct Listener {
    host: String,
    port: u16,
    transport: String,
    engine: CaptureEngine,
    track_response: bool,
    options: PcapOptions,
    pub interfaces: Vec<CaptureInterface>,
    handles: Vec<EngineHandle>,
    shutdown: Arc<AtomicBool>,
}

/// Running listener: drop or call `stop` to end the capture threads.
pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    pub errors: mpsc::Receiver<anyhow::Error>,
    pub ready: Option<oneshot::Receiver<()>>,
}

impl ListenerHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Listener {
    /// `host` may be an IP, an interface name, or empty for every
    /// non-loopback v4 interface. Port 0 records any port.
    pub fn new(
        host: &str,
        port: u16,
        transport: &str,
        engine: CaptureEngine,
        track_response: bool,
    ) -> Result<Self> {
        let interfaces = select_interfaces(host, engine)
            .context("interface enumeration failed")?;
        if interfaces.is_empty() {
            return Err(anyhow!("no capture interface matches host {host:?}"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            transport: if transport.is_empty() {
                "tcp".to_string()
            } else {
                transport.to_string()
            },
            engine,
            track_response,
            options: PcapOptions::default(),
            interfaces,
            handles: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_options(&mut self, options: PcapOptions) {
        self.options = options;
    }

    pub fn track_response(&self) -> bool {
        self.track_response
    }

    /// BPF expression for one interface: `(tcp port P and host H)` when the
    /// port is known, `(tcp dst portrange 0-65535 and host H)` otherwise.
    /// An explicit configured filter wins.
    pub fn filter(&self, interface: &CaptureInterface) -> String {
        if let Some(filter) = self.options.bpf_filter.as_deref() {
            if !filter.trim().is_empty() {
                return filter.to_string();
            }
        }
        let host = interface
            .ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| self.host.clone());
        if self.port == 0 {
            format!("({} dst portrange 0-65535 and host {})", self.transport, host)
        } else {
            format!("({} port {} and host {})", self.transport, self.port, host)
        }
    }

    /// Opens the capture handles and installs the per-interface filters.
    pub fn activate(&mut self) -> Result<()> {
        for interface in self.interfaces.clone() {
            let filter = self.filter(&interface);
            let handle = EngineHandle::open(
                self.engine,
                &interface,
                &filter,
                &self.options,
            )
            .with_context(|| format!("failed to open capture on {}", interface.name))?;
            debug!(interface = %interface.name, %filter, "capture activated");
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Spawns one capture thread per interface. The handler runs on the
    /// capture thread and must only hand the packet off.
    pub fn listen_background(mut self, handler: PacketHandler) -> Result<ListenerHandle> {
        if self.handles.is_empty() {
            return Err(anyhow!("listener not activated"));
        }
        let (err_tx, err_rx) = mpsc::channel(self.handles.len());
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready = Arc::new(std::sync::Mutex::new(Some(ready_tx)));

        for handle in self.handles.drain(..) {
            let handler = handler.clone();
            let shutdown = self.shutdown.clone();
            let err_tx = err_tx.clone();
            let ready = ready.clone();
            std::thread::Builder::new()
                .name("tapx-capture".to_string())
                .spawn(move || {
                    capture_loop(handle, handler, shutdown, err_tx, ready);
                })
                .context("failed to spawn capture thread")?;
        }

        Ok(ListenerHandle {
            shutdown: self.shutdown.clone(),
            errors: err_rx,
            ready: Some(ready_rx),
        })
    }
}

fn capture_loop(
    mut handle: EngineHandle,
    handler: PacketHandler,
    shutdown: Arc<AtomicBool>,
    err_tx: mpsc::Sender<anyhow::Error>,
    ready: Arc<std::sync::Mutex<Option<oneshot::Sender<()>>>>,
) {
    if let Some(tx) = ready.lock().expect("ready mutex").take() {
        let _ = tx.send(());
    }
    while !shutdown.load(Ordering::SeqCst) {
        let frame = match handle.next_frame() {
            Ok(Some(frame)) => frame,
            // Poll timeout, try again.
            Ok(None) => continue,
            Err(engine::EngineError::Eof) => {
                debug!("capture source drained");
                break;
            }
            Err(engine::EngineError::Fatal(err)) => {
                let _ = err_tx.blocking_send(err);
                return;
            }
        };

        let parsed = match handle.link_kind() {
            engine::LinkKind::Ethernet => {
                Packet::parse_ethernet(&frame.data, frame.wire_len, frame.timestamp_ns)
            }
            engine::LinkKind::Ip => {
                Packet::parse_ip(&frame.data, frame.wire_len, frame.timestamp_ns)
            }
        };

        match parsed {
            Ok(Some(pckt)) => handler(pckt),
            Ok(None) => {}
            Err(err) => {
                counter!("tapx_capture_decode_errors_total").increment(1);
                debug!(?err, bytes = frame.data.len(), "frame decode failed");
            }
        }
    }
}

/// Resolves the configured host to capture interfaces.
fn select_interfaces(host: &str, engine: CaptureEngine) -> Result<Vec<CaptureInterface>> {
    // File replay has no real interface.
    if engine == CaptureEngine::PcapFile {
        return Ok(vec![CaptureInterface {
            name: "file".to_string(),
            ip: None,
        }]);
    }

    let devices = pcap::Device::list().context("pcap device list")?;
    let wanted_ip: Option<IpAddr> = host.parse().ok();
    let mut out = Vec::new();
    for device in devices {
        let ips: Vec<IpAddr> = device.addresses.iter().map(|a| a.addr).collect();
        if host.is_empty() || host == "0.0.0.0" || host == "::" {
            // All non-loopback v4 interfaces.
            if let Some(ip) = ips
                .iter()
                .find(|ip| ip.is_ipv4() && !ip.is_loopback())
                .copied()
            {
                out.push(CaptureInterface {
                    name: device.name.clone(),
                    ip: Some(ip),
                });
            }
            continue;
        }
        if device.name == host {
            out.push(CaptureInterface {
                name: device.name.clone(),
                ip: ips.first().copied(),
            });
            continue;
        }
        if let Some(wanted) = wanted_ip {
            if ips.contains(&wanted) || wanted.is_loopback() && ips.iter().any(|ip| ip.is_loopback())
            {
                out.push(CaptureInterface {
                    name: device.name.clone(),
                    ip: Some(wanted),
                });
            }
        }
    }
    if out.is_empty() && wanted_ip.is_some() {
        // Capturing for a remote host: any default interface will see it.
        if let Some(device) = pcap::Device::lookup().ok().flatten() {
            warn!(host, device = %device.name, "host not local, capturing on default interface");
            out.push(CaptureInterface {
                name: device.name,
                ip: wanted_ip,
            });
        }
    }
    Ok(out)
}

/// Sampling filter used when recording for LogReplay: keep request packets
/// whose source port hashes under the rate, and response packets whose
/// destination port does.
pub fn sampling_filter(transport: &str, port: u16, host: &str, rate: u8) -> String {
    let sample_src = format!(" and ((tcp[0:2] & 0x0f) < {rate})");
    let sample_dst = format!(" and ((tcp[2:2] & 0x0f) < {rate})");
    format!(
        "({transport} dst port {port} and dst host {host}{sample_src}) or ({transport} src port {port} and src host {host}{sample_dst})"
    )
}

/// Non-loopback v4 addresses of this machine, for empty-host resolution.
pub fn local_ips() -> Result<Vec<String>> {
    let devices = pcap::Device::list().context("pcap device list")?;
    let mut ips = Vec::new();
    for device in devices {
        for address in &device.addresses {
            if address.addr.is_ipv4() && !address.addr.is_loopback() {
                ips.push(address.addr.to_string());
            }
        }
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_for(port: u16) -> Listener {
        Listener {
            host: "127.0.0.1".to_string(),
            port,
            transport: "tcp".to_string(),
            engine: CaptureEngine::Libpcap,
            track_response: true,
            options: PcapOptions::default(),
            interfaces: vec![CaptureInterface {
                name: "lo".to_string(),
                ip: Some("127.0.0.1".parse().unwrap()),
            }],
            handles: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn filter_with_known_port() {
        let listener = listener_for(8000);
        assert_eq!(
            listener.filter(&listener.interfaces[0]),
            "(tcp port 8000 and host 127.0.0.1)"
        );
    }

    #[test]
    fn filter_with_any_port() {
        let listener = listener_for(0);
        assert_eq!(
            listener.filter(&listener.interfaces[0]),
            "(tcp dst portrange 0-65535 and host 127.0.0.1)"
        );
    }

    #[test]
    fn explicit_filter_wins() {
        let mut listener = listener_for(8000);
        listener.set_options(PcapOptions {
            bpf_filter: Some("tcp port 9".to_string()),
            ..PcapOptions::default()
        });
        assert_eq!(listener.filter(&listener.interfaces[0]), "tcp port 9");
    }

    #[test]
    fn sampling_filter_covers_both_directions() {
        let filter = sampling_filter("tcp", 8000, "10.0.0.2", 4);
        assert!(filter.contains("(tcp dst port 8000 and dst host 10.0.0.2 and ((tcp[0:2] & 0x0f) < 4))"));
        assert!(filter.contains("(tcp src port 8000 and src host 10.0.0.2 and ((tcp[2:2] & 0x0f) < 4))"));
    }
}
