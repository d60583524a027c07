//! Concrete capture engines behind one frame-pull interface.

use anyhow::{anyhow, Context, Result};
use pcap_file::pcap::PcapReader;
use std::fs::File;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{CaptureEngine, CaptureInterface, PcapOptions};

const DEFAULT_SNAPLEN: i32 = 64 * 1024;
const FULL_SNAPLEN: i32 = 262_144;
const DEFAULT_TIMEOUT_MS: i32 = 200;
const RAW_READ_BUFFER: usize = 64 * 1024;

/// One raw frame as pulled off an engine.
pub struct Frame {
    pub data: Vec<u8>,
    pub wire_len: u32,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    Ip,
}

pub enum EngineError {
    /// Finite source (pcap file) fully read.
    Eof,
    Fatal(anyhow::Error),
}

pub enum EngineHandle {
    Pcap {
        capture: pcap::Capture<pcap::Active>,
        link: LinkKind,
    },
    PcapFile {
        reader: PcapReader<File>,
        link: LinkKind,
    },
    RawSocket {
        socket: socket2::Socket,
        buf: Vec<u8>,
    },
}

impl EngineHandle {
    pub fn open(
        engine: CaptureEngine,
        interface: &CaptureInterface,
        filter: &str,
        options: &PcapOptions,
    ) -> Result<EngineHandle> {
        match engine {
            CaptureEngine::Libpcap | CaptureEngine::AfPacket => {
                open_pcap(engine, interface, filter, options)
            }
            CaptureEngine::PcapFile => open_pcap_file(options),
            CaptureEngine::RawSocket => open_raw_socket(interface),
        }
    }

    pub fn link_kind(&self) -> LinkKind {
        match self {
            EngineHandle::Pcap { link, .. } => *link,
            EngineHandle::PcapFile { link, .. } => *link,
            EngineHandle::RawSocket { .. } => LinkKind::Ethernet,
        }
    }

    /// Pulls the next frame; `Ok(None)` is a poll timeout.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, EngineError> {
        match self {
            EngineHandle::Pcap { capture, .. } => match capture.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    let timestamp_ns =
                        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_usec as u64 * 1_000;
                    Ok(Some(Frame {
                        data: packet.data.to_vec(),
                        wire_len: packet.header.len,
                        timestamp_ns,
                    }))
                }
                Err(pcap::Error::TimeoutExpired) => Ok(None),
                Err(err) => Err(EngineError::Fatal(anyhow!("capture read failed: {err}"))),
            },
            EngineHandle::PcapFile { reader, .. } => match reader.next_packet() {
                Some(Ok(packet)) => Ok(Some(Frame {
                    data: packet.data.into_owned(),
                    wire_len: packet.orig_len,
                    timestamp_ns: packet.timestamp.as_nanos() as u64,
                })),
                Some(Err(err)) => Err(EngineError::Fatal(anyhow!("pcap file read: {err}"))),
                None => Err(EngineError::Eof),
            },
            EngineHandle::RawSocket { socket, buf } => {
                match socket.read(buf.as_mut_slice()) {
                    Ok(0) => Ok(None),
                    Ok(n) => Ok(Some(Frame {
                        data: buf[..n].to_vec(),
                        wire_len: n as u32,
                        timestamp_ns: SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_nanos() as u64)
                            .unwrap_or(0),
                    })),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(None),
                    Err(err) => Err(EngineError::Fatal(anyhow!("raw socket read: {err}"))),
                }
            }
        }
    }
}

fn open_pcap(
    engine: CaptureEngine,
    interface: &CaptureInterface,
    filter: &str,
    options: &PcapOptions,
) -> Result<EngineHandle> {
    let device = pcap::Device::list()
        .context("pcap device list")?
        .into_iter()
        .find(|d| d.name == interface.name)
        .ok_or_else(|| anyhow!("interface {} disappeared", interface.name))?;

    let snaplen = if options.override_snaplen {
        FULL_SNAPLEN
    } else {
        DEFAULT_SNAPLEN
    };
    let timeout = if options.buffer_timeout_ms > 0 {
        options.buffer_timeout_ms as i32
    } else {
        DEFAULT_TIMEOUT_MS
    };

    let mut builder = pcap::Capture::from_device(device)
        .context("pcap open")?
        .promisc(options.promiscuous)
        .snaplen(snaplen)
        .timeout(timeout);
    if options.buffer_bytes > 0 {
        builder = builder.buffer_size(options.buffer_bytes as i32);
    }
    if engine == CaptureEngine::AfPacket {
        builder = builder.immediate_mode(true);
    }

    let mut capture = builder.open().context("pcap activate")?;
    capture
        .filter(filter, true)
        .with_context(|| format!("bpf filter rejected: {filter}"))?;

    let link = match capture.get_datalink() {
        pcap::Linktype::ETHERNET => LinkKind::Ethernet,
        pcap::Linktype::RAW | pcap::Linktype::IPV4 | pcap::Linktype::IPV6 => LinkKind::Ip,
        other => {
            return Err(anyhow!(
                "unsupported datalink {} on {}",
                other.0,
                interface.name
            ))
        }
    };
    Ok(EngineHandle::Pcap { capture, link })
}

fn open_pcap_file(options: &PcapOptions) -> Result<EngineHandle> {
    let path = options
        .pcap_path
        .as_deref()
        .ok_or_else(|| anyhow!("pcap-file engine requires pcap_path"))?;
    let file = File::open(path).with_context(|| format!("open pcap file {path}"))?;
    let reader = PcapReader::new(file).context("pcap file header")?;
    let link = match reader.header().datalink {
        pcap_file::DataLink::ETHERNET => LinkKind::Ethernet,
        pcap_file::DataLink::RAW | pcap_file::DataLink::IPV4 | pcap_file::DataLink::IPV6 => {
            LinkKind::Ip
        }
        other => return Err(anyhow!("unsupported pcap file datalink {other:?}")),
    };
    Ok(EngineHandle::PcapFile { reader, link })
}

fn open_raw_socket(interface: &CaptureInterface) -> Result<EngineHandle> {
    use socket2::{Domain, Protocol, Socket, Type};

    let protocol = Protocol::from((libc::ETH_P_ALL as u16).to_be() as i32);
    let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
        .context("raw socket (requires CAP_NET_RAW)")?;
    socket
        .bind_device(Some(interface.name.as_bytes()))
        .with_context(|| format!("bind raw socket to {}", interface.name))?;
    socket
        .set_read_timeout(Some(std::time::Duration::from_millis(
            DEFAULT_TIMEOUT_MS as u64,
        )))
        .context("raw socket read timeout")?;
    Ok(EngineHandle::RawSocket {
        socket,
        buf: vec![0u8; RAW_READ_BUFFER],
    })
}
