//! libpcap packet source
//!
//! Reads frames from a live interface or a capture file on a dedicated OS
//! thread. Live capture never blocks on the pipeline: when the queue is full
//! the packet is dropped and counted. File replay has no such deadline, so
//! it waits for room instead.

use crate::frame::{decode_frame, Frame, LinkLayer};
use crate::CaptureError;
use async_trait::async_trait;
use pcap::{Activated, Capture, Linktype};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};
use wiretap_core::config::{CaptureSettings, ProtocolSettings};
use wiretap_core::metrics::{add, inc, SharedMetrics};
use wiretap_core::packet::Packet;
use wiretap_core::plugins::{
    CapturePlugin, CaptureStats, Plugin, PluginError, PluginInfo, PluginResult,
};

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    Interface(String),
    File(PathBuf),
}

impl CaptureSource {
    pub fn is_live(&self) -> bool {
        matches!(self, CaptureSource::Interface(_))
    }
}

/// pcap source configuration
#[derive(Debug, Clone)]
pub struct PcapConfig {
    pub source: CaptureSource,
    pub snaplen: i32,
    pub promiscuous: bool,
    pub read_timeout_ms: i32,
    pub bpf_filter: Option<String>,
}

impl PcapConfig {
    pub fn new(source: CaptureSource) -> Self {
        let defaults = CaptureSettings::default();
        Self {
            source,
            snaplen: defaults.snaplen,
            promiscuous: defaults.promiscuous,
            read_timeout_ms: defaults.read_timeout_ms,
            bpf_filter: None,
        }
    }

    /// Build from configuration; fails when neither an interface nor a file is set
    pub fn from_settings(
        capture: &CaptureSettings,
        protocols: &ProtocolSettings,
    ) -> Result<Self, CaptureError> {
        let source = match (&capture.interface, &capture.file) {
            (Some(interface), _) => CaptureSource::Interface(interface.clone()),
            (None, Some(file)) => CaptureSource::File(PathBuf::from(file)),
            (None, None) => return Err(CaptureError::NoSource),
        };
        Ok(Self {
            source,
            snaplen: capture.snaplen,
            promiscuous: capture.promiscuous,
            read_timeout_ms: capture.read_timeout_ms,
            bpf_filter: crate::filter::effective_filter(capture, protocols),
        })
    }
}

/// Map a pcap data link type to the framing we understand
pub fn link_layer(linktype: Linktype) -> Option<LinkLayer> {
    match linktype {
        Linktype::ETHERNET => Some(LinkLayer::Ethernet),
        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => Some(LinkLayer::Raw),
        Linktype::LINUX_SLL => Some(LinkLayer::LinuxSll),
        Linktype::NULL | Linktype::LOOP => Some(LinkLayer::Null),
        _ => None,
    }
}

/// Capture plugin backed by libpcap
pub struct PcapCapture {
    config: PcapConfig,
    metrics: SharedMetrics,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PcapCapture {
    pub fn new(config: PcapConfig, metrics: SharedMetrics) -> Self {
        Self {
            config,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    fn spawn<T>(&mut self, mut cap: Capture<T>, tx: mpsc::Sender<Packet>) -> PluginResult<()>
    where
        T: Activated + ?Sized + 'static,
        Capture<T>: Send,
    {
        if let Some(filter) = &self.config.bpf_filter {
            cap.filter(filter, true).map_err(|source| CaptureError::Filter {
                filter: filter.clone(),
                source,
            })?;
            info!(filter = %filter, "Applied BPF filter");
        }

        let datalink = cap.get_datalink();
        let link = link_layer(datalink).ok_or(CaptureError::UnsupportedLink(datalink.0))?;

        let live = self.config.source.is_live();
        let running = self.running.clone();
        let metrics = self.metrics.clone();
        running.store(true, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("wiretap-capture".into())
            .spawn(move || pump(cap, link, live, tx, running, metrics))
            .map_err(PluginError::IoError)?;
        self.handle = Some(handle);
        Ok(())
    }
}

fn timestamp_ns(header: &pcap::PacketHeader) -> u64 {
    let secs = header.ts.tv_sec.max(0) as u64;
    let micros = header.ts.tv_usec.max(0) as u64;
    secs * 1_000_000_000 + micros * 1_000
}

/// How often libpcap's own drop counters are read during live capture
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Turns libpcap's cumulative drop counters into increments. libpcap keeps
/// them as 32-bit values that may wrap.
#[derive(Debug, Default)]
struct KernelDrops {
    dropped: u32,
    if_dropped: u32,
}

impl KernelDrops {
    fn delta(&mut self, dropped: u32, if_dropped: u32) -> u64 {
        let delta = dropped.wrapping_sub(self.dropped) as u64
            + if_dropped.wrapping_sub(self.if_dropped) as u64;
        self.dropped = dropped;
        self.if_dropped = if_dropped;
        delta
    }

    fn sample<T: Activated + ?Sized>(&mut self, cap: &mut Capture<T>, metrics: &SharedMetrics) {
        match cap.stats() {
            Ok(stat) => {
                let lost = self.delta(stat.dropped, stat.if_dropped);
                if lost > 0 {
                    add(&metrics.capture.packets_dropped, lost);
                    add(&metrics.capture.packets_dropped_kernel, lost);
                    debug!(lost, "libpcap reported dropped packets");
                }
            }
            Err(e) => trace!("Capture stats unavailable: {}", e),
        }
    }
}

fn pump<T: Activated + ?Sized>(
    mut cap: Capture<T>,
    link: LinkLayer,
    live: bool,
    tx: mpsc::Sender<Packet>,
    running: Arc<AtomicBool>,
    metrics: SharedMetrics,
) {
    debug!(?link, live, "Capture thread started");
    let mut kernel_drops = KernelDrops::default();
    let mut next_stats = Instant::now() + STATS_INTERVAL;

    while running.load(Ordering::Relaxed) {
        if live && Instant::now() >= next_stats {
            kernel_drops.sample(&mut cap, &metrics);
            next_stats = Instant::now() + STATS_INTERVAL;
        }

        let frame = match cap.next_packet() {
            Ok(frame) => frame,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => {
                info!("End of capture file");
                break;
            }
            Err(e) => {
                error!("Capture error: {}", e);
                break;
            }
        };

        inc(&metrics.capture.packets_seen);
        add(&metrics.capture.bytes, frame.header.len as u64);

        let packet = match decode_frame(link, frame.data, timestamp_ns(frame.header)) {
            Frame::Packet(packet) => packet,
            Frame::Ignored => {
                inc(&metrics.capture.packets_ignored);
                continue;
            }
            Frame::Malformed(reason) => {
                inc(&metrics.capture.packets_malformed);
                trace!(reason, "Malformed frame");
                continue;
            }
        };

        if live {
            match tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => inc(&metrics.capture.packets_dropped),
                Err(TrySendError::Closed(_)) => break,
            }
        } else if tx.blocking_send(packet).is_err() {
            break;
        }
    }

    if live {
        kernel_drops.sample(&mut cap, &metrics);
    }
    running.store(false, Ordering::SeqCst);
    debug!("Capture thread exiting");
}

impl PluginInfo for PcapCapture {
    fn name(&self) -> &str {
        "pcap"
    }

    fn description(&self) -> &str {
        "Captures frames from a network interface or capture file via libpcap"
    }
}

impl Plugin for PcapCapture {
    fn shutdown(&mut self) -> PluginResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CapturePlugin for PcapCapture {
    async fn start(&mut self, tx: mpsc::Sender<Packet>) -> PluginResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PluginError::OperationFailed("Already running".into()));
        }

        match self.config.source.clone() {
            CaptureSource::Interface(name) => {
                info!(interface = %name, snaplen = self.config.snaplen, "Opening live capture");
                let cap = Capture::from_device(name.as_str())
                    .and_then(|c| {
                        c.promisc(self.config.promiscuous)
                            .snaplen(self.config.snaplen)
                            .timeout(self.config.read_timeout_ms)
                            .open()
                    })
                    .map_err(|source| CaptureError::Open {
                        target: name.clone(),
                        source,
                    })?;
                self.spawn(cap, tx)
            }
            CaptureSource::File(path) => {
                info!(file = %path.display(), "Replaying capture file");
                let cap = Capture::from_file(&path).map_err(|source| CaptureError::Open {
                    target: path.display().to_string(),
                    source,
                })?;
                self.spawn(cap, tx)
            }
        }
    }

    async fn stop(&mut self) -> PluginResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Capture thread did not exit cleanly");
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CaptureStats {
        let c = &self.metrics.capture;
        CaptureStats {
            packets_captured: c.packets_seen.load(Ordering::Relaxed),
            packets_dropped: c.packets_dropped.load(Ordering::Relaxed),
            packets_malformed: c.packets_malformed.load(Ordering::Relaxed),
            packets_ignored: c.packets_ignored.load(Ordering::Relaxed),
            bytes_captured: c.bytes.load(Ordering::Relaxed),
        }
    }
}

/// A capture device as reported by libpcap
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub description: Option<String>,
    pub addresses: Vec<String>,
}

/// List devices available for live capture
pub fn list_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
    let devices = pcap::Device::list().map_err(CaptureError::DeviceList)?;
    Ok(devices
        .into_iter()
        .map(|d| DeviceInfo {
            name: d.name,
            description: d.desc,
            addresses: d.addresses.iter().map(|a| a.addr.to_string()).collect(),
        })
        .collect())
}
