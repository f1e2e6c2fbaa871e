//! Live packet capture.
//!
//! Wraps a libpcap live handle: resolves the interface (explicit or
//! auto-detected), opens the device before any thread spawns so startup
//! failures surface immediately, then runs the producer loop — read, decode,
//! push to the ring. The read timeout doubles as the shutdown poll: libpcap
//! wakes us every 100 ms even on a silent network, and the loop re-checks
//! its running flag instead of relying on a cross-thread `breakloop`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::decode;
use crate::packet::LinkType;
use crate::{PacketRing, SnifferConfig};

/// Bytes captured per packet. Headers only; payloads never leave the kernel.
pub const SNAP_LEN: i32 = 96;

const READ_TIMEOUT_MS: i32 = 100;
const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no network interfaces found")]
    NoInterfaces,
    #[error("capture device error: {0}")]
    Pcap(#[from] pcap::Error),
}

/// One enumerated capture device.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub description: String,
    pub is_up: bool,
    pub is_loopback: bool,
    pub has_ipv4: bool,
}

/// Enumerate capture devices with the attributes interface selection needs.
pub fn list_interfaces() -> Result<Vec<NetworkInterface>, CaptureError> {
    let devices = pcap::Device::list()?;
    Ok(devices
        .into_iter()
        .map(|device| NetworkInterface {
            is_up: device.flags.is_up(),
            is_loopback: device.flags.is_loopback(),
            has_ipv4: device.addresses.iter().any(|addr| addr.addr.is_ipv4()),
            name: device.name,
            description: device.desc.unwrap_or_default(),
        })
        .collect())
}

/// Pick the interface most likely to carry real traffic: up, non-loopback
/// and holding an IPv4 address; degrade to up non-loopback, then to whatever
/// exists.
fn select_interface(interfaces: &[NetworkInterface]) -> Option<&NetworkInterface> {
    interfaces
        .iter()
        .find(|iface| !iface.is_loopback && iface.is_up && iface.has_ipv4)
        .or_else(|| {
            interfaces
                .iter()
                .find(|iface| !iface.is_loopback && iface.is_up)
        })
        .or_else(|| interfaces.first())
}

pub fn auto_detect_interface() -> Result<String, CaptureError> {
    let interfaces = list_interfaces()?;
    let chosen = select_interface(&interfaces).ok_or(CaptureError::NoInterfaces)?;
    if !chosen.has_ipv4 || chosen.is_loopback || !chosen.is_up {
        warn!(name = %chosen.name, "no fully-suitable interface; using best available");
    } else if chosen.description.is_empty() {
        info!(name = %chosen.name, "auto-detected interface");
    } else {
        info!(name = %chosen.name, description = %chosen.description, "auto-detected interface");
    }
    Ok(chosen.name.clone())
}

/// Counters the capture thread publishes for the supervisor.
#[derive(Debug, Default)]
pub struct CaptureStats {
    packets_captured: AtomicU64,
    kernel_drops: AtomicU64,
}

impl CaptureStats {
    pub fn packets_captured(&self) -> u64 {
        self.packets_captured.load(Ordering::Relaxed)
    }

    /// Packets the OS dropped before we read them, as libpcap reports.
    pub fn kernel_drops(&self) -> u64 {
        self.kernel_drops.load(Ordering::Relaxed)
    }
}

/// Stops a running capture loop from another thread. Idempotent.
#[derive(Clone)]
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
}

impl CaptureHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

pub struct CaptureEngine {
    interface: String,
    handle: pcap::Capture<pcap::Active>,
    link_type: LinkType,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl CaptureEngine {
    /// Resolve the interface and open the live handle.
    ///
    /// Called before any thread spawns so an unusable device fails startup
    /// rather than a running daemon.
    pub fn open(config: &SnifferConfig) -> Result<Self, CaptureError> {
        let interface = match &config.interface {
            Some(name) => name.clone(),
            None => auto_detect_interface()?,
        };

        let handle = pcap::Capture::from_device(interface.as_str())?
            .snaplen(SNAP_LEN)
            .promisc(false)
            .timeout(READ_TIMEOUT_MS)
            .open()?;

        let link_type = LinkType::from_dlt(handle.get_datalink().0);
        if let LinkType::Other(dlt) = link_type {
            warn!(dlt, "unusual link type; parsing may be incomplete");
        }

        Ok(Self {
            interface,
            handle,
            link_type,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop_handle(&self) -> CaptureHandle {
        CaptureHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// The producer loop: blocks in libpcap reads until stopped.
    pub fn run(&mut self, ring: &PacketRing) {
        self.running.store(true, Ordering::Release);
        info!(interface = %self.interface, "capture started");

        let mut last_stats = Instant::now();

        while self.running.load(Ordering::Acquire) {
            match self.handle.next_packet() {
                Ok(packet) => {
                    let header = decode::decode(
                        packet.data,
                        packet.header.len,
                        self.link_type,
                        Instant::now(),
                    );
                    ring.push(header);
                    self.stats.packets_captured.fetch_add(1, Ordering::Relaxed);
                }
                // Quiet network; take the chance to re-check the flag.
                Err(pcap::Error::TimeoutExpired) => {}
                Err(pcap::Error::NoMorePackets) => break,
                Err(err) => {
                    warn!(%err, "capture read error");
                }
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                if let Ok(stat) = self.handle.stats() {
                    self.stats
                        .kernel_drops
                        .store(u64::from(stat.dropped), Ordering::Relaxed);
                }
                last_stats = Instant::now();
            }
        }

        self.running.store(false, Ordering::Release);
        info!(
            packets = self.stats.packets_captured(),
            "capture stopped"
        );
    }
}
