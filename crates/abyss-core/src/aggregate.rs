//! Windowed aggregation: drains the ring, feeds the flow table and emits one
//! telemetry frame per window (~60 Hz at the default window).
//!
//! Everything mutable here — the flow table, the window counters, the EWMA —
//! is owned by the single thread running `run()`. The only inputs crossing
//! the thread boundary are the ring buffer and the relaxed health sample the
//! supervisor publishes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::decode::layout::{PROTO_UDP, TCP_FLAG_RST};
use crate::flow::FlowTable;
use crate::telemetry::{TelemetryFrame, SCHEMA_VERSION, TOP_FLOW_LIMIT};
use crate::{PacketRing, SnifferConfig};

/// Records drained from the ring per loop iteration, at most.
const MAX_DRAIN: usize = 4096;

/// Seconds between expiration sweeps of the flow table.
const EXPIRE_INTERVAL_SECONDS: f64 = 5.0;

/// Health sample shared between the supervisor (writer) and the aggregator
/// (reader). Relaxed ordering throughout: telemetry tolerates a slightly
/// stale read.
#[derive(Debug, Default)]
pub struct HealthStats {
    capture_drops: AtomicU64,
    queue_fill_bits: AtomicU32,
}

impl HealthStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, capture_drops: u64, queue_fill: f32) {
        self.capture_drops.store(capture_drops, Ordering::Relaxed);
        self.queue_fill_bits
            .store(queue_fill.to_bits(), Ordering::Relaxed);
    }

    pub fn capture_drops(&self) -> u64 {
        self.capture_drops.load(Ordering::Relaxed)
    }

    pub fn queue_fill(&self) -> f32 {
        f32::from_bits(self.queue_fill_bits.load(Ordering::Relaxed))
    }
}

/// Stops a running aggregator from another thread. Idempotent.
#[derive(Clone)]
pub struct AggregatorHandle {
    running: Arc<AtomicBool>,
}

impl AggregatorHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct WindowCounters {
    arp: u32,
    dns: u32,
    udp_small: u32,
    rst: u32,
    icmp_unreach: u32,
    total_pkts: u32,
    total_bytes: u64,
}

type FrameCallback = Box<dyn FnMut(&TelemetryFrame) + Send>;

pub struct Aggregator {
    config: SnifferConfig,
    ring: Arc<PacketRing>,
    flow_table: FlowTable,
    health: Arc<HealthStats>,
    running: Arc<AtomicBool>,
    on_frame: Option<FrameCallback>,
    window: WindowCounters,
    ewma_latency_ms: f64,
    start_time: Instant,
}

impl Aggregator {
    pub fn new(config: SnifferConfig, ring: Arc<PacketRing>, health: Arc<HealthStats>) -> Self {
        let flow_table = FlowTable::new(&config);
        Self {
            config,
            ring,
            flow_table,
            health,
            running: Arc::new(AtomicBool::new(false)),
            on_frame: None,
            window: WindowCounters::default(),
            ewma_latency_ms: 0.0,
            start_time: Instant::now(),
        }
    }

    /// Register the callback invoked with every emitted frame.
    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: FnMut(&TelemetryFrame) + Send + 'static,
    {
        self.on_frame = Some(Box::new(callback));
    }

    pub fn stop_handle(&self) -> AggregatorHandle {
        AggregatorHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// The consumer loop. Blocks until `AggregatorHandle::stop` is called.
    pub fn run(&mut self) {
        self.running.store(true, Ordering::Release);
        self.start_time = Instant::now();

        let window_duration = Duration::from_secs_f64(self.config.window_duration_ms / 1000.0);
        let sleep = tick_sleep(self.config.window_duration_ms);
        let mut window_start = Instant::now();
        let mut last_expire = Instant::now();
        let mut frames_produced = 0u64;

        info!(window_ms = self.config.window_duration_ms, "aggregator started");

        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();

            self.drain_ring();

            let elapsed = now.saturating_duration_since(window_start);
            if elapsed >= window_duration {
                let window_seconds = elapsed.as_secs_f64();
                debug!(
                    pkts = self.window.total_pkts,
                    bytes = self.window.total_bytes,
                    "window closed"
                );
                let frame = self.build_frame(window_seconds);
                frames_produced += 1;

                if let Some(callback) = self.on_frame.as_mut() {
                    callback(&frame);
                }

                self.flow_table.reset_window_counters();
                self.window = WindowCounters::default();
                window_start = now;
            }

            if now.saturating_duration_since(last_expire).as_secs_f64() > EXPIRE_INTERVAL_SECONDS {
                self.flow_table.expire(now);
                last_expire = now;
            }

            thread::sleep(sleep);
        }

        info!(frames_produced, "aggregator stopped");
    }

    fn drain_ring(&mut self) {
        for _ in 0..MAX_DRAIN {
            let Some(pkt) = self.ring.pop() else {
                break;
            };

            self.flow_table.update(&pkt);

            self.window.total_pkts += 1;
            self.window.total_bytes += u64::from(pkt.wire_len);

            if pkt.is_arp {
                self.window.arp += 1;
            }
            if pkt.is_dns {
                self.window.dns += 1;
            }
            if pkt.is_icmp {
                self.window.icmp_unreach += 1;
            }
            if pkt.protocol == PROTO_UDP && pkt.wire_len <= self.config.small_packet_threshold {
                self.window.udp_small += 1;
            }
            if pkt.tcp_flags & TCP_FLAG_RST != 0 {
                self.window.rst += 1;
            }
        }
    }

    fn build_frame(&mut self, window_seconds: f64) -> TelemetryFrame {
        let mut frame = TelemetryFrame {
            schema: SCHEMA_VERSION,
            t: self.start_time.elapsed().as_secs_f64(),
            ..TelemetryFrame::default()
        };

        frame.net.bps = self.flow_table.total_bps(window_seconds);
        frame.net.pps = self.flow_table.total_pps(window_seconds);
        frame.net.active_flows = self.flow_table.active_count() as u32;

        // Latency proxy: EWMA over the mean inter-packet gap, capped so one
        // quiet window cannot blow the average up.
        if self.window.total_pkts > 1 && window_seconds > 0.0 {
            let avg_inter_packet_ms =
                (window_seconds * 1000.0 / f64::from(self.window.total_pkts)).min(500.0);
            self.ewma_latency_ms = self.config.ewma_alpha * avg_inter_packet_ms
                + (1.0 - self.config.ewma_alpha) * self.ewma_latency_ms;
        }
        frame.net.latency_ms = self.ewma_latency_ms;

        if self.window.total_pkts > 0 {
            let pkts = f64::from(self.window.total_pkts);
            frame.net.packet_loss = (f64::from(self.window.rst) / pkts).clamp(0.0, 1.0);
            frame.net.error_rate =
                (f64::from(self.window.rst + self.window.icmp_unreach) / pkts).clamp(0.0, 1.0);
        }

        frame.proto.arp = self.window.arp;
        frame.proto.dns = self.window.dns;
        frame.proto.udp_small = self.window.udp_small;
        frame.proto.https_flows = self.flow_table.count_https();
        frame.proto.heavy_streams = self.flow_table.count_heavy_streams(window_seconds);
        frame.proto.rst = self.window.rst;
        frame.proto.icmp_unreach = self.window.icmp_unreach;
        frame.proto.firewall_blocks = 0;

        frame.top_flows = self.flow_table.top_flows(TOP_FLOW_LIMIT, window_seconds);

        frame.health.capture_drop = self.health.capture_drops();
        frame.health.queue_fill = self.health.queue_fill();
        if window_seconds > 0.0 {
            frame.health.sniffer_fps = (1.0 / window_seconds) as f32;
        }

        sanitize(&mut frame.net.latency_ms);
        sanitize(&mut frame.net.packet_loss);
        sanitize(&mut frame.net.error_rate);
        sanitize(&mut frame.t);

        frame
    }
}

fn sanitize(value: &mut f64) {
    if value.is_nan() || value.is_infinite() {
        *value = 0.0;
    }
}

/// Per-iteration sleep: a quarter window, clamped to 1–8 ms.
fn tick_sleep(window_duration_ms: f64) -> Duration {
    Duration::from_secs_f64((window_duration_ms / 4.0).clamp(1.0, 8.0) / 1000.0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{sanitize, tick_sleep, Aggregator, HealthStats};
    use crate::packet::PacketHeader;
    use crate::{PacketRing, SnifferConfig};

    fn aggregator() -> Aggregator {
        Aggregator::new(
            SnifferConfig::default(),
            Arc::new(PacketRing::new()),
            Arc::new(HealthStats::new()),
        )
    }

    fn tcp_packet(wire_len: u32, tcp_flags: u8, now: Instant) -> PacketHeader {
        let mut pkt = PacketHeader::new(wire_len, wire_len, now);
        pkt.ip_version = 4;
        pkt.src_ip = u32::from_be_bytes([1, 1, 1, 1]);
        pkt.dst_ip = u32::from_be_bytes([2, 2, 2, 2]);
        pkt.src_port = 50_000;
        pkt.dst_port = 443;
        pkt.protocol = 6;
        pkt.tcp_flags = tcp_flags;
        pkt
    }

    #[test]
    fn single_tcp_flow_window() {
        let mut agg = aggregator();
        let now = Instant::now();
        for _ in 0..10 {
            agg.ring.push(tcp_packet(1500, 0, now));
        }
        agg.drain_ring();

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.schema, 1);
        assert_eq!(frame.net.active_flows, 1);
        assert_eq!(frame.net.bps, 120_000);
        assert_eq!(frame.net.pps, 10);
        assert_eq!(frame.proto.https_flows, 1);
        assert_eq!(frame.top_flows.len(), 1);
        assert_eq!(frame.top_flows[0].key, "1.1.1.1:2.2.2.2:443");
        // First packet had src_port 50000 > dst_port 443.
        assert_eq!(frame.top_flows[0].dir, "down");
        assert_eq!(frame.top_flows[0].bps, 120_000);
    }

    #[test]
    fn bidirectional_flow_reports_bidi() {
        let mut agg = aggregator();
        let now = Instant::now();
        for _ in 0..5 {
            agg.ring.push(tcp_packet(1000, 0, now));
        }
        for _ in 0..5 {
            let mut pkt = tcp_packet(1000, 0, now);
            std::mem::swap(&mut pkt.src_ip, &mut pkt.dst_ip);
            std::mem::swap(&mut pkt.src_port, &mut pkt.dst_port);
            agg.ring.push(pkt);
        }
        agg.drain_ring();

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.net.active_flows, 1);
        assert_eq!(frame.top_flows.len(), 1);
        assert_eq!(frame.top_flows[0].dir, "bidi");
    }

    #[test]
    fn arp_burst_counts_frames() {
        let mut agg = aggregator();
        let now = Instant::now();
        for _ in 0..100 {
            let mut pkt = PacketHeader::new(60, 60, now);
            pkt.is_arp = true;
            agg.ring.push(pkt);
        }
        agg.drain_ring();

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.proto.arp, 100);
        assert_eq!(frame.net.pps, 100);
        // ARP frames share one all-zero pseudo-flow entry.
        assert_eq!(frame.net.active_flows, 1);
    }

    #[test]
    fn small_udp_dns_counts() {
        let mut agg = aggregator();
        let now = Instant::now();
        let mut pkt = PacketHeader::new(90, 90, now);
        pkt.ip_version = 4;
        pkt.src_ip = 1;
        pkt.dst_ip = 2;
        pkt.src_port = 40_000;
        pkt.dst_port = 53;
        pkt.protocol = 17;
        pkt.is_dns = true;
        agg.ring.push(pkt);
        agg.drain_ring();

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.proto.dns, 1);
        assert_eq!(frame.proto.udp_small, 1);
    }

    #[test]
    fn udp_above_threshold_is_not_small() {
        let mut agg = aggregator();
        let now = Instant::now();
        let mut pkt = PacketHeader::new(129, 129, now);
        pkt.protocol = 17;
        pkt.src_port = 1;
        pkt.dst_port = 2;
        agg.ring.push(pkt);
        agg.drain_ring();

        assert_eq!(agg.window.udp_small, 0);
        assert_eq!(agg.window.total_pkts, 1);
    }

    #[test]
    fn rst_drives_loss_and_error_proxies() {
        let mut agg = aggregator();
        let now = Instant::now();
        for i in 0..4 {
            let flags = if i == 0 { 0x04 } else { 0 };
            agg.ring.push(tcp_packet(100, flags, now));
        }
        let mut icmp = PacketHeader::new(64, 64, now);
        icmp.ip_version = 4;
        icmp.src_ip = 9;
        icmp.dst_ip = 10;
        icmp.protocol = 1;
        icmp.is_icmp = true;
        agg.ring.push(icmp);
        agg.drain_ring();

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.proto.rst, 1);
        assert_eq!(frame.proto.icmp_unreach, 1);
        assert!((frame.net.packet_loss - 0.2).abs() < 1e-9);
        assert!((frame.net.error_rate - 0.4).abs() < 1e-9);
        assert!(frame.net.packet_loss >= 0.0 && frame.net.packet_loss <= 1.0);
        assert!(frame.net.error_rate >= 0.0 && frame.net.error_rate <= 1.0);
    }

    #[test]
    fn ewma_latency_tracks_inter_packet_gap() {
        let mut agg = aggregator();
        let now = Instant::now();
        for _ in 0..10 {
            agg.ring.push(tcp_packet(100, 0, now));
        }
        agg.drain_ring();

        // Mean gap 1000 ms / 10 packets = 100 ms; alpha 0.2 from zero.
        let frame = agg.build_frame(1.0);
        assert!((frame.net.latency_ms - 20.0).abs() < 1e-9);

        // No packets in the next window: the estimate holds.
        agg.window = super::WindowCounters::default();
        let frame = agg.build_frame(1.0);
        assert!((frame.net.latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_produces_clean_frame() {
        let mut agg = aggregator();
        let frame = agg.build_frame(0.016_666);
        assert_eq!(frame.net.bps, 0);
        assert_eq!(frame.net.pps, 0);
        assert_eq!(frame.net.active_flows, 0);
        assert_eq!(frame.net.packet_loss, 0.0);
        assert_eq!(frame.net.error_rate, 0.0);
        assert!(frame.top_flows.is_empty());
        assert!(frame.health.sniffer_fps > 59.0 && frame.health.sniffer_fps < 61.0);
        assert!(!frame.t.is_nan());
    }

    #[test]
    fn health_sample_is_copied_into_frame() {
        let health = Arc::new(HealthStats::new());
        let mut agg = Aggregator::new(
            SnifferConfig::default(),
            Arc::new(PacketRing::new()),
            Arc::clone(&health),
        );
        health.update(42, 0.5);

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.health.capture_drop, 42);
        assert_eq!(frame.health.queue_fill, 0.5);
    }

    #[test]
    fn window_counters_reset_between_frames() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.ring.push(tcp_packet(100, 0, now));
        agg.drain_ring();
        assert_eq!(agg.window.total_pkts, 1);

        // What run() does at a frame boundary.
        let _ = agg.build_frame(1.0);
        agg.flow_table.reset_window_counters();
        agg.window = super::WindowCounters::default();

        let frame = agg.build_frame(1.0);
        assert_eq!(frame.net.bps, 0);
        assert_eq!(frame.proto.rst, 0);
        // The flow itself survives until expiration.
        assert_eq!(frame.net.active_flows, 1);
    }

    #[test]
    fn sanitize_replaces_non_finite_values() {
        let mut value = f64::NAN;
        sanitize(&mut value);
        assert_eq!(value, 0.0);
        let mut value = f64::INFINITY;
        sanitize(&mut value);
        assert_eq!(value, 0.0);
        let mut value = 1.5;
        sanitize(&mut value);
        assert_eq!(value, 1.5);
    }

    #[test]
    fn tick_sleep_is_clamped() {
        let default_sleep = tick_sleep(16.666);
        assert!(default_sleep > Duration::from_millis(4));
        assert!(default_sleep < Duration::from_millis(5));
        assert_eq!(tick_sleep(1.0), Duration::from_millis(1));
        assert_eq!(tick_sleep(100.0), Duration::from_millis(8));
    }

    #[test]
    fn stop_handle_is_idempotent() {
        let agg = aggregator();
        let handle = agg.stop_handle();
        assert!(!handle.is_running());
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }
}
