//! Core of the Abyss network sniffer.
//!
//! The pipeline runs across two long-lived threads joined by a lock-free
//! ring: the capture thread reads raw frames from libpcap and decodes them
//! into compact headers, the aggregator thread folds those headers into a
//! flow table and emits one telemetry frame per window over WebSocket.
//!
//! Module map, in dependency order:
//! - [`packet`]: the per-packet record and flow key value types
//! - [`ring`]: bounded SPSC queue with an overwrite-on-overflow policy
//! - [`decode`]: raw link-layer bytes → [`packet::PacketHeader`]
//! - [`flow`]: bidirectional 5-tuple tracking with expiration
//! - [`aggregate`]: windowed drain and frame synthesis
//! - [`telemetry`]: the frame model and its JSON wire shape
//! - [`capture`]: libpcap-backed producer loop and interface selection
//! - [`broadcast`]: WebSocket fan-out to loopback subscribers

pub mod aggregate;
pub mod broadcast;
pub mod capture;
pub mod decode;
pub mod flow;
pub mod packet;
pub mod ring;
pub mod telemetry;

pub use aggregate::{Aggregator, AggregatorHandle, HealthStats};
pub use broadcast::{BroadcastError, WsBroadcaster};
pub use capture::{
    auto_detect_interface, list_interfaces, CaptureEngine, CaptureError, CaptureHandle,
    NetworkInterface,
};
pub use decode::decode;
pub use packet::{FlowKey, LinkType, PacketHeader};
pub use ring::RingBuffer;
pub use telemetry::TelemetryFrame;

/// Ring capacity shared by the capture and aggregation threads.
pub const RING_CAPACITY: usize = 8192;

/// The queue between the capture producer and the aggregator consumer.
pub type PacketRing = RingBuffer<PacketHeader, RING_CAPACITY>;

/// Tunables of the capture→aggregate→publish pipeline.
///
/// Defaults match the wire schema expectations: a ~16.7 ms window gives the
/// ~60 Hz frame cadence the visualizer renders at.
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    /// Packets at or below this wire length count as "small UDP".
    pub small_packet_threshold: u32,
    /// Window byte-rate above which a flow counts as a heavy stream.
    pub heavy_throughput_mbps: f64,
    /// Smoothing factor of the latency-proxy EWMA.
    pub ewma_alpha: f64,
    pub window_duration_ms: f64,
    pub flow_timeout_seconds: f64,
    pub ws_port: u16,
    /// `None` selects an interface automatically.
    pub interface: Option<String>,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            small_packet_threshold: 128,
            heavy_throughput_mbps: 12.0,
            ewma_alpha: 0.2,
            window_duration_ms: 16.666,
            flow_timeout_seconds: 30.0,
            ws_port: 9770,
            interface: None,
        }
    }
}
