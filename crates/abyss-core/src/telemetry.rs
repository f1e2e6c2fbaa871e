//! Telemetry frame model and its JSON wire shape.
//!
//! One frame is emitted per aggregation window and serialized verbatim with
//! serde; field names here are the schema. Frames are value-immutable once
//! built.

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: u32 = 1;

/// Maximum number of flow summaries carried per frame.
pub const TOP_FLOW_LIMIT: usize = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub schema: u32,
    /// Seconds since process start.
    pub t: f64,
    pub net: NetMetrics,
    pub proto: ProtoCounters,
    pub top_flows: Vec<TopFlowSummary>,
    pub health: SnifferHealth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetMetrics {
    pub bps: u64,
    pub pps: u32,
    pub active_flows: u32,
    /// EWMA over mean inter-packet spacing; a congestion proxy, not RTT.
    pub latency_ms: f64,
    pub packet_loss: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtoCounters {
    pub arp: u32,
    pub dns: u32,
    pub udp_small: u32,
    pub https_flows: u32,
    pub heavy_streams: u32,
    pub rst: u32,
    pub icmp_unreach: u32,
    /// Reserved; always zero in schema 1.
    pub firewall_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopFlowSummary {
    /// `"A.B.C.D:W.X.Y.Z:DSTPORT"`.
    pub key: String,
    pub bps: u64,
    pub rtt: f64,
    pub jitter: f64,
    /// `"down"`, `"up"` or `"bidi"`.
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnifferHealth {
    pub capture_drop: u64,
    pub queue_fill: f32,
    pub sniffer_fps: f32,
}

impl TelemetryFrame {
    /// Serialize to the single-line JSON text sent to every subscriber.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
