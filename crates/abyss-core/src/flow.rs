//! Bidirectional 5-tuple flow tracking.
//!
//! The table is owned exclusively by the aggregator thread; no locking. A
//! packet whose reversed tuple matches an existing entry updates that entry
//! and marks the flow bidirectional, so at most one entry ever exists per
//! unordered endpoint pair.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::packet::{FlowKey, PacketHeader};
use crate::telemetry::TopFlowSummary;
use crate::SnifferConfig;

pub const HTTPS_PORT: u16 = 443;

/// Direction of a flow relative to its first-seen packet.
///
/// 1 ("up") when the first packet had `src_port < dst_port`, 0 ("down")
/// otherwise, 2 ("bidi") once any reverse-direction packet is observed. Kept
/// as the wire encoding for schema compatibility.
pub const DIR_DOWN: u8 = 0;
pub const DIR_UP: u8 = 1;
pub const DIR_BIDI: u8 = 2;

#[derive(Debug, Clone)]
pub struct FlowState {
    pub key: FlowKey,
    pub bytes_total: u64,
    pub packets_total: u64,
    pub bytes_window: u64,
    pub packets_window: u64,
    /// Reserved; stays zero until a real estimator lands.
    pub rtt_estimate_ms: f64,
    pub jitter_ms: f64,
    pub is_https: bool,
    pub direction: u8,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

pub struct FlowTable {
    flows: HashMap<FlowKey, FlowState>,
    flow_timeout_seconds: f64,
    heavy_throughput_mbps: f64,
}

impl FlowTable {
    pub fn new(config: &SnifferConfig) -> Self {
        let mut flows = HashMap::new();
        flows.reserve(1024);
        Self {
            flows,
            flow_timeout_seconds: config.flow_timeout_seconds,
            heavy_throughput_mbps: config.heavy_throughput_mbps,
        }
    }

    /// Account one decoded packet.
    pub fn update(&mut self, pkt: &PacketHeader) {
        if pkt.protocol == 0 && !pkt.is_arp && !pkt.is_dns && !pkt.is_icmp {
            return;
        }

        let key = FlowKey::from_packet(pkt);
        let rev_key = key.reversed();

        if let Some(flow) = self.flows.get_mut(&rev_key) {
            bump(flow, pkt);
            flow.direction = DIR_BIDI;
            return;
        }

        if let Some(flow) = self.flows.get_mut(&key) {
            bump(flow, pkt);
            return;
        }

        let direction = if pkt.src_port < pkt.dst_port {
            DIR_UP
        } else {
            DIR_DOWN
        };
        self.flows.insert(
            key,
            FlowState {
                key,
                bytes_total: u64::from(pkt.wire_len),
                packets_total: 1,
                bytes_window: u64::from(pkt.wire_len),
                packets_window: 1,
                rtt_estimate_ms: 0.0,
                jitter_ms: 0.0,
                is_https: pkt.src_port == HTTPS_PORT || pkt.dst_port == HTTPS_PORT,
                direction,
                first_seen: pkt.timestamp,
                last_seen: pkt.timestamp,
            },
        );
    }

    /// Drop flows idle longer than the configured timeout.
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.flow_timeout_seconds;
        self.flows
            .retain(|_, flow| now.saturating_duration_since(flow.last_seen).as_secs_f64() <= timeout);
    }

    pub fn active_count(&self) -> usize {
        self.flows.len()
    }

    pub fn count_https(&self) -> u32 {
        self.flows.values().filter(|flow| flow.is_https).count() as u32
    }

    /// Flows whose window byte count exceeds the heavy-stream threshold.
    pub fn count_heavy_streams(&self, window_seconds: f64) -> u32 {
        if window_seconds <= 0.0 {
            return 0;
        }
        let threshold_bytes = self.heavy_throughput_mbps * 1e6 / 8.0 * window_seconds;
        self.flows
            .values()
            .filter(|flow| flow.bytes_window as f64 > threshold_bytes)
            .count() as u32
    }

    /// The `n` busiest flows of the current window, by window bytes
    /// descending. Ties may land in any order.
    pub fn top_flows(&self, n: usize, window_seconds: f64) -> Vec<TopFlowSummary> {
        if window_seconds <= 0.0 {
            return Vec::new();
        }

        let mut candidates: Vec<&FlowState> = self
            .flows
            .values()
            .filter(|flow| flow.bytes_window > 0)
            .collect();
        candidates.sort_unstable_by(|a, b| b.bytes_window.cmp(&a.bytes_window));
        candidates.truncate(n);

        candidates
            .into_iter()
            .map(|flow| TopFlowSummary {
                key: format_flow_key(&flow.key),
                bps: (flow.bytes_window as f64 * 8.0 / window_seconds) as u64,
                rtt: flow.rtt_estimate_ms,
                jitter: flow.jitter_ms,
                dir: direction_label(flow.direction).to_string(),
            })
            .collect()
    }

    pub fn total_bps(&self, window_seconds: f64) -> u64 {
        if window_seconds <= 0.0 {
            return 0;
        }
        let total_bytes: u64 = self.flows.values().map(|flow| flow.bytes_window).sum();
        (total_bytes as f64 * 8.0 / window_seconds) as u64
    }

    pub fn total_pps(&self, window_seconds: f64) -> u32 {
        if window_seconds <= 0.0 {
            return 0;
        }
        let total_pkts: u64 = self.flows.values().map(|flow| flow.packets_window).sum();
        (total_pkts as f64 / window_seconds) as u32
    }

    pub fn reset_window_counters(&mut self) {
        for flow in self.flows.values_mut() {
            flow.bytes_window = 0;
            flow.packets_window = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &FlowKey) -> Option<&FlowState> {
        self.flows.get(key)
    }
}

fn bump(flow: &mut FlowState, pkt: &PacketHeader) {
    flow.bytes_total += u64::from(pkt.wire_len);
    flow.bytes_window += u64::from(pkt.wire_len);
    flow.packets_total += 1;
    flow.packets_window += 1;
    debug_assert!(flow.bytes_total >= flow.bytes_window);
    debug_assert!(flow.packets_total >= flow.packets_window);
    flow.last_seen = pkt.timestamp;
}

/// `"A.B.C.D:W.X.Y.Z:DSTPORT"` — the source port is left out so both
/// directions of a conversation render under one label.
fn format_flow_key(key: &FlowKey) -> String {
    format!(
        "{}:{}:{}",
        Ipv4Addr::from(key.src_ip),
        Ipv4Addr::from(key.dst_ip),
        key.dst_port
    )
}

pub(crate) fn direction_label(direction: u8) -> &'static str {
    match direction {
        DIR_UP => "up",
        DIR_BIDI => "bidi",
        _ => "down",
    }
}
