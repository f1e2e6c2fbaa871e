//! Packet model shared by the decoder, ring buffer and flow table.
//!
//! `PacketHeader` is the compact per-frame record the decoder produces and
//! the aggregator consumes. It is deliberately small (fits a ring slot) and
//! carries no payload bytes; IPv6 addresses are folded to 32-bit keys so the
//! flow table can treat both IP versions uniformly.

use std::time::Instant;

/// Link-layer framing of a captured packet, derived from the DLT value the
/// capture library reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II (DLT_EN10MB).
    Ethernet,
    /// Linux cooked capture (DLT_LINUX_SLL).
    LinuxSll,
    /// BSD null/loopback encapsulation (DLT_NULL).
    Null,
    /// Anything else; the decoder leaves such frames unparsed.
    Other(i32),
}

impl LinkType {
    /// Map a raw DLT integer to a known link type.
    pub fn from_dlt(dlt: i32) -> Self {
        match dlt {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            113 => LinkType::LinuxSll,
            other => LinkType::Other(other),
        }
    }
}

/// Decoded per-packet record.
///
/// Every field past the point where decoding stopped stays at its zero
/// value; a header that failed link-layer parsing still carries valid
/// timestamps and lengths and is enqueued like any other.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub timestamp: Instant,
    pub captured_len: u32,
    pub wire_len: u32,

    /// 0 when no IP layer was decoded, otherwise 4 or 6.
    pub ip_version: u8,
    /// Host-order IPv4 address, or the FNV-1a fold of an IPv6 address.
    pub src_ip: u32,
    pub dst_ip: u32,
    pub protocol: u8,

    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,

    pub is_arp: bool,
    pub is_dns: bool,
    pub is_icmp: bool,
}

impl PacketHeader {
    /// A zeroed record carrying only capture metadata.
    pub fn new(captured_len: u32, wire_len: u32, now: Instant) -> Self {
        Self {
            timestamp: now,
            captured_len,
            wire_len,
            ip_version: 0,
            src_ip: 0,
            dst_ip: 0,
            protocol: 0,
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
            is_arp: false,
            is_dns: false,
            is_icmp: false,
        }
    }
}

/// Bidirectional flow identity: the classic 5-tuple.
///
/// Two keys are equal iff all five fields match; the derived hash composes
/// the per-field hashes. Reverse-direction matching is the flow table's job,
/// not the key's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn from_packet(pkt: &PacketHeader) -> Self {
        Self {
            src_ip: pkt.src_ip,
            dst_ip: pkt.dst_ip,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
        }
    }

    /// The same 5-tuple with endpoints swapped.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}
