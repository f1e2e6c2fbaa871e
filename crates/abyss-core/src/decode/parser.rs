use std::time::Instant;

use crate::packet::{LinkType, PacketHeader};

use super::layout;
use super::reader::FrameReader;

/// Decode a raw link-layer frame into a `PacketHeader`.
///
/// Never fails: when parsing stops at any layer (unknown framing, truncated
/// capture, unsupported protocol) the header is returned with every field
/// past that layer still zero. The caller enqueues all records uniformly.
pub fn decode(data: &[u8], wire_len: u32, link_type: LinkType, now: Instant) -> PacketHeader {
    let mut header = PacketHeader::new(data.len() as u32, wire_len, now);
    let reader = FrameReader::new(data);

    let Some((mut offset, mut eth_type)) = parse_link_layer(&reader, link_type) else {
        return header;
    };

    // 802.1Q / 802.1ad stripping, capped at two stacked tags (QinQ).
    let mut tags = 0;
    while (eth_type == layout::ETH_TYPE_VLAN || eth_type == layout::ETH_TYPE_QINQ)
        && tags < layout::MAX_VLAN_TAGS
    {
        let Ok(inner) = reader.read_u16_be(offset + 2) else {
            return header;
        };
        eth_type = inner;
        offset += layout::VLAN_TAG_LEN;
        tags += 1;
    }

    match eth_type {
        layout::ETH_TYPE_ARP => header.is_arp = true,
        layout::ETH_TYPE_IPV4 => parse_ipv4(&reader, offset, &mut header),
        layout::ETH_TYPE_IPV6 => parse_ipv6(&reader, offset, &mut header),
        _ => {}
    }

    header
}

/// Returns the network-layer offset and ethertype, or `None` when the frame
/// is too short or the link type is not handled.
fn parse_link_layer(reader: &FrameReader<'_>, link_type: LinkType) -> Option<(usize, u16)> {
    match link_type {
        LinkType::Ethernet => {
            let eth_type = reader.read_u16_be(layout::ETHERNET_TYPE_OFFSET).ok()?;
            reader.require_len(layout::ETHERNET_HEADER_LEN).ok()?;
            Some((layout::ETHERNET_HEADER_LEN, eth_type))
        }
        LinkType::LinuxSll => {
            let eth_type = reader.read_u16_be(layout::SLL_TYPE_OFFSET).ok()?;
            reader.require_len(layout::SLL_HEADER_LEN).ok()?;
            Some((layout::SLL_HEADER_LEN, eth_type))
        }
        LinkType::Null => {
            // The loopback pseudo-header is a host-endian address family.
            let family = reader.read_u32_ne(0).ok()?;
            let eth_type = if family == layout::NULL_AF_INET {
                layout::ETH_TYPE_IPV4
            } else {
                layout::ETH_TYPE_IPV6
            };
            Some((layout::NULL_HEADER_LEN, eth_type))
        }
        LinkType::Other(_) => None,
    }
}

fn parse_ipv4(reader: &FrameReader<'_>, offset: usize, header: &mut PacketHeader) {
    if reader.require_len(offset + layout::IPV4_MIN_HEADER_LEN).is_err() {
        return;
    }
    let Ok(ver_ihl) = reader.read_u8(offset) else {
        return;
    };
    if ver_ihl >> 4 != 4 {
        return;
    }
    let ihl = usize::from(ver_ihl & 0x0F) * 4;
    if ihl < layout::IPV4_MIN_HEADER_LEN || reader.require_len(offset + ihl).is_err() {
        return;
    }

    let (Ok(src), Ok(dst), Ok(protocol)) = (
        reader.read_u32_be(offset + layout::IPV4_SRC_OFFSET),
        reader.read_u32_be(offset + layout::IPV4_DST_OFFSET),
        reader.read_u8(offset + layout::IPV4_PROTOCOL_OFFSET),
    ) else {
        return;
    };

    header.ip_version = 4;
    header.src_ip = src;
    header.dst_ip = dst;
    header.protocol = protocol;

    if protocol == layout::PROTO_ICMP {
        header.is_icmp = true;
        return;
    }

    parse_transport(reader, offset + ihl, protocol, header);
}

fn parse_ipv6(reader: &FrameReader<'_>, offset: usize, header: &mut PacketHeader) {
    if reader.require_len(offset + layout::IPV6_HEADER_LEN).is_err() {
        return;
    }

    let (Ok(src), Ok(dst), Ok(first_proto)) = (
        reader.read_slice(offset + layout::IPV6_SRC_OFFSET, layout::IPV6_ADDR_LEN),
        reader.read_slice(offset + layout::IPV6_DST_OFFSET, layout::IPV6_ADDR_LEN),
        reader.read_u8(offset + layout::IPV6_NEXT_HEADER_OFFSET),
    ) else {
        return;
    };

    header.ip_version = 6;
    header.src_ip = fnv1a(src);
    header.dst_ip = fnv1a(dst);

    // Walk the extension-header chain up to a fixed hop count; whatever
    // protocol the walk ends on is recorded, even when the chain runs past
    // the captured bytes.
    let mut proto = first_proto;
    let mut l4_offset = offset + layout::IPV6_HEADER_LEN;
    for _ in 0..layout::IPV6_MAX_EXTENSION_HOPS {
        match proto {
            layout::EXT_HOP_BY_HOP | layout::EXT_ROUTING | layout::EXT_DEST_OPTIONS => {
                let (Ok(next), Ok(len_units)) =
                    (reader.read_u8(l4_offset), reader.read_u8(l4_offset + 1))
                else {
                    break;
                };
                proto = next;
                l4_offset += usize::from(len_units) * 8 + 8;
            }
            layout::EXT_FRAGMENT => {
                let Ok(next) = reader.read_u8(l4_offset) else {
                    break;
                };
                proto = next;
                l4_offset += layout::FRAGMENT_HEADER_LEN;
            }
            _ => break,
        }
    }
    header.protocol = proto;

    if proto == layout::PROTO_ICMPV6 {
        header.is_icmp = true;
        return;
    }

    parse_transport(reader, l4_offset, proto, header);
}

fn parse_transport(reader: &FrameReader<'_>, offset: usize, protocol: u8, header: &mut PacketHeader) {
    match protocol {
        layout::PROTO_TCP => {
            if reader.require_len(offset + layout::TCP_MIN_HEADER_LEN).is_err() {
                return;
            }
            let (Ok(src_port), Ok(dst_port), Ok(flags)) = (
                reader.read_u16_be(offset),
                reader.read_u16_be(offset + 2),
                reader.read_u8(offset + layout::TCP_FLAGS_OFFSET),
            ) else {
                return;
            };
            header.src_port = src_port;
            header.dst_port = dst_port;
            header.tcp_flags = flags;
            if src_port == layout::PORT_DNS || dst_port == layout::PORT_DNS {
                header.is_dns = true;
            }
        }
        layout::PROTO_UDP => {
            if reader.require_len(offset + layout::UDP_HEADER_LEN).is_err() {
                return;
            }
            let (Ok(src_port), Ok(dst_port)) =
                (reader.read_u16_be(offset), reader.read_u16_be(offset + 2))
            else {
                return;
            };
            header.src_port = src_port;
            header.dst_port = dst_port;
            let dns_port = |p: u16| p == layout::PORT_DNS || p == layout::PORT_MDNS;
            if dns_port(src_port) || dns_port(dst_port) {
                header.is_dns = true;
            }
        }
        _ => {}
    }
}

/// 32-bit FNV-1a, used to fold IPv6 addresses into the u32 flow-key space.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = layout::FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(layout::FNV_PRIME);
    }
    hash
}
