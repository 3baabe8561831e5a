//! Just enough link-layer and IP decoding to attribute a frame to a flow.

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice};
use std::net::IpAddr;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const VLAN_TAG_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const NULL_HEADER_LEN: usize = 4;
const IPV6_HEADER_LEN: u16 = 40;

/// Framing of the bytes handed over by the capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Bare IPv4/IPv6 packet, version taken from the first nibble.
    RawIp,
    /// BSD loopback: 4-byte address family, then IP.
    Null,
    /// Linux cooked capture (SLL).
    LinuxSll,
    Unsupported(i32),
}

impl LinkLayer {
    /// Maps a pcap `DLT_*` / `LINKTYPE_*` code.
    pub fn from_dlt(code: i32) -> Self {
        match code {
            1 => LinkLayer::Ethernet,
            12 | 14 | 101 | 228 | 229 => LinkLayer::RawIp,
            0 | 108 => LinkLayer::Null,
            113 => LinkLayer::LinuxSll,
            other => LinkLayer::Unsupported(other),
        }
    }
}

/// What one IP packet contributes to a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSummary {
    pub source: IpAddr,
    pub destination: IpAddr,
    /// Header plus payload as declared by the IP header.
    pub total_length: u16,
}

/// Returns `None` for anything without a readable IP header.
pub fn decode_frame(link: LinkLayer, data: &[u8]) -> Option<PacketSummary> {
    match link {
        LinkLayer::Ethernet => decode_ethernet(data),
        LinkLayer::RawIp => decode_ip(data),
        LinkLayer::Null => decode_ip(data.get(NULL_HEADER_LEN..)?),
        LinkLayer::LinuxSll => {
            let proto = u16::from_be_bytes([*data.get(14)?, *data.get(15)?]);
            decode_by_ethertype(proto, data.get(SLL_HEADER_LEN..)?)
        }
        LinkLayer::Unsupported(_) => None,
    }
}

fn decode_ethernet(data: &[u8]) -> Option<PacketSummary> {
    let eth = Ethernet2HeaderSlice::from_slice(data).ok()?;
    let payload = &data[eth.slice().len()..];
    let ether_type = u16::from(eth.ether_type());

    if ether_type == ETHERTYPE_VLAN {
        let inner = u16::from_be_bytes([*payload.get(2)?, *payload.get(3)?]);
        return decode_by_ethertype(inner, payload.get(VLAN_TAG_LEN..)?);
    }
    decode_by_ethertype(ether_type, payload)
}

fn decode_by_ethertype(ether_type: u16, payload: &[u8]) -> Option<PacketSummary> {
    match ether_type {
        ETHERTYPE_IPV4 => decode_ipv4(payload),
        ETHERTYPE_IPV6 => decode_ipv6(payload),
        _ => None,
    }
}

fn decode_ip(payload: &[u8]) -> Option<PacketSummary> {
    match payload.first()? >> 4 {
        4 => decode_ipv4(payload),
        6 => decode_ipv6(payload),
        _ => None,
    }
}

fn decode_ipv4(payload: &[u8]) -> Option<PacketSummary> {
    let ip = Ipv4HeaderSlice::from_slice(payload).ok()?;
    Some(PacketSummary {
        source: IpAddr::V4(ip.source_addr()),
        destination: IpAddr::V4(ip.destination_addr()),
        total_length: ip.total_len(),
    })
}

fn decode_ipv6(payload: &[u8]) -> Option<PacketSummary> {
    let ip = Ipv6HeaderSlice::from_slice(payload).ok()?;
    Some(PacketSummary {
        source: IpAddr::V6(ip.source_addr()),
        destination: IpAddr::V6(ip.destination_addr()),
        total_length: IPV6_HEADER_LEN.saturating_add(ip.payload_length()),
    })
}
