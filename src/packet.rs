//! Minimal IP header inspection for routing and trimming plaintext packets

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// IP version nibble of the first byte
pub fn version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

fn read_v4(packet: &[u8], offset: usize) -> IpAddr {
    let mut ip = [0u8; 4];
    ip.copy_from_slice(&packet[offset..offset + 4]);
    IpAddr::V4(Ipv4Addr::from(ip))
}

fn read_v6(packet: &[u8], offset: usize) -> IpAddr {
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&packet[offset..offset + 16]);
    IpAddr::V6(Ipv6Addr::from(ip))
}

pub fn source_address(packet: &[u8]) -> Option<IpAddr> {
    match version(packet)? {
        4 if packet.len() >= IPV4_MIN_HEADER => Some(read_v4(packet, 12)),
        6 if packet.len() >= IPV6_HEADER => Some(read_v6(packet, 8)),
        _ => None,
    }
}

pub fn destination_address(packet: &[u8]) -> Option<IpAddr> {
    match version(packet)? {
        4 if packet.len() >= IPV4_MIN_HEADER => Some(read_v4(packet, 16)),
        6 if packet.len() >= IPV6_HEADER => Some(read_v6(packet, 24)),
        _ => None,
    }
}

/// Length the IP header claims for the whole packet
pub fn total_length(packet: &[u8]) -> Option<usize> {
    match version(packet)? {
        4 if packet.len() >= IPV4_MIN_HEADER => {
            Some(u16::from_be_bytes([packet[2], packet[3]]) as usize)
        }
        6 if packet.len() >= IPV6_HEADER => {
            Some(IPV6_HEADER + u16::from_be_bytes([packet[4], packet[5]]) as usize)
        }
        _ => None,
    }
}

/// Strip transport padding from a decrypted packet. Returns `None` when the
/// header is malformed or claims more bytes than were received.
pub fn trim_padding(mut packet: Vec<u8>) -> Option<Vec<u8>> {
    let len = total_length(&packet)?;
    if len > packet.len() || len < IPV4_MIN_HEADER {
        return None;
    }
    packet.truncate(len);
    Some(packet)
}

/// Build a UDP-typed IP packet around `payload`. IPv6 is used whenever
/// either address is IPv6.
pub fn build_packet(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total = IPV4_MIN_HEADER + payload.len();
            let mut pkt = vec![0u8; IPV4_MIN_HEADER];
            pkt[0] = 0x45;
            pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            pkt[8] = 64;
            pkt[9] = 17;
            pkt[12..16].copy_from_slice(&src.octets());
            pkt[16..20].copy_from_slice(&dst.octets());
            pkt.extend_from_slice(payload);
            pkt
        }
        (src, dst) => {
            let to_v6 = |ip: IpAddr| match ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let mut pkt = vec![0u8; IPV6_HEADER];
            pkt[0] = 0x60;
            pkt[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            pkt[6] = 17;
            pkt[7] = 64;
            pkt[8..24].copy_from_slice(&to_v6(src).octets());
            pkt[24..40].copy_from_slice(&to_v6(dst).octets());
            pkt.extend_from_slice(payload);
            pkt
        }
    }
}
