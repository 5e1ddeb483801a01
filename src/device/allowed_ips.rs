//! Allowed-IP routing table
//!
//! One Patricia trie per address family, keyed by the prefix's bit string.
//! Longest-prefix match picks the peer for outbound packets and validates
//! the source of decrypted inbound packets.

use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;
use patricia_tree::PatriciaMap;

use super::PeerId;
use crate::packet;

/// Which header address a lookup matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Decrypted inbound packet: match the source
    In,
    /// Outbound plaintext: match the destination
    Out,
}

#[derive(Debug, Clone)]
struct Route {
    peer: PeerId,
    net: IpNet,
}

/// Converts an address into a binary string ("1100...") of its first `prefix` bits.
/// Keys carry a leading marker so the default route is never the empty key.
fn bit_key(addr: IpAddr, prefix: u8) -> String {
    let value = match addr {
        IpAddr::V4(ip) => u128::from(u32::from(ip)) << 96,
        IpAddr::V6(ip) => u128::from(ip),
    };
    let width = if addr.is_ipv4() { 32 } else { 128 };
    let bits = (prefix as usize).min(width);
    let mut key = String::with_capacity(1 + bits);
    key.push('v');
    for i in 0..bits {
        key.push(if value & (1u128 << (127 - i)) != 0 { '1' } else { '0' });
    }
    key
}

fn net_key(net: &IpNet) -> String {
    bit_key(net.network(), net.prefix_len())
}

#[derive(Default)]
pub struct AllowedIps {
    ipv4: RwLock<PatriciaMap<Route>>,
    ipv6: RwLock<PatriciaMap<Route>>,
}

impl AllowedIps {
    pub fn new() -> Self {
        Self {
            ipv4: RwLock::new(PatriciaMap::new()),
            ipv6: RwLock::new(PatriciaMap::new()),
        }
    }

    fn table(&self, addr: &IpAddr) -> &RwLock<PatriciaMap<Route>> {
        if addr.is_ipv4() {
            &self.ipv4
        } else {
            &self.ipv6
        }
    }

    /// Assign `net` (host bits masked) to `peer`. Returns the previous owner
    /// when ownership moved.
    pub fn insert(&self, net: IpNet, peer: PeerId) -> Option<PeerId> {
        let net = net.trunc();
        let previous = self
            .table(&net.addr())
            .write()
            .insert(net_key(&net), Route { peer, net });
        previous.map(|route| route.peer).filter(|&owner| owner != peer)
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<PeerId> {
        let full_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let key = bit_key(addr, full_prefix);
        self.table(&addr)
            .read()
            .get_longest_common_prefix(&key)
            .map(|(_, route)| route.peer)
    }

    pub fn lookup_packet(&self, packet: &[u8], direction: Direction) -> Option<PeerId> {
        let addr = match direction {
            Direction::In => packet::source_address(packet)?,
            Direction::Out => packet::destination_address(packet)?,
        };
        self.lookup(addr)
    }

    /// Remove `net` if `peer` still owns it
    pub fn remove(&self, net: IpNet, peer: PeerId) -> bool {
        let net = net.trunc();
        let key = net_key(&net);
        let mut table = self.table(&net.addr()).write();
        match table.get(&key) {
            Some(route) if route.peer == peer => {
                table.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Walk both tries and drop every prefix `peer` owns
    pub fn remove_by_peer(&self, peer: PeerId) -> usize {
        let mut removed = 0;
        for table in [&self.ipv4, &self.ipv6] {
            let mut table = table.write();
            let keys: Vec<Vec<u8>> = table
                .iter()
                .filter(|(_, route)| route.peer == peer)
                .map(|(key, _)| key)
                .collect();
            for key in keys {
                table.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn entries_for(&self, peer: PeerId) -> Vec<IpNet> {
        let mut nets = Vec::new();
        for table in [&self.ipv4, &self.ipv6] {
            nets.extend(
                table
                    .read()
                    .values()
                    .filter(|route| route.peer == peer)
                    .map(|route| route.net),
            );
        }
        nets
    }

    pub fn clear(&self) {
        self.ipv4.write().clear();
        self.ipv6.write().clear();
    }

    pub fn len(&self) -> usize {
        self.ipv4.read().len() + self.ipv6.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_longest_prefix_match() {
        let table = AllowedIps::new();
        table.insert(net("0.0.0.0/0"), PeerId(1));
        table.insert(net("10.0.0.0/8"), PeerId(2));
        table.insert(net("10.1.0.0/16"), PeerId(3));
        table.insert(net("10.1.2.3/32"), PeerId(4));

        assert_eq!(table.lookup(ip("8.8.8.8")), Some(PeerId(1)));
        assert_eq!(table.lookup(ip("10.200.0.1")), Some(PeerId(2)));
        assert_eq!(table.lookup(ip("10.1.9.9")), Some(PeerId(3)));
        assert_eq!(table.lookup(ip("10.1.2.3")), Some(PeerId(4)));
        assert_eq!(table.lookup(ip("fd00::1")), None);
    }

    #[test]
    fn test_ipv6_and_host_bits_masked() {
        let table = AllowedIps::new();
        table.insert(net("fd00:1::77/64"), PeerId(9));
        assert_eq!(table.lookup(ip("fd00:1::1")), Some(PeerId(9)));
        assert_eq!(table.lookup(ip("fd00:2::1")), None);
        assert_eq!(table.entries_for(PeerId(9)), vec![net("fd00:1::/64")]);
    }

    #[test]
    fn test_ownership_replaced() {
        let table = AllowedIps::new();
        assert_eq!(table.insert(net("192.168.0.0/24"), PeerId(1)), None);
        assert_eq!(table.insert(net("192.168.0.0/24"), PeerId(1)), None);
        assert_eq!(table.insert(net("192.168.0.0/24"), PeerId(2)), Some(PeerId(1)));
        assert_eq!(table.lookup(ip("192.168.0.5")), Some(PeerId(2)));

        // Stale owner cannot remove the prefix
        assert!(!table.remove(net("192.168.0.0/24"), PeerId(1)));
        assert!(table.remove(net("192.168.0.0/24"), PeerId(2)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_by_peer() {
        let table = AllowedIps::new();
        table.insert(net("10.0.0.0/24"), PeerId(1));
        table.insert(net("fd00::/64"), PeerId(1));
        table.insert(net("10.0.1.0/24"), PeerId(2));

        assert_eq!(table.remove_by_peer(PeerId(1)), 2);
        assert_eq!(table.lookup(ip("10.0.0.1")), None);
        assert_eq!(table.lookup(ip("fd00::1")), None);
        assert_eq!(table.lookup(ip("10.0.1.1")), Some(PeerId(2)));
    }

    #[test]
    fn test_bit_key_layout() {
        assert_eq!(bit_key(ip("192.168.1.1"), 8), "v11000000");
        assert_eq!(bit_key(ip("10.0.0.1"), 32), format!("v00001010{}1", "0".repeat(23)));
        assert_eq!(bit_key(ip("8000::"), 3), "v100");
        assert_eq!(bit_key(ip("0.0.0.0"), 0), "v");
        assert_eq!(bit_key(ip("::1"), 128).len(), 129);
    }

    #[test]
    fn test_packet_direction() {
        let table = AllowedIps::new();
        table.insert(net("10.0.0.1/32"), PeerId(1));
        table.insert(net("10.0.0.2/32"), PeerId(2));
        let pkt = packet::build_packet(ip("10.0.0.1"), ip("10.0.0.2"), b"x");
        assert_eq!(table.lookup_packet(&pkt, Direction::In), Some(PeerId(1)));
        assert_eq!(table.lookup_packet(&pkt, Direction::Out), Some(PeerId(2)));
        assert_eq!(table.lookup_packet(&[0u8; 3], Direction::Out), None);
    }
}
