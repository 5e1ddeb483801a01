//! Device and peer counters

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use ipnet::IpNet;

use crate::protocol::session::PeerState;

/// Snapshot of the device-wide drop and traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub handshakes_dropped: u64,
    pub cookie_replies_sent: u64,
    pub no_route: u64,
    pub no_endpoint: u64,
    pub unknown_index: u64,
    pub decrypt_failed: u64,
    pub replays: u64,
    pub spoofed: u64,
    pub queue_overflow: u64,
    pub malformed: u64,
    /// Packets dropped by the pipeline because the interface went down
    pub interface_down: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DeviceCounters {
    pub tx_packets: AtomicU64,
    pub rx_packets: AtomicU64,
    pub handshakes_dropped: AtomicU64,
    pub cookie_replies_sent: AtomicU64,
    pub no_route: AtomicU64,
    pub no_endpoint: AtomicU64,
    pub unknown_index: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub replays: AtomicU64,
    pub spoofed: AtomicU64,
    pub queue_overflow: AtomicU64,
    pub malformed: AtomicU64,
    pub interface_down: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DeviceCounters {
    pub fn snapshot(&self) -> DeviceStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeviceStats {
            tx_packets: get(&self.tx_packets),
            rx_packets: get(&self.rx_packets),
            handshakes_dropped: get(&self.handshakes_dropped),
            cookie_replies_sent: get(&self.cookie_replies_sent),
            no_route: get(&self.no_route),
            no_endpoint: get(&self.no_endpoint),
            unknown_index: get(&self.unknown_index),
            decrypt_failed: get(&self.decrypt_failed),
            replays: get(&self.replays),
            spoofed: get(&self.spoofed),
            queue_overflow: get(&self.queue_overflow),
            malformed: get(&self.malformed),
            interface_down: get(&self.interface_down),
        }
    }
}

/// What the configuration plane can read back about one peer
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub public_key: [u8; 32],
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_handshake: Option<SystemTime>,
    pub state: PeerState,
}
