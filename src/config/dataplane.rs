//! Data-plane tunables

use std::time::Duration;

use super::InterfaceConfig;

/// Default tunnel MTU
pub const DEFAULT_MTU: usize = 1420;

/// Packets held per peer while no session exists
pub const MAX_STAGED_PACKETS: usize = 128;

/// Packets per peer waiting in a reorder queue
pub const MAX_QUEUED_PACKETS: usize = 1024;

/// Handshake messages waiting for the handshake worker
pub const MAX_QUEUED_HANDSHAKES: usize = 4096;

/// Hard cap on configured peers
pub const MAX_PEERS: usize = 1 << 20;

/// Sizing and load policy for a [`crate::device::Device`]
#[derive(Debug, Clone)]
pub struct DataplaneConfig {
    pub mtu: usize,
    pub max_staged_packets: usize,
    pub max_queued_packets: usize,
    /// Encryption and decryption workers each
    pub crypto_workers: usize,
    pub max_queued_handshakes: usize,
    /// Handshake queue depth at which the device counts as under load.
    /// Zero means always under load.
    pub under_load_threshold: usize,
    /// How long the under-load state persists after the queue drains
    pub under_load_hold: Duration,
    pub max_peers: usize,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            mtu: DEFAULT_MTU,
            max_staged_packets: MAX_STAGED_PACKETS,
            max_queued_packets: MAX_QUEUED_PACKETS,
            crypto_workers: workers,
            max_queued_handshakes: MAX_QUEUED_HANDSHAKES,
            under_load_threshold: MAX_QUEUED_HANDSHAKES / 8,
            under_load_hold: Duration::from_secs(1),
            max_peers: MAX_PEERS,
        }
    }
}

impl DataplaneConfig {
    /// Defaults, with the MTU taken from the interface section when set
    pub fn from_interface(interface: &InterfaceConfig) -> Self {
        let mut config = Self::default();
        if let Some(mtu) = interface.mtu {
            config.mtu = mtu as usize;
        }
        config
    }
}
