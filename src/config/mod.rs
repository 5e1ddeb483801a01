//! Configuration for WireGuard
//!
//! This module handles parsing of standard WireGuard `.conf` configuration
//! files and the data-plane tunables.

mod dataplane;
mod parser;

pub use dataplane::{
    DataplaneConfig, DEFAULT_MTU, MAX_PEERS, MAX_QUEUED_HANDSHAKES, MAX_QUEUED_PACKETS,
    MAX_STAGED_PACKETS,
};
pub use parser::{parse_key, InterfaceConfig, PeerConfig, WireGuardConfig};
