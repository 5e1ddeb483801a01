//! SecureGuard - WireGuard data plane
//!
//! A userspace implementation of the WireGuard data plane: Noise IKpsk2
//! handshakes, session keypair rotation, an ordered multi-worker
//! encryption/decryption pipeline, replay protection, cookie-based DoS
//! mitigation and cryptokey routing over allowed IPs.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use secureguard::device::UdpTransport;
//! use secureguard::tunnel::TunDevice;
//! use secureguard::{DataplaneConfig, Device, WireGuardConfig};
//!
//! #[tokio::main]
//! async fn main() -> secureguard::error::Result<()> {
//!     let config = WireGuardConfig::from_file("wg0.conf")?;
//!     let dataplane = DataplaneConfig::from_interface(&config.interface);
//!     let transport = Arc::new(UdpTransport::bind(config.interface.listen_port.unwrap_or(0))?);
//!     let tun = Arc::new(TunDevice::create(&config.interface.address, dataplane.mtu as u16)?);
//!
//!     let device = Device::new(dataplane, transport, tun);
//!     device.apply_config(&config).await?;
//!     device.up().await;
//!     device.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod tunnel;

pub use config::{DataplaneConfig, PeerConfig, WireGuardConfig};
pub use device::{Device, DeviceStats, PeerId, PeerStats};
pub use error::SecureGuardError;
pub use protocol::session::PeerState;
