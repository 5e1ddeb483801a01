//! TUN device adapter
//!
//! The host side of the data plane: plaintext IP packets read from the TUN
//! device go to [`crate::device::Device::encapsulate`], and packets the
//! device decrypts are written back through [`PacketSink`].

use std::net::IpAddr;
use std::ops::Deref;

use async_trait::async_trait;
use ipnet::IpNet;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::device::PacketSink;
use crate::error::{SecureGuardError, TunnelError};

/// Async TUN device wrapper
pub struct TunDevice {
    device: AsyncDevice,
    /// Device name (e.g. "utun5", "tun0")
    name: String,
}

impl TunDevice {
    /// Create a TUN device carrying the interface addresses. At most one
    /// IPv4 and one IPv6 address are assigned; extra ones are ignored.
    pub fn create(addresses: &[IpNet], mtu: u16) -> Result<Self, SecureGuardError> {
        check_privileges()?;

        let mut builder = DeviceBuilder::new().mtu(mtu);
        let mut v4_set = false;
        let mut v6_set = false;
        for net in addresses {
            match net.addr() {
                IpAddr::V4(addr) if !v4_set => {
                    builder = builder.ipv4(addr, net.prefix_len(), None);
                    v4_set = true;
                }
                IpAddr::V6(addr) if !v6_set => {
                    builder = builder.ipv6(addr, net.prefix_len());
                    v6_set = true;
                }
                _ => tracing::warn!("Ignoring extra interface address {}", net),
            }
        }

        let device = builder
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("Failed to get device name: {}", e),
            })?;

        tracing::info!("Created TUN device: {} (mtu {})", name, mtu);
        Ok(Self { device, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one packet from the host
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.device
            .recv(buf)
            .await
            .map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            })
    }

    /// Write one packet to the host
    pub async fn write(&self, packet: &[u8]) -> Result<usize, TunnelError> {
        self.device
            .send(packet)
            .await
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl PacketSink for TunDevice {
    async fn deliver(&self, packet: Vec<u8>) -> Result<(), TunnelError> {
        self.write(&packet).await.map(|_| ())
    }
}

/// Check for the privileges needed to create TUN devices
fn check_privileges() -> Result<(), SecureGuardError> {
    #[cfg(unix)]
    {
        // Root or CAP_NET_ADMIN
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // Capabilities are not inspected; creation fails with a clear error
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./secureguard");
            }

            #[cfg(not(target_os = "linux"))]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required. Run with sudo.".to_string(),
                }
                .into());
            }
        }
    }

    Ok(())
}
