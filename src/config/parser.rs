//! WireGuard configuration file parser
//!
//! Parses standard WireGuard `.conf` files with [Interface] and [Peer] sections.

use std::net::SocketAddr;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::error::ConfigError;

/// Complete WireGuard configuration
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    /// Interface configuration (our side)
    pub interface: InterfaceConfig,
    /// Peer configurations
    pub peers: Vec<PeerConfig>,
}

/// Interface (local) configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Our private key (32 bytes)
    pub private_key: [u8; 32],
    /// Tunnel addresses with prefix, IPv4 and IPv6
    pub address: Vec<IpNet>,
    /// Listen port (optional, random when unset)
    pub listen_port: Option<u16>,
    /// MTU (optional, default 1420)
    pub mtu: Option<u16>,
}

/// Peer configuration
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's public key (32 bytes)
    pub public_key: [u8; 32],
    /// Pre-shared key (optional, 32 bytes)
    pub preshared_key: Option<[u8; 32]>,
    /// Peer's endpoint (IP:port)
    pub endpoint: Option<SocketAddr>,
    /// Allowed IP ranges for this peer
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds; `None` when off
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// A peer with no endpoint, routes or keepalive
    pub fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_allowed_ips(mut self, allowed_ips: Vec<IpNet>) -> Self {
        self.allowed_ips = allowed_ips;
        self
    }

    pub fn with_preshared_key(mut self, psk: [u8; 32]) -> Self {
        self.preshared_key = Some(psk);
        self
    }
}

impl WireGuardConfig {
    /// Parse a WireGuard configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a WireGuard configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut interface: Option<InterfaceBuilder> = None;
        let mut peers = Vec::new();
        let mut section: Option<Section> = None;

        for (index, raw) in content.lines().enumerate() {
            let line_num = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') {
                if let Some(Section::Peer(peer)) = section.take() {
                    peers.push(peer.build()?);
                }
                section = Some(match line.to_ascii_lowercase().as_str() {
                    "[interface]" => Section::Interface,
                    "[peer]" => Section::Peer(PeerBuilder::default()),
                    _ => {
                        return Err(ConfigError::ParseError {
                            line: line_num,
                            message: format!("Unknown section {}", line),
                        })
                    }
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match section.as_mut() {
                Some(Section::Interface) => interface
                    .get_or_insert_with(InterfaceBuilder::default)
                    .apply(&key, value, line_num)?,
                Some(Section::Peer(peer)) => peer.apply(&key, value, line_num)?,
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    })
                }
            }
        }

        if let Some(Section::Peer(peer)) = section {
            peers.push(peer.build()?);
        }

        let interface = interface
            .ok_or(ConfigError::MissingField {
                field: "[Interface] section".to_string(),
            })?
            .build()?;

        Ok(WireGuardConfig { interface, peers })
    }

    /// Get our public key derived from the private key
    pub fn public_key(&self) -> [u8; 32] {
        crate::crypto::x25519::public_key(&self.interface.private_key)
    }
}

/// Section being parsed; a peer section carries its partial peer
enum Section {
    Interface,
    Peer(PeerBuilder),
}

#[derive(Default)]
struct InterfaceBuilder {
    private_key: Option<[u8; 32]>,
    address: Vec<IpNet>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
}

impl InterfaceBuilder {
    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "privatekey" => self.private_key = Some(parse_key(value, "PrivateKey")?),
            "address" => self.address.extend(parse_cidrs(value)?),
            "listenport" => self.listen_port = Some(parse_number(value, "ListenPort", line)?),
            "mtu" => self.mtu = Some(parse_number(value, "MTU", line)?),
            // Unknown keys are ignored for forward compatibility
            _ => tracing::debug!("Unknown interface key: {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<InterfaceConfig, ConfigError> {
        let private_key = self
            .private_key
            .filter(|key| *key != [0u8; 32])
            .ok_or(ConfigError::MissingField {
                field: "PrivateKey".to_string(),
            })?;
        Ok(InterfaceConfig {
            private_key,
            address: self.address,
            listen_port: self.listen_port,
            mtu: self.mtu,
        })
    }
}

#[derive(Default)]
struct PeerBuilder {
    public_key: Option<[u8; 32]>,
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

impl PeerBuilder {
    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<(), ConfigError> {
        match key {
            "publickey" => self.public_key = Some(parse_key(value, "PublicKey")?),
            "presharedkey" => self.preshared_key = Some(parse_key(value, "PresharedKey")?),
            "endpoint" => self.endpoint = Some(parse_endpoint(value)?),
            "allowedips" => self.allowed_ips.extend(parse_cidrs(value)?),
            "persistentkeepalive" if value.eq_ignore_ascii_case("off") => {
                self.persistent_keepalive = None;
            }
            "persistentkeepalive" => {
                let secs: u16 = parse_number(value, "PersistentKeepalive", line)?;
                self.persistent_keepalive = (secs > 0).then_some(secs);
            }
            _ => tracing::debug!("Unknown peer key: {}", key),
        }
        Ok(())
    }

    fn build(self) -> Result<PeerConfig, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::MissingField {
            field: "PublicKey in [Peer]".to_string(),
        })?;
        Ok(PeerConfig {
            public_key,
            preshared_key: self.preshared_key,
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        })
    }
}

/// Parse a base64-encoded 32-byte key
pub fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let invalid = || ConfigError::InvalidKey {
        field: field_name.to_string(),
    };
    let bytes = BASE64.decode(value).map_err(|_| invalid())?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| invalid())
}

/// Comma-separated CIDR list; empty items are skipped
fn parse_cidrs(value: &str) -> Result<Vec<IpNet>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse().map_err(|_| ConfigError::InvalidCidr {
                value: item.to_string(),
            })
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str, line: usize) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid {}: {}", field, value),
    })
}

/// Only literal IP:port endpoints are accepted; hostnames are not resolved
fn parse_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}
