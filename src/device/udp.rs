//! Network-facing seams of the device
//!
//! [`DatagramTransport`] carries encrypted datagrams to and from peers and
//! [`PacketSink`] receives decrypted plaintext. [`UdpTransport`] is the
//! production transport: one IPv4 and one IPv6 socket sharing a port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::error::{NetworkError, TunnelError};

/// Largest datagram we read off the wire
pub const MAX_DATAGRAM: usize = 65535;

/// Where a peer was last reached, plus the local address that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: SocketAddr,
    /// Local address hint for transports that can report the address a
    /// packet arrived on. [`UdpTransport`] never sets it and lets the kernel
    /// choose the source address.
    pub local: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, local: None }
    }

    pub fn with_local(addr: SocketAddr, local: IpAddr) -> Self {
        Self {
            addr,
            local: Some(local),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

#[async_trait]
pub trait DatagramTransport: Send + Sync + 'static {
    async fn send(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), NetworkError>;

    async fn recv(&self) -> Result<(Vec<u8>, Endpoint), NetworkError>;

    fn local_port(&self) -> u16;
}

/// Destination for decrypted, validated plaintext packets
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn deliver(&self, packet: Vec<u8>) -> Result<(), TunnelError>;
}

fn bind_socket(domain: Domain, addr: SocketAddr) -> Result<UdpSocket, NetworkError> {
    let bind_failed = |e: std::io::Error| NetworkError::BindFailed {
        addr: addr.to_string(),
        reason: e.to_string(),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_failed)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true).map_err(bind_failed)?;
    }
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    UdpSocket::from_std(socket.into()).map_err(bind_failed)
}

/// Dual-stack UDP transport
pub struct UdpTransport {
    v4: UdpSocket,
    v6: Option<UdpSocket>,
    port: u16,
    /// Receive buffers for the IPv4 and IPv6 sockets, reused across reads
    recv_bufs: tokio::sync::Mutex<(Vec<u8>, Vec<u8>)>,
}

impl UdpTransport {
    /// Bind on `port` (0 picks one). IPv6 is best-effort.
    pub fn bind(port: u16) -> Result<Self, NetworkError> {
        let v4 = bind_socket(
            Domain::IPV4,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        )?;
        let port = v4.local_addr()?.port();

        let v6 = match bind_socket(
            Domain::IPV6,
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        ) {
            Ok(socket) => Some(socket),
            Err(e) => {
                warn!("IPv6 socket unavailable, continuing with IPv4 only: {}", e);
                None
            }
        };

        info!("Listening on UDP port {}", port);
        Ok(Self {
            v4,
            v6,
            port,
            recv_bufs: tokio::sync::Mutex::new((vec![0u8; MAX_DATAGRAM], vec![0u8; MAX_DATAGRAM])),
        })
    }

    fn socket_for(&self, addr: &SocketAddr) -> Result<&UdpSocket, NetworkError> {
        match addr {
            SocketAddr::V4(_) => Ok(&self.v4),
            SocketAddr::V6(_) => self.v6.as_ref().ok_or(NetworkError::NoSocketForFamily {
                addr: addr.to_string(),
            }),
        }
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, endpoint: &Endpoint, data: &[u8]) -> Result<(), NetworkError> {
        self.socket_for(&endpoint.addr)?
            .send_to(data, endpoint.addr)
            .await
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, Endpoint), NetworkError> {
        let mut bufs = self.recv_bufs.lock().await;
        let (buf4, buf6) = &mut *bufs;

        let (result, from_v6) = match &self.v6 {
            Some(v6) => tokio::select! {
                r = self.v4.recv_from(buf4) => (r, false),
                r = v6.recv_from(buf6) => (r, true),
            },
            None => (self.v4.recv_from(buf4).await, false),
        };
        let (len, from) = result.map_err(|e| NetworkError::ReceiveFailed {
            reason: e.to_string(),
        })?;

        let data = if from_v6 { &buf6[..len] } else { &buf4[..len] };
        Ok((data.to_vec(), Endpoint::new(from)))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}
