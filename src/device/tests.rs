//! Two-device scenarios over an in-memory network.
//!
//! Each device sends into a channel instead of a socket; the test decides
//! which datagrams reach the other side and when.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::config::PeerConfig;
use crate::crypto::x25519;
use crate::error::TunnelError;
use crate::packet;
use crate::protocol::messages::TransportHeader;

struct ChannelTransport {
    port: u16,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl DatagramTransport for ChannelTransport {
    async fn send(&self, _endpoint: &Endpoint, data: &[u8]) -> Result<(), NetworkError> {
        let _ = self.outbox.send(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<(Vec<u8>, Endpoint), NetworkError> {
        std::future::pending().await
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

#[async_trait]
impl PacketSink for ChannelSink {
    async fn deliver(&self, packet: Vec<u8>) -> Result<(), TunnelError> {
        let _ = self.0.send(packet);
        Ok(())
    }
}

struct Node {
    device: Device,
    public: [u8; 32],
    addr: SocketAddr,
    tunnel_ip: IpAddr,
    wire: mpsc::UnboundedReceiver<Vec<u8>>,
    delivered: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Node {
    async fn new(n: u8, config: DataplaneConfig) -> Self {
        let (outbox, wire) = mpsc::unbounded_channel();
        let (sink_tx, delivered) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport {
            port: 51820,
            outbox,
        });
        let device = Device::new(config, transport, Arc::new(ChannelSink(sink_tx)));
        let (private, public) = x25519::generate_keypair();
        device.set_keys(private).await.unwrap();
        Self {
            device,
            public,
            addr: SocketAddr::new(IpAddr::from([192, 0, 2, n]), 51820),
            tunnel_ip: IpAddr::from([10, 0, 0, n]),
            wire,
            delivered,
        }
    }

    async fn add_peer(&self, other: &Node) {
        let config = PeerConfig::new(other.public)
            .with_endpoint(other.addr)
            .with_allowed_ips(vec![IpNet::from(other.tunnel_ip)]);
        self.device.peer_add(config).await.unwrap();
    }

    /// Next datagram this node put on the wire
    async fn sent(&mut self) -> Vec<u8> {
        timeout(Duration::from_secs(5), self.wire.recv())
            .await
            .expect("timed out waiting for a datagram")
            .expect("transport closed")
    }

    async fn received(&mut self) -> Vec<u8> {
        timeout(Duration::from_secs(5), self.delivered.recv())
            .await
            .expect("timed out waiting for a delivered packet")
            .expect("sink closed")
    }

    fn packet_to(&self, other: &Node, payload: &[u8]) -> Vec<u8> {
        packet::build_packet(self.tunnel_ip, other.tunnel_ip, payload)
    }
}

/// Hand a datagram from `from` to `to`
fn carry(from: &Node, to: &Node, datagram: Vec<u8>) {
    to.device.decapsulate(datagram, Endpoint::new(from.addr));
}

fn message_type(datagram: &[u8]) -> u32 {
    u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]])
}

fn receiver_index(datagram: &[u8]) -> u32 {
    u32::from_le_bytes([datagram[4], datagram[5], datagram[6], datagram[7]])
}

fn counter(datagram: &[u8]) -> u64 {
    TransportHeader::from_bytes(datagram).unwrap().counter
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn workers(count: usize) -> DataplaneConfig {
    DataplaneConfig {
        crypto_workers: count,
        ..DataplaneConfig::default()
    }
}

async fn pair(config_a: DataplaneConfig, config_b: DataplaneConfig) -> (Node, Node) {
    let a = Node::new(1, config_a).await;
    let b = Node::new(2, config_b).await;
    a.add_peer(&b).await;
    b.add_peer(&a).await;
    a.device.up().await;
    b.device.up().await;
    (a, b)
}

/// Full handshake with `a` as initiator, ending with both sides active
async fn establish(a: &mut Node, b: &mut Node) {
    a.device.initiate_handshake(&b.public).await.unwrap();
    let initiation = a.sent().await;
    assert_eq!(message_type(&initiation), 1);
    carry(a, b, initiation);

    let response = b.sent().await;
    assert_eq!(message_type(&response), 2);
    carry(b, a, response);

    let keepalive = a.sent().await;
    assert_eq!(message_type(&keepalive), 4);
    assert_eq!(keepalive.len(), TransportHeader::MIN_SIZE);
    carry(a, b, keepalive);

    let (a_key, b_key) = (a.public, b.public);
    wait_for(|| b.device.peer_state(&a_key) == Some(PeerState::SessionActive)).await;
    assert_eq!(a.device.peer_state(&b_key), Some(PeerState::SessionActive));
}

#[tokio::test]
async fn test_handshake_and_bidirectional_data() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let ping = a.packet_to(&b, b"ping");
    a.device.encapsulate(ping.clone()).await.unwrap();
    let datagram = a.sent().await;
    assert_eq!(datagram.len() % 16, 0);
    carry(&a, &b, datagram);
    assert_eq!(b.received().await, ping);

    let pong = b.packet_to(&a, b"pong");
    b.device.encapsulate(pong.clone()).await.unwrap();
    let datagram = b.sent().await;
    carry(&b, &a, datagram);
    assert_eq!(a.received().await, pong);

    let stats = a.device.peer_stats(&b.public).unwrap();
    assert!(stats.tx_bytes > 0);
    assert!(stats.rx_bytes > 0);
    assert!(stats.last_handshake.is_some());
    assert_eq!(stats.endpoint, Some(b.addr));
    assert_eq!(stats.allowed_ips, vec![IpNet::from(b.tunnel_ip)]);
}

#[tokio::test]
async fn test_staged_packets_flush_after_handshake() {
    let (mut a, mut b) = pair(workers(1), workers(1)).await;

    // No session yet: the packet waits and a handshake starts
    let first = a.packet_to(&b, b"first");
    a.device.encapsulate(first.clone()).await.unwrap();
    assert_eq!(a.device.peer_state(&b.public), Some(PeerState::HandshakeInitiated));

    let initiation = a.sent().await;
    assert_eq!(message_type(&initiation), 1);
    carry(&a, &b, initiation);
    let response = b.sent().await;
    carry(&b, &a, response);

    // The staged packet confirms the session instead of a keepalive
    let data = a.sent().await;
    assert_eq!(message_type(&data), 4);
    assert!(data.len() > TransportHeader::MIN_SIZE);
    carry(&a, &b, data);
    assert_eq!(b.received().await, first);
}

#[tokio::test]
async fn test_parallel_encryption_preserves_order() {
    let (mut a, mut b) = pair(workers(4), workers(4)).await;
    establish(&mut a, &mut b).await;

    let packets: Vec<Vec<u8>> = (0..200u32)
        .map(|i| a.packet_to(&b, &i.to_be_bytes()))
        .collect();
    for packet in &packets {
        a.device.encapsulate(packet.clone()).await.unwrap();
    }

    let mut last_counter = 0;
    for _ in 0..packets.len() {
        let datagram = a.sent().await;
        let current = counter(&datagram);
        assert!(current > last_counter, "counters must rise in wire order");
        last_counter = current;
        carry(&a, &b, datagram);
    }
    for packet in &packets {
        assert_eq!(&b.received().await, packet);
    }
}

#[tokio::test]
async fn test_replayed_datagram_dropped() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let packet = a.packet_to(&b, b"once");
    a.device.encapsulate(packet.clone()).await.unwrap();
    let datagram = a.sent().await;

    carry(&a, &b, datagram.clone());
    assert_eq!(b.received().await, packet);

    carry(&a, &b, datagram);
    wait_for(|| b.device.stats().replays == 1).await;
    assert!(b.delivered.try_recv().is_err());
}

#[tokio::test]
async fn test_spoofed_source_dropped() {
    let (mut a, mut b) = pair(workers(1), workers(1)).await;
    establish(&mut a, &mut b).await;

    let spoofed = packet::build_packet(IpAddr::from([10, 0, 0, 99]), b.tunnel_ip, b"spoof");
    a.device.encapsulate(spoofed).await.unwrap();
    let datagram = a.sent().await;
    carry(&a, &b, datagram);

    wait_for(|| b.device.stats().spoofed == 1).await;
    assert!(b.delivered.try_recv().is_err());
}

#[tokio::test]
async fn test_encapsulate_errors() {
    let (a, b) = pair(workers(1), workers(1)).await;

    let unrouted = packet::build_packet(a.tunnel_ip, IpAddr::from([10, 9, 9, 9]), b"x");
    assert!(matches!(
        a.device.encapsulate(unrouted).await,
        Err(DataPathError::NoRoute { .. })
    ));
    assert!(matches!(
        a.device.encapsulate(vec![0x45, 0, 0]).await,
        Err(DataPathError::Malformed { .. })
    ));

    a.device.down();
    assert!(matches!(
        a.device.encapsulate(a.packet_to(&b, b"x")).await,
        Err(DataPathError::DeviceDown)
    ));
    assert_eq!(a.device.stats().no_route, 1);
}

#[tokio::test]
async fn test_removed_peer_is_unreachable() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    a.device.encapsulate(a.packet_to(&b, b"before")).await.unwrap();
    let datagram = a.sent().await;
    let index = receiver_index(&datagram);
    assert_eq!(b.device.peer_for_index(index), Some(a.public));
    assert_eq!(b.device.peer_for_address(a.tunnel_ip), Some(a.public));

    b.device.peer_remove(&a.public).await.unwrap();
    assert_eq!(b.device.peer_for_index(index), None);
    assert_eq!(b.device.peer_for_address(a.tunnel_ip), None);
    assert!(b.device.peer_state(&a.public).is_none());
    assert!(matches!(
        b.device.peer_remove(&a.public).await,
        Err(ConfigError::UnknownPeer { .. })
    ));

    carry(&a, &b, datagram);
    wait_for(|| b.device.stats().unknown_index == 1).await;
    assert!(b.delivered.try_recv().is_err());
}

#[tokio::test]
async fn test_cookie_required_under_load() {
    let always_loaded = DataplaneConfig {
        under_load_threshold: 0,
        ..workers(1)
    };
    let (mut a, mut b) = pair(workers(1), always_loaded).await;

    a.device.initiate_handshake(&b.public).await.unwrap();
    let initiation = a.sent().await;
    carry(&a, &b, initiation);

    // Without a cookie the responder only answers with a cookie reply
    let reply = b.sent().await;
    assert_eq!(message_type(&reply), 3);
    assert_eq!(b.device.stats().cookie_replies_sent, 1);
    assert_eq!(b.device.peer_state(&a.public), Some(PeerState::Idle));
    carry(&b, &a, reply);

    // The retransmission carries MAC2 and is admitted
    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::time::resume();

    let retry = a.sent().await;
    assert_eq!(message_type(&retry), 1);
    carry(&a, &b, retry);
    let response = b.sent().await;
    assert_eq!(message_type(&response), 2);
    assert_eq!(b.device.stats().cookie_replies_sent, 1);
}

#[tokio::test]
async fn test_rekey_keeps_in_flight_packets() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let packets: Vec<Vec<u8>> = (0..5u8).map(|i| a.packet_to(&b, &[i; 8])).collect();
    let mut in_flight = Vec::new();
    for packet in &packets[..4] {
        a.device.encapsulate(packet.clone()).await.unwrap();
        in_flight.push(a.sent().await);
    }
    let old_index = receiver_index(&in_flight[0]);

    // Two minutes pass with nothing heard back; the initiator rekeys
    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(121)).await;
    tokio::time::resume();

    let initiation = a.sent().await;
    assert_eq!(message_type(&initiation), 1);
    carry(&a, &b, initiation);
    let response = b.sent().await;
    assert_eq!(message_type(&response), 2);
    carry(&b, &a, response);
    let keepalive = a.sent().await;
    assert_eq!(keepalive.len(), TransportHeader::MIN_SIZE);

    a.device.encapsulate(packets[4].clone()).await.unwrap();
    let fresh = a.sent().await;
    assert_ne!(receiver_index(&fresh), old_index);
    assert_eq!(receiver_index(&fresh), receiver_index(&keepalive));

    // The old session still decrypts what was already in flight
    for datagram in in_flight {
        carry(&a, &b, datagram);
    }
    for packet in &packets[..4] {
        assert_eq!(&b.received().await, packet);
    }

    carry(&a, &b, keepalive);
    carry(&a, &b, fresh);
    assert_eq!(b.received().await, packets[4]);
    assert_eq!(b.device.peer_state(&a.public), Some(PeerState::SessionActive));
}

#[tokio::test]
async fn test_peer_limits_and_own_key() {
    let config = DataplaneConfig {
        max_peers: 1,
        ..workers(1)
    };
    let a = Node::new(1, config).await;
    let b = Node::new(2, workers(1)).await;
    let c = Node::new(3, workers(1)).await;

    a.add_peer(&b).await;
    // Re-adding updates in place
    a.add_peer(&b).await;
    assert_eq!(a.device.peers().len(), 1);

    let result = a.device.peer_add(PeerConfig::new(c.public)).await;
    assert!(matches!(result, Err(ConfigError::PeerLimitExceeded { max: 1 })));

    let result = a.device.peer_add(PeerConfig::new(a.public)).await;
    assert!(matches!(result, Err(ConfigError::InvalidKey { .. })));
    let result = a.device.peer_add(PeerConfig::new([0u8; 32])).await;
    assert!(matches!(result, Err(ConfigError::InvalidKey { .. })));
}

#[tokio::test]
async fn test_set_keys_removes_matching_peer() {
    let a = Node::new(1, workers(1)).await;
    let (private, public) = x25519::generate_keypair();
    a.device.peer_add(PeerConfig::new(public)).await.unwrap();
    assert_eq!(a.device.peers(), vec![public]);

    a.device.set_keys(private).await.unwrap();
    assert_eq!(a.device.public_key(), Some(public));
    assert!(a.device.peers().is_empty());

    assert!(matches!(
        a.device.set_keys([0u8; 32]).await,
        Err(ConfigError::InvalidKey { .. })
    ));
}

#[tokio::test]
async fn test_malformed_datagrams_counted() {
    let (a, b) = pair(workers(1), workers(1)).await;
    carry(&a, &b, vec![9, 0, 0, 0, 1, 2, 3]);
    carry(&a, &b, vec![1, 0, 0, 0, 0, 0]);
    carry(&a, &b, vec![1, 2]);
    assert_eq!(b.device.stats().malformed, 3);
}

#[tokio::test]
async fn test_shutdown_clears_everything() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    a.device.shutdown().await;
    assert!(!a.device.is_up());
    assert!(a.device.peers().is_empty());
    assert!(a.device.public_key().is_none());
    assert_eq!(a.device.peer_for_address(b.tunnel_ip), None);
}

/// Packets queued behind a held delivery lock
const IN_FLIGHT: usize = 50;

#[tokio::test]
async fn test_remove_peer_with_outbound_in_flight() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let peer = a.device.inner.peer_by_key(&b.public).unwrap();
    let delivery = peer.outbound_delivery.lock().await;
    for i in 0..IN_FLIGHT {
        let payload = format!("queued {}", i);
        a.device.encapsulate(a.packet_to(&b, payload.as_bytes())).await.unwrap();
    }
    assert!(peer.in_flight() > 0);

    let removal = a.device.peer_remove(&b.public);
    tokio::pin!(removal);
    // Removal waits for the crypto jobs, which wait for delivery
    assert!(timeout(Duration::from_millis(50), &mut removal).await.is_err());
    assert!(peer.is_dead());

    drop(delivery);
    removal.await.unwrap();
    assert_eq!(peer.in_flight(), 0);
    assert_eq!(a.device.peer_for_address(b.tunnel_ip), None);
    assert!(a.device.peer_state(&b.public).is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.wire.try_recv().is_err());
}

#[tokio::test]
async fn test_remove_peer_with_inbound_in_flight() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let mut datagrams = Vec::with_capacity(IN_FLIGHT);
    for i in 0..IN_FLIGHT {
        let payload = format!("inbound {}", i);
        a.device.encapsulate(a.packet_to(&b, payload.as_bytes())).await.unwrap();
        datagrams.push(a.sent().await);
    }
    let index = receiver_index(&datagrams[0]);

    let peer = b.device.inner.peer_by_key(&a.public).unwrap();
    let delivery = peer.inbound_delivery.lock().await;
    for datagram in datagrams {
        carry(&a, &b, datagram);
    }
    assert!(peer.in_flight() > 0);

    let removal = b.device.peer_remove(&a.public);
    tokio::pin!(removal);
    assert!(timeout(Duration::from_millis(50), &mut removal).await.is_err());

    drop(delivery);
    removal.await.unwrap();
    assert_eq!(peer.in_flight(), 0);
    assert_eq!(b.device.peer_for_index(index), None);
    assert_eq!(b.device.stats().rx_packets, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(b.delivered.try_recv().is_err());
}

#[tokio::test]
async fn test_down_drops_outbound_in_flight() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let peer = a.device.inner.peer_by_key(&b.public).unwrap();
    let delivery = peer.outbound_delivery.lock().await;
    for _ in 0..20 {
        a.device.encapsulate(a.packet_to(&b, b"late")).await.unwrap();
    }
    a.device.down();
    drop(delivery);

    wait_for(|| a.device.stats().interface_down == 20).await;
    wait_for(|| peer.in_flight() == 0).await;
    assert!(a.wire.try_recv().is_err());
    assert_eq!(a.device.stats().tx_packets, 1);
    assert_eq!(a.device.peer_state(&b.public), Some(PeerState::Idle));
    assert!(matches!(
        a.device.encapsulate(a.packet_to(&b, b"x")).await,
        Err(DataPathError::DeviceDown)
    ));

    // Peers survive and come back with a fresh handshake
    a.device.up().await;
    assert_eq!(a.device.peers(), vec![b.public]);
}

#[tokio::test]
async fn test_down_drops_inbound_in_flight() {
    let (mut a, mut b) = pair(workers(2), workers(2)).await;
    establish(&mut a, &mut b).await;

    let mut datagrams = Vec::new();
    for _ in 0..20 {
        a.device.encapsulate(a.packet_to(&b, b"late")).await.unwrap();
        datagrams.push(a.sent().await);
    }

    let peer = b.device.inner.peer_by_key(&a.public).unwrap();
    let delivery = peer.inbound_delivery.lock().await;
    for datagram in datagrams {
        carry(&a, &b, datagram);
    }
    b.device.down();
    drop(delivery);

    wait_for(|| b.device.stats().interface_down == 20).await;
    wait_for(|| peer.in_flight() == 0).await;
    assert!(b.delivered.try_recv().is_err());
}
