//! The WireGuard device
//!
//! A [`Device`] owns the interface identity, the peer set, the receive index
//! table and the allowed-IP table. It encrypts plaintext from the host for
//! the right peer, decrypts datagrams from the network, answers handshakes
//! and drives the per-peer protocol timers.
//!
//! ```text
//!  host ──encapsulate──▶ allowed IPs ──▶ peer stage ──▶ encrypt workers ──▶ transport
//!  transport ──decapsulate──┬─▶ handshake queue ──▶ handshake worker
//!                           └─▶ index table ──▶ decrypt workers ──▶ replay/source check ──▶ sink
//! ```

mod allowed_ips;
mod handshake;
mod index_table;
mod peer;
mod pipeline;
mod queue;
mod stats;
mod timers;
mod udp;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

pub use allowed_ips::{AllowedIps, Direction};
pub use index_table::{IndexEntry, IndexSlot, IndexTable};
pub use peer::Peer;
pub use queue::{ReorderQueue, Slot, StageQueue};
pub use stats::{DeviceStats, PeerStats};
pub use timers::TimerKind;
pub use udp::{DatagramTransport, Endpoint, PacketSink, UdpTransport};

use self::handshake::HandshakeJob;
use self::pipeline::CryptoPool;
use self::stats::{bump, DeviceCounters};
use self::timers::TimerEvent;
use crate::config::{DataplaneConfig, PeerConfig, WireGuardConfig};
use crate::crypto::x25519;
use crate::error::{ConfigError, DataPathError, NetworkError};
use crate::protocol::cookie::{CookieChecker, COOKIE_SECRET_MAX_AGE};
use crate::protocol::handshake::StaticIdentity;
use crate::protocol::messages::{
    get_message_type, CookieReply, HandshakeInitiation, HandshakeResponse, MessageType,
};
use crate::protocol::session::PeerState;

/// Device-local peer handle, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn short_key(key: &[u8; 32]) -> String {
    BASE64.encode(&key[..8])
}

fn unknown_peer(key: &[u8; 32]) -> ConfigError {
    ConfigError::UnknownPeer {
        key: short_key(key),
    }
}

pub(crate) struct DeviceInner {
    config: DataplaneConfig,
    identity: RwLock<Option<StaticIdentity>>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    peers_by_key: RwLock<HashMap<[u8; 32], PeerId>>,
    next_peer_id: AtomicU64,
    /// Serializes configuration-plane operations
    config_lock: tokio::sync::Mutex<()>,
    index: IndexTable,
    allowed_ips: AllowedIps,
    cookie_checker: CookieChecker,
    transport: Arc<dyn DatagramTransport>,
    sink: Arc<dyn PacketSink>,
    encrypt_pool: CryptoPool,
    decrypt_pool: CryptoPool,
    handshake_tx: mpsc::Sender<HandshakeJob>,
    last_under_load: Mutex<Option<Instant>>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    up: AtomicBool,
    counters: DeviceCounters,
}

impl DeviceInner {
    pub(crate) fn peer_by_id(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    pub(crate) fn peer_by_key(&self, key: &[u8; 32]) -> Option<Arc<Peer>> {
        let id = *self.peers_by_key.read().get(key)?;
        self.peer_by_id(id)
    }

    fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub(crate) fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn require_peer(&self, key: &[u8; 32]) -> Result<Arc<Peer>, ConfigError> {
        self.peer_by_key(key).ok_or_else(|| unknown_peer(key))
    }

    /// Make `nets` the complete allowed-IP list of `peer`
    fn replace_allowed_ips(&self, peer: &Peer, nets: &[IpNet]) {
        self.allowed_ips.remove_by_peer(peer.id);
        for net in nets {
            if let Some(previous) = self.allowed_ips.insert(*net, peer.id) {
                debug!("Allowed IP {} moved from peer {} to peer {}", net, previous, peer);
            }
        }
    }

    /// Tear a peer down: stop its timers, drop staged packets, let in-flight
    /// crypto jobs drain, then drop it from every table and erase its keys.
    async fn remove_peer(&self, peer: Arc<Peer>) {
        self.peers.write().remove(&peer.id);
        self.peers_by_key.write().remove(&peer.public_key);

        peer.mark_dead();
        peer.timers.disable();
        peer.staged.purge();
        peer.wait_idle().await;

        self.allowed_ips.remove_by_peer(peer.id);
        self.zero_key_material(&peer);
        self.index.remove_peer(peer.id);
        peer.outbound.purge();
        peer.inbound.purge();
        peer.cookie.lock().clear();
        info!("Peer {} removed", peer);
    }

    fn apply_peer_settings(&self, peer: &Peer, config: &PeerConfig) {
        peer.handshake.lock().set_psk(config.preshared_key);
        if let Some(endpoint) = config.endpoint {
            peer.set_endpoint(Endpoint::new(endpoint));
        }
        peer.timers.set_persistent_keepalive(config.persistent_keepalive);
        self.replace_allowed_ips(peer, &config.allowed_ips);
    }

    fn decapsulate(&self, datagram: Vec<u8>, from: Endpoint) {
        if !self.is_up() {
            return;
        }
        let expected = match get_message_type(&datagram) {
            Ok(MessageType::TransportData) => return self.receive_data(datagram, from),
            Ok(MessageType::HandshakeInitiation) => HandshakeInitiation::SIZE,
            Ok(MessageType::HandshakeResponse) => HandshakeResponse::SIZE,
            Ok(MessageType::CookieReply) => CookieReply::SIZE,
            Err(e) => {
                bump(&self.counters.malformed);
                trace!("Dropping datagram from {}: {}", from.addr, e);
                return;
            }
        };
        if datagram.len() != expected {
            bump(&self.counters.malformed);
            trace!(
                "Dropping handshake message from {} with length {}",
                from.addr,
                datagram.len()
            );
            return;
        }
        self.queue_handshake(datagram, from);
    }
}

/// Handle to a running data plane.
///
/// Dropping the handle stops the background tasks; [`Device::shutdown`]
/// additionally tears down every peer and wipes key material.
pub struct Device {
    inner: Arc<DeviceInner>,
    tasks: Vec<AbortHandle>,
}

impl Device {
    /// Build a device and start its background tasks. The device starts
    /// down; call [`Device::up`] once keys and peers are configured.
    pub fn new(
        config: DataplaneConfig,
        transport: Arc<dyn DatagramTransport>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::channel(config.max_queued_handshakes.max(1));
        let workers = config.crypto_workers.max(1);

        let inner = Arc::new_cyclic(|weak| DeviceInner {
            config,
            identity: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            peers_by_key: RwLock::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            config_lock: tokio::sync::Mutex::new(()),
            index: IndexTable::new(),
            allowed_ips: AllowedIps::new(),
            cookie_checker: CookieChecker::new(None),
            transport,
            sink,
            encrypt_pool: CryptoPool::spawn("encrypt", workers, weak.clone()),
            decrypt_pool: CryptoPool::spawn("decrypt", workers, weak.clone()),
            handshake_tx,
            last_under_load: Mutex::new(None),
            timer_tx,
            up: AtomicBool::new(false),
            counters: DeviceCounters::default(),
        });

        let tasks = vec![
            Self::spawn_timer_loop(&inner, timer_rx),
            Self::spawn_handshake_worker(&inner, handshake_rx),
            Self::spawn_maintenance(&inner),
        ];
        info!("Device created with {} crypto workers per direction", workers);
        Self { inner, tasks }
    }

    fn spawn_timer_loop(
        inner: &Arc<DeviceInner>,
        mut events: mpsc::UnboundedReceiver<TimerEvent>,
    ) -> AbortHandle {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_timer(event).await;
            }
        })
        .abort_handle()
    }

    fn spawn_handshake_worker(
        inner: &Arc<DeviceInner>,
        mut jobs: mpsc::Receiver<HandshakeJob>,
    ) -> AbortHandle {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.process_handshake(job).await;
            }
        })
        .abort_handle()
    }

    /// Rate-limiter garbage collection every second and cookie secret
    /// rotation every COOKIE_SECRET_MAX_AGE
    fn spawn_maintenance(inner: &Arc<DeviceInner>) -> AbortHandle {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut gc = tokio::time::interval(Duration::from_secs(1));
            gc.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut rotate = tokio::time::interval_at(
                Instant::now() + COOKIE_SECRET_MAX_AGE,
                COOKIE_SECRET_MAX_AGE,
            );
            rotate.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = gc.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.cookie_checker.rate_limiter().cleanup(Instant::now());
                    }
                    _ = rotate.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.cookie_checker.rotate_secret();
                        trace!("Rotated cookie secret");
                    }
                }
            }
        })
        .abort_handle()
    }

    /// Set the interface private key. A peer whose public key equals the
    /// new interface public key is removed. Every peer's static-static DH is
    /// recomputed and in-progress handshakes are dropped.
    pub async fn set_keys(&self, private_key: [u8; 32]) -> Result<(), ConfigError> {
        let _config = self.inner.config_lock.lock().await;
        if private_key == [0u8; 32] {
            return Err(ConfigError::InvalidKey {
                field: "PrivateKey".to_string(),
            });
        }
        let identity = StaticIdentity::new(private_key);
        if self
            .inner
            .identity
            .read()
            .as_ref()
            .is_some_and(|current| current.public() == identity.public())
        {
            return Ok(());
        }

        if let Some(peer) = self.inner.peer_by_key(identity.public()) {
            warn!("Removing peer {} which shares the interface public key", peer);
            self.inner.remove_peer(peer).await;
        }

        *self.inner.identity.write() = Some(identity.clone());
        self.inner
            .cookie_checker
            .set_identity(Some(identity.public()));
        for peer in self.inner.all_peers() {
            let mut handshake = peer.handshake.lock();
            if let Some(index) = handshake.local_index() {
                self.inner.index.release(index, peer.id);
            }
            handshake.clear();
            handshake.set_identity(Some(&identity));
        }
        info!("Interface public key is now {}", short_key(identity.public()));
        Ok(())
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.inner.identity.read().as_ref().map(|id| *id.public())
    }

    /// Add a peer, or update it in place if the public key is already known
    pub async fn peer_add(&self, config: PeerConfig) -> Result<PeerId, ConfigError> {
        let _config = self.inner.config_lock.lock().await;
        let key = config.public_key;
        let own_key = self.public_key();
        if !x25519::is_valid_public_key(&key) || own_key == Some(key) {
            return Err(ConfigError::InvalidKey {
                field: "PublicKey".to_string(),
            });
        }

        if let Some(existing) = self.inner.peer_by_key(&key) {
            self.inner.apply_peer_settings(&existing, &config);
            debug!("Peer {} updated", existing);
            return Ok(existing.id);
        }

        let max = self.inner.config.max_peers;
        if self.inner.peers.read().len() >= max {
            return Err(ConfigError::PeerLimitExceeded { max });
        }

        let id = PeerId(self.inner.next_peer_id.fetch_add(1, Ordering::Relaxed));
        let identity = self.inner.identity.read().clone();
        let peer = Arc::new(Peer::new(
            id,
            key,
            config.preshared_key,
            identity.as_ref(),
            &self.inner.config,
            self.inner.timer_tx.clone(),
        ));
        self.inner.peers.write().insert(id, peer.clone());
        self.inner.peers_by_key.write().insert(key, id);
        self.inner.apply_peer_settings(&peer, &config);
        info!("Peer {} added", peer);

        if self.inner.is_up() {
            peer.timers.enable();
            if peer.timers.persistent_keepalive().is_some() {
                self.inner.send_keepalive(&peer).await;
            }
        }
        Ok(id)
    }

    pub async fn peer_remove(&self, public_key: &[u8; 32]) -> Result<(), ConfigError> {
        let _config = self.inner.config_lock.lock().await;
        let peer = self.inner.require_peer(public_key)?;
        self.inner.remove_peer(peer).await;
        Ok(())
    }

    pub async fn set_allowed_ips(
        &self,
        public_key: &[u8; 32],
        allowed_ips: Vec<IpNet>,
    ) -> Result<(), ConfigError> {
        let _config = self.inner.config_lock.lock().await;
        let peer = self.inner.require_peer(public_key)?;
        self.inner.replace_allowed_ips(&peer, &allowed_ips);
        Ok(())
    }

    pub fn set_endpoint(&self, public_key: &[u8; 32], endpoint: SocketAddr) -> Result<(), ConfigError> {
        let peer = self.inner.require_peer(public_key)?;
        peer.set_endpoint(Endpoint::new(endpoint));
        Ok(())
    }

    pub fn set_preshared_key(
        &self,
        public_key: &[u8; 32],
        preshared_key: Option<[u8; 32]>,
    ) -> Result<(), ConfigError> {
        let peer = self.inner.require_peer(public_key)?;
        peer.handshake.lock().set_psk(preshared_key);
        Ok(())
    }

    /// Change the persistent keepalive interval. Enabling it on a running
    /// device sends a keepalive right away.
    pub async fn set_persistent_keepalive(
        &self,
        public_key: &[u8; 32],
        interval: Option<u16>,
    ) -> Result<(), ConfigError> {
        let peer = self.inner.require_peer(public_key)?;
        peer.timers.set_persistent_keepalive(interval.filter(|&secs| secs > 0));
        if self.inner.is_up() && peer.timers.persistent_keepalive().is_some() {
            self.inner.send_keepalive(&peer).await;
        }
        Ok(())
    }

    /// Start a handshake with a peer now, subject to the REKEY_TIMEOUT
    /// spacing between initiations
    pub async fn initiate_handshake(&self, public_key: &[u8; 32]) -> Result<(), ConfigError> {
        let peer = self.inner.require_peer(public_key)?;
        self.inner.send_handshake_initiation(&peer, false).await;
        Ok(())
    }

    /// Apply a parsed configuration file: interface key plus every peer
    pub async fn apply_config(&self, config: &WireGuardConfig) -> Result<(), ConfigError> {
        self.set_keys(config.interface.private_key).await?;
        for peer in &config.peers {
            self.peer_add(peer.clone()).await?;
        }
        Ok(())
    }

    /// Encrypt a plaintext IP packet from the host and send it to the peer
    /// whose allowed IPs contain its destination
    pub async fn encapsulate(&self, packet: Vec<u8>) -> Result<(), DataPathError> {
        self.inner.encapsulate(packet).await
    }

    /// Process one datagram received from the network. Failures are
    /// silent drops, visible only in [`Device::stats`].
    pub fn decapsulate(&self, datagram: Vec<u8>, from: Endpoint) {
        self.inner.decapsulate(datagram, from);
    }

    /// Read datagrams from the transport until it fails permanently
    pub async fn run(&self) -> Result<(), NetworkError> {
        loop {
            match self.inner.transport.recv().await {
                Ok((datagram, from)) => self.decapsulate(datagram, from),
                Err(NetworkError::ReceiveFailed { reason }) => {
                    trace!("Transient receive error: {}", reason);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn up(&self) {
        if self.inner.up.swap(true, Ordering::AcqRel) {
            return;
        }
        for peer in self.inner.all_peers() {
            peer.timers.enable();
            self.inner.send_staged(&peer).await;
            if peer.timers.persistent_keepalive().is_some() {
                self.inner.send_keepalive(&peer).await;
            }
        }
        info!("Device is up");
    }

    /// Stop all timers, drop staged packets and erase session keys
    pub fn down(&self) {
        if !self.inner.up.swap(false, Ordering::AcqRel) {
            return;
        }
        for peer in self.inner.all_peers() {
            peer.timers.disable();
            peer.staged.purge();
            self.inner.zero_key_material(&peer);
            *peer.last_sent_handshake.lock() = None;
        }
        info!("Device is down");
    }

    pub fn is_up(&self) -> bool {
        self.inner.is_up()
    }

    /// Remove every peer, stop the workers and wipe the interface keys
    pub async fn shutdown(&self) {
        self.down();
        for peer in self.inner.all_peers() {
            self.inner.remove_peer(peer).await;
        }
        self.inner.encrypt_pool.shutdown();
        self.inner.decrypt_pool.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        self.inner.cookie_checker.clear();
        *self.inner.identity.write() = None;
        info!("Device shut down");
    }

    pub fn stats(&self) -> DeviceStats {
        self.inner.counters.snapshot()
    }

    pub fn peers(&self) -> Vec<[u8; 32]> {
        self.inner.peers_by_key.read().keys().copied().collect()
    }

    pub fn peer_stats(&self, public_key: &[u8; 32]) -> Option<PeerStats> {
        let peer = self.inner.peer_by_key(public_key)?;
        let allowed_ips = self.inner.allowed_ips.entries_for(peer.id);
        Some(peer.stats(allowed_ips, Instant::now()))
    }

    pub fn peer_state(&self, public_key: &[u8; 32]) -> Option<PeerState> {
        Some(self.inner.peer_by_key(public_key)?.state(Instant::now()))
    }

    /// Which peer the allowed-IP table routes `addr` to
    pub fn peer_for_address(&self, addr: IpAddr) -> Option<[u8; 32]> {
        let id = self.inner.allowed_ips.lookup(addr)?;
        Some(self.inner.peer_by_id(id)?.public_key)
    }

    /// Which peer a receive index belongs to
    pub fn peer_for_index(&self, index: u32) -> Option<[u8; 32]> {
        let entry = self.inner.index.lookup(index)?;
        Some(self.inner.peer_by_id(entry.peer)?.public_key)
    }

    pub fn local_port(&self) -> u16 {
        self.inner.transport.local_port()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.inner.encrypt_pool.shutdown();
        self.inner.decrypt_pool.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        for peer in self.inner.all_peers() {
            peer.timers.disable();
        }
    }
}
