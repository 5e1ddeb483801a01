//! Per-peer state
//!
//! A peer owns its handshake, up to three keypairs, its cookie state,
//! timers and queues. The device only ever holds it behind an `Arc`;
//! crypto jobs and timer handlers keep it alive while in flight.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::queue::{ReorderQueue, StageQueue};
use super::stats::PeerStats;
use super::timers::{PeerTimers, TimerEvent};
use super::udp::Endpoint;
use super::PeerId;
use crate::config::DataplaneConfig;
use crate::protocol::cookie::CookieState;
use crate::protocol::handshake::{Handshake, StaticIdentity};
use crate::protocol::session::{KeypairSet, PeerState};
use crate::protocol::transport::Keypair;

/// A decrypted packet waiting for ordered delivery
pub struct InboundPacket {
    pub keypair: Arc<Keypair>,
    pub counter: u64,
    pub plaintext: Vec<u8>,
    pub endpoint: Endpoint,
    pub wire_len: usize,
}

pub struct Peer {
    pub id: PeerId,
    pub public_key: [u8; 32],
    pub(crate) handshake: Mutex<Handshake>,
    pub(crate) keypairs: Mutex<KeypairSet>,
    pub(crate) cookie: Mutex<CookieState>,
    endpoint: RwLock<Option<Endpoint>>,
    pub(crate) timers: PeerTimers,
    pub(crate) staged: StageQueue,
    /// Held across drain, nonce assignment and slot reservation
    pub(crate) submission: Mutex<()>,
    pub(crate) outbound: ReorderQueue<Vec<u8>>,
    pub(crate) inbound: ReorderQueue<InboundPacket>,
    pub(crate) outbound_delivery: tokio::sync::Mutex<()>,
    pub(crate) inbound_delivery: tokio::sync::Mutex<()>,
    pub(crate) last_sent_handshake: Mutex<Option<Instant>>,
    pub(crate) sent_lastminute_handshake: AtomicBool,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,
    dead: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        public_key: [u8; 32],
        preshared_key: Option<[u8; 32]>,
        identity: Option<&StaticIdentity>,
        config: &DataplaneConfig,
        timer_events: mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            id,
            public_key,
            handshake: Mutex::new(Handshake::new(public_key, preshared_key, identity)),
            keypairs: Mutex::new(KeypairSet::new()),
            cookie: Mutex::new(CookieState::new(&public_key)),
            endpoint: RwLock::new(None),
            timers: PeerTimers::new(id, timer_events),
            staged: StageQueue::new(config.max_staged_packets),
            submission: Mutex::new(()),
            outbound: ReorderQueue::new(config.max_queued_packets),
            inbound: ReorderQueue::new(config.max_queued_packets),
            outbound_delivery: tokio::sync::Mutex::new(()),
            inbound_delivery: tokio::sync::Mutex::new(()),
            last_sent_handshake: Mutex::new(None),
            sent_lastminute_handshake: AtomicBool::new(false),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
            dead: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        *self.endpoint.read()
    }

    pub(crate) fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.write() = Some(endpoint);
    }

    /// Forget the local address hint so the next send may pick another route
    pub(crate) fn clear_endpoint_source(&self) {
        if let Some(endpoint) = self.endpoint.write().as_mut() {
            endpoint.local = None;
        }
    }

    pub fn state(&self, now: Instant) -> PeerState {
        let stage = self.handshake.lock().stage();
        PeerState::derive(stage, &self.keypairs.lock(), now)
    }

    pub(crate) fn add_rx_bytes(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_tx_bytes(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_handshake(&self) {
        *self.last_handshake.lock() = Some(SystemTime::now());
    }

    pub(crate) fn stats(&self, allowed_ips: Vec<IpNet>, now: Instant) -> PeerStats {
        PeerStats {
            public_key: self.public_key,
            endpoint: self.endpoint().map(|e| e.addr),
            allowed_ips,
            persistent_keepalive: self.timers.persistent_keepalive(),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            last_handshake: *self.last_handshake.lock(),
            state: self.state(now),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Pairs with [`Peer::begin_job`]: a job either sees the flag or is
    /// counted before removal reads the in-flight count.
    pub(crate) fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Account a crypto job submitted on behalf of this peer
    pub(crate) fn begin_job(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_job(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once no crypto job for this peer is outstanding
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(&self.public_key[..8]))
    }
}
