//! Handshake traffic: the bounded handshake queue, cookie gating, and
//! sending and receiving initiations, responses and cookie replies

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::index_table::IndexSlot;
use super::peer::Peer;
use super::stats::bump;
use super::udp::Endpoint;
use super::DeviceInner;
use crate::error::HandshakeError;
use crate::protocol::cookie::CookieVerdict;
use crate::protocol::handshake::{consume_initiation, SessionKeys, StaticIdentity};
use crate::protocol::messages::{
    get_message_type, CookieReply, HandshakeInitiation, HandshakeResponse, MessageType,
};
use crate::protocol::session::REKEY_TIMEOUT;
use crate::protocol::transport::Keypair;

/// A handshake-class datagram waiting for the handshake worker
pub(crate) struct HandshakeJob {
    pub data: Vec<u8>,
    pub from: Endpoint,
}

impl DeviceInner {
    pub(crate) fn queue_handshake(&self, data: Vec<u8>, from: Endpoint) {
        if self
            .handshake_tx
            .try_send(HandshakeJob { data, from })
            .is_err()
        {
            bump(&self.counters.handshakes_dropped);
            trace!("Dropping handshake packet from {}: queue full", from.addr);
        }
    }

    /// Under load while the handshake backlog is deep, and for a short hold
    /// period after it drains
    pub(crate) fn under_load(&self) -> bool {
        let depth = self.handshake_tx.max_capacity() - self.handshake_tx.capacity();
        let now = Instant::now();
        let mut last = self.last_under_load.lock();
        if depth >= self.config.under_load_threshold {
            *last = Some(now);
            return true;
        }
        last.is_some_and(|since| now.saturating_duration_since(since) < self.config.under_load_hold)
    }

    pub(crate) async fn process_handshake(&self, job: HandshakeJob) {
        let under_load = self.under_load();
        let result = match get_message_type(&job.data) {
            Ok(MessageType::HandshakeInitiation) => self.receive_initiation(&job, under_load).await,
            Ok(MessageType::HandshakeResponse) => self.receive_response(&job, under_load).await,
            Ok(MessageType::CookieReply) => self.receive_cookie_reply(&job),
            Ok(MessageType::TransportData) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            bump(&self.counters.handshakes_dropped);
            debug!("Dropping handshake packet from {}: {}", job.from.addr, e);
        }
    }

    /// Run the MAC/cookie checks. `Ok(false)` means the message was
    /// answered with a cookie reply or dropped and must go no further.
    async fn admit(&self, job: &HandshakeJob, under_load: bool) -> Result<bool, HandshakeError> {
        match self
            .cookie_checker
            .validate_packet(&job.data, job.from.addr, under_load)
        {
            CookieVerdict::Accept => Ok(true),
            CookieVerdict::NeedsCookie => {
                let reply = self.cookie_checker.create_reply(&job.data, job.from.addr)?;
                debug!(
                    "Sending cookie response for denied handshake message from {}",
                    job.from.addr
                );
                if let Err(e) = self.transport.send(&job.from, &reply.to_bytes()).await {
                    trace!("Failed to send cookie reply to {}: {}", job.from.addr, e);
                }
                bump(&self.counters.cookie_replies_sent);
                Ok(false)
            }
            CookieVerdict::Reject => {
                bump(&self.counters.handshakes_dropped);
                trace!("Rejected handshake message from {}", job.from.addr);
                Ok(false)
            }
        }
    }

    fn local_identity(&self) -> Result<StaticIdentity, HandshakeError> {
        self.identity.read().clone().ok_or(HandshakeError::NoIdentity)
    }

    async fn receive_initiation(&self, job: &HandshakeJob, under_load: bool) -> Result<(), HandshakeError> {
        if !self.admit(job, under_load).await? {
            return Ok(());
        }
        let message = HandshakeInitiation::from_bytes(&job.data)?;
        let identity = self.local_identity()?;
        let consumed = consume_initiation(&identity, &message)?;
        let peer = self
            .peer_by_key(&consumed.remote_static)
            .filter(|peer| !peer.is_dead())
            .ok_or(HandshakeError::UnknownPeer)?;

        let stale_index = {
            let mut handshake = peer.handshake.lock();
            let stale = handshake.local_index();
            handshake.accept_initiation(consumed, Instant::now())?;
            stale
        };
        if let Some(index) = stale_index {
            self.index.release(index, peer.id);
        }

        peer.set_endpoint(job.from);
        debug!("Receiving handshake initiation from peer {} ({})", peer, job.from.addr);
        self.send_handshake_response(&peer).await?;

        peer.add_rx_bytes(job.data.len());
        peer.timers.any_authenticated_packet_received();
        peer.timers.any_authenticated_packet_traversal();
        Ok(())
    }

    async fn send_handshake_response(&self, peer: &Arc<Peer>) -> Result<(), HandshakeError> {
        let (response, keys) = {
            let mut handshake = peer.handshake.lock();
            let index = self.index.allocate(peer.id, IndexSlot::Handshake);
            let created = handshake
                .create_response(index)
                .and_then(|response| Ok((response, handshake.begin_session()?)));
            if created.is_err() {
                self.index.release(index, peer.id);
            }
            created?
        };

        let mut bytes = response.to_bytes();
        peer.cookie.lock().add_macs(&mut bytes);
        self.install_session(peer, &keys);

        peer.timers.any_authenticated_packet_traversal();
        peer.timers.any_authenticated_packet_sent();
        *peer.last_sent_handshake.lock() = Some(Instant::now());
        debug!("Sending handshake response to peer {}", peer);
        self.send_to_peer(peer, &bytes).await;
        Ok(())
    }

    async fn receive_response(&self, job: &HandshakeJob, under_load: bool) -> Result<(), HandshakeError> {
        if !self.admit(job, under_load).await? {
            return Ok(());
        }
        let message = HandshakeResponse::from_bytes(&job.data)?;
        let unknown = HandshakeError::UnknownIndex {
            index: message.receiver_index,
        };
        let Some(peer) = self
            .index
            .lookup(message.receiver_index)
            .filter(|entry| entry.is_handshake())
            .and_then(|entry| self.peer_by_id(entry.peer))
            .filter(|peer| !peer.is_dead())
        else {
            return Err(unknown);
        };
        let identity = self.local_identity()?;

        let keys = {
            let mut handshake = peer.handshake.lock();
            handshake.consume_response(&identity, &message)?;
            handshake.begin_session()?
        };

        peer.set_endpoint(job.from);
        debug!("Receiving handshake response from peer {} ({})", peer, job.from.addr);
        self.install_session(&peer, &keys);
        self.handshake_completed(&peer);

        peer.add_rx_bytes(job.data.len());
        peer.timers.any_authenticated_packet_received();
        peer.timers.any_authenticated_packet_traversal();

        // Flushes staged packets, or confirms the session with a keepalive
        self.send_keepalive(&peer).await;
        Ok(())
    }

    fn receive_cookie_reply(&self, job: &HandshakeJob) -> Result<(), HandshakeError> {
        let reply = CookieReply::from_bytes(&job.data)?;
        let peer = self
            .index
            .lookup(reply.receiver_index)
            .and_then(|entry| self.peer_by_id(entry.peer))
            .ok_or(HandshakeError::UnknownIndex {
                index: reply.receiver_index,
            })?;
        peer.cookie.lock().consume_reply(&reply)?;
        debug!("Receiving cookie response from {}", job.from.addr);
        Ok(())
    }

    /// Send a new initiation unless one went out within REKEY_TIMEOUT.
    /// Retries keep counting attempts; fresh handshakes reset the count.
    pub(crate) async fn send_handshake_initiation(&self, peer: &Peer, is_retry: bool) {
        if !is_retry {
            peer.timers.reset_handshake_attempts();
        }
        if peer.is_dead() || !self.is_up() {
            return;
        }
        let Some(endpoint) = peer.endpoint() else {
            debug!("No endpoint for peer {}, not sending handshake initiation", peer);
            return;
        };
        let now = Instant::now();
        {
            let mut last = peer.last_sent_handshake.lock();
            if last.is_some_and(|sent| now.saturating_duration_since(sent) < REKEY_TIMEOUT) {
                return;
            }
            *last = Some(now);
        }

        let identity = self.identity.read().clone();
        let initiation = {
            let mut handshake = peer.handshake.lock();
            let stale = handshake.local_index();
            let index = self.index.allocate(peer.id, IndexSlot::Handshake);
            let created = handshake.create_initiation(identity.as_ref(), index);
            if let Some(stale) = stale.filter(|&stale| handshake.local_index() != Some(stale)) {
                self.index.release(stale, peer.id);
            }
            match created {
                Ok(initiation) => initiation,
                Err(e) => {
                    self.index.release(index, peer.id);
                    debug!("Failed to create handshake initiation for peer {}: {}", peer, e);
                    return;
                }
            }
        };

        let mut bytes = initiation.to_bytes();
        peer.cookie.lock().add_macs(&mut bytes);
        debug!("Sending handshake initiation to peer {} ({})", peer, endpoint.addr);
        peer.timers.any_authenticated_packet_traversal();
        peer.timers.any_authenticated_packet_sent();
        self.send_to_peer(peer, &bytes).await;
        peer.timers.handshake_initiated();
    }

    async fn send_to_peer(&self, peer: &Peer, bytes: &[u8]) {
        let Some(endpoint) = peer.endpoint() else {
            return;
        };
        match self.transport.send(&endpoint, bytes).await {
            Ok(()) => peer.add_tx_bytes(bytes.len()),
            Err(e) => debug!("Failed to send handshake message to peer {}: {}", peer, e),
        }
    }

    /// Turn derived keys into a live keypair and register its index
    fn install_session(&self, peer: &Peer, keys: &SessionKeys) -> Arc<Keypair> {
        let keypair = Arc::new(Keypair::new(keys, Instant::now()));
        self.index.replace(
            keys.local_index,
            peer.id,
            IndexSlot::Keypair(Arc::downgrade(&keypair)),
        );
        let released = peer.keypairs.lock().install(keypair.clone());
        self.release_keypairs(peer, released);
        peer.timers.session_derived();
        keypair
    }

    pub(crate) fn release_keypairs(&self, peer: &Peer, released: Vec<Arc<Keypair>>) {
        for keypair in released {
            self.index.release(keypair.local_index, peer.id);
        }
    }

    pub(crate) fn handshake_completed(&self, peer: &Peer) {
        peer.timers.handshake_complete();
        peer.record_handshake();
        peer.sent_lastminute_handshake
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }

    /// Erase every session and the in-progress handshake of a peer
    pub(crate) fn zero_key_material(&self, peer: &Peer) {
        let released = peer.keypairs.lock().clear();
        self.release_keypairs(peer, released);
        let mut handshake = peer.handshake.lock();
        if let Some(index) = handshake.local_index() {
            self.index.release(index, peer.id);
        }
        handshake.clear();
    }
}
