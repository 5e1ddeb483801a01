//! Ordered parallel crypto pipeline
//!
//! Outbound: plaintext is staged per peer, then drained under the peer's
//! submission lock where each packet gets a send counter and a reorder slot.
//! Inbound: transport messages get a reorder slot before decryption. Jobs
//! are spread round-robin over a pool of worker tasks; whichever worker
//! finishes drains the peer's ready prefix under its delivery lock, so
//! packets leave in submission order no matter which worker finished first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::allowed_ips::Direction;
use super::peer::{InboundPacket, Peer};
use super::queue::Slot;
use super::stats::bump;
use super::udp::Endpoint;
use super::DeviceInner;
use crate::error::DataPathError;
use crate::packet;
use crate::protocol::messages::TransportHeader;
use crate::protocol::transport::{Keypair, REJECT_AFTER_MESSAGES};

pub(crate) struct EncryptJob {
    peer: Arc<Peer>,
    keypair: Arc<Keypair>,
    counter: u64,
    plaintext: Vec<u8>,
    slot: Arc<Slot<Vec<u8>>>,
}

pub(crate) struct DecryptJob {
    peer: Arc<Peer>,
    keypair: Arc<Keypair>,
    counter: u64,
    datagram: Vec<u8>,
    endpoint: Endpoint,
    slot: Arc<Slot<InboundPacket>>,
}

pub(crate) enum Job {
    Encrypt(EncryptJob),
    Decrypt(DecryptJob),
}

impl Job {
    /// Give up on a job that never reached a worker
    fn abandon(self) {
        match self {
            Job::Encrypt(job) => {
                job.slot.fail();
                job.peer.end_job();
            }
            Job::Decrypt(job) => {
                job.slot.fail();
                job.peer.end_job();
            }
        }
    }
}

/// Fixed set of worker tasks, fed round-robin
pub(crate) struct CryptoPool {
    workers: Vec<mpsc::UnboundedSender<Job>>,
    next: AtomicUsize,
    tasks: Vec<AbortHandle>,
}

impl CryptoPool {
    pub fn spawn(name: &'static str, count: usize, device: Weak<DeviceInner>) -> Self {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);
        let mut tasks = Vec::with_capacity(count);
        for id in 0..count {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let device = device.clone();
            let task = tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    match device.upgrade() {
                        Some(device) => device.run_job(job).await,
                        None => {
                            job.abandon();
                            break;
                        }
                    }
                }
                trace!("{} worker {} stopped", name, id);
            });
            workers.push(tx);
            tasks.push(task.abort_handle());
        }
        Self {
            workers,
            next: AtomicUsize::new(0),
            tasks,
        }
    }

    pub fn submit(&self, job: Job) {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if let Err(mpsc::error::SendError(job)) = self.workers[worker].send(job) {
            job.abandon();
        }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl DeviceInner {
    async fn run_job(&self, job: Job) {
        match job {
            Job::Encrypt(job) => {
                match job.keypair.seal(job.counter, &job.plaintext, self.config.mtu) {
                    Ok(message) => job.slot.complete(message),
                    Err(e) => {
                        trace!("Failed to encrypt packet for peer {}: {}", job.peer, e);
                        job.slot.fail();
                    }
                }
                self.deliver_outbound(&job.peer).await;
                job.peer.end_job();
            }
            Job::Decrypt(job) => {
                let payload = TransportHeader::payload(&job.datagram);
                match job.keypair.open(job.counter, payload) {
                    Ok(plaintext) => job.slot.complete(InboundPacket {
                        keypair: job.keypair.clone(),
                        counter: job.counter,
                        plaintext,
                        endpoint: job.endpoint,
                        wire_len: job.datagram.len(),
                    }),
                    Err(_) => {
                        bump(&self.counters.decrypt_failed);
                        trace!("Packet from peer {} failed authentication", job.peer);
                        job.slot.fail();
                    }
                }
                self.deliver_inbound(&job.peer).await;
                job.peer.end_job();
            }
        }
    }

    /// Route a plaintext packet from the host to its peer
    pub(crate) async fn encapsulate(&self, packet: Vec<u8>) -> Result<(), DataPathError> {
        if !self.is_up() {
            return Err(DataPathError::DeviceDown);
        }
        let Some(dst) = packet::destination_address(&packet) else {
            bump(&self.counters.malformed);
            return Err(DataPathError::Malformed {
                reason: "no destination address",
            });
        };
        let Some(peer) = self
            .allowed_ips
            .lookup_packet(&packet, Direction::Out)
            .and_then(|id| self.peer_by_id(id))
        else {
            bump(&self.counters.no_route);
            trace!("No peer has allowed IPs matching {}", dst);
            return Err(DataPathError::NoRoute {
                addr: dst.to_string(),
            });
        };
        if peer.endpoint().is_none() {
            bump(&self.counters.no_endpoint);
            debug!("No valid endpoint has been configured or discovered for peer {}", peer);
            return Err(DataPathError::NoEndpoint);
        }

        if peer.staged.push(packet) {
            bump(&self.counters.queue_overflow);
        }
        self.send_staged(&peer).await;
        Ok(())
    }

    /// Hand every staged packet to the encryption workers, or start a
    /// handshake if no usable session exists
    pub(crate) async fn send_staged(&self, peer: &Arc<Peer>) {
        if peer.is_dead() {
            peer.staged.purge();
            return;
        }
        if peer.staged.is_empty() {
            return;
        }
        let now = Instant::now();
        let keypair = peer
            .keypairs
            .lock()
            .current()
            .filter(|keypair| keypair.can_send(now))
            .cloned();
        let Some(keypair) = keypair else {
            self.send_handshake_initiation(peer, false).await;
            return;
        };

        let mut jobs = Vec::new();
        let mut exhausted = false;
        {
            let _submission = peer.submission.lock();
            // Counted before the liveness check so removal cannot miss us
            peer.begin_job();
            if peer.is_dead() {
                peer.staged.purge();
                peer.end_job();
                return;
            }
            let mut packets = peer.staged.drain().into_iter();
            while let Some(plaintext) = packets.next() {
                let slot = match peer.outbound.push() {
                    Ok(slot) => slot,
                    Err(_) => {
                        bump(&self.counters.queue_overflow);
                        continue;
                    }
                };
                match keypair.next_nonce() {
                    Ok(counter) => {
                        peer.begin_job();
                        jobs.push(Job::Encrypt(EncryptJob {
                            peer: peer.clone(),
                            keypair: keypair.clone(),
                            counter,
                            plaintext,
                            slot,
                        }));
                    }
                    Err(_) => {
                        slot.fail();
                        let mut rest = vec![plaintext];
                        rest.extend(packets);
                        peer.staged.requeue_front(rest);
                        exhausted = true;
                        break;
                    }
                }
            }
            peer.end_job();
        }

        for job in jobs {
            self.encrypt_pool.submit(job);
        }

        if exhausted {
            self.send_handshake_initiation(peer, false).await;
            return;
        }

        let needs_rekey = peer
            .keypairs
            .lock()
            .current()
            .is_some_and(|current| current.needs_rekey_on_send(now));
        if needs_rekey {
            self.send_handshake_initiation(peer, false).await;
        }
    }

    pub(crate) async fn send_keepalive(&self, peer: &Arc<Peer>) {
        if peer.staged.push_if_empty(Vec::new()) {
            trace!("Sending keepalive packet to peer {}", peer);
        }
        self.send_staged(peer).await;
    }

    /// Transmit the encrypted messages that are ready, in order
    async fn deliver_outbound(&self, peer: &Arc<Peer>) {
        let _delivery = peer.outbound_delivery.lock().await;
        let ready = peer.outbound.drain_ready();
        if ready.is_empty() || peer.is_dead() {
            return;
        }
        if !self.is_up() {
            self.drop_while_down(peer, ready.len());
            return;
        }
        let Some(endpoint) = peer.endpoint() else {
            bump(&self.counters.no_endpoint);
            return;
        };

        peer.timers.any_authenticated_packet_traversal();
        peer.timers.any_authenticated_packet_sent();
        let total = ready.len();
        for (sent, message) in ready.into_iter().enumerate() {
            if !self.is_up() {
                self.drop_while_down(peer, total - sent);
                return;
            }
            let is_keepalive = message.len() == TransportHeader::MIN_SIZE;
            match self.transport.send(&endpoint, &message).await {
                Ok(()) => {
                    peer.add_tx_bytes(message.len());
                    bump(&self.counters.tx_packets);
                    if !is_keepalive {
                        peer.timers.data_sent();
                    }
                }
                Err(e) => trace!("Failed to send data packet to peer {}: {}", peer, e),
            }
        }
    }

    fn drop_while_down(&self, peer: &Peer, count: usize) {
        self.counters
            .interface_down
            .fetch_add(count as u64, Ordering::Relaxed);
        trace!("Interface down, dropping {} packets for peer {}", count, peer);
    }

    /// Look up the session for a transport message and queue it for decryption
    pub(crate) fn receive_data(&self, datagram: Vec<u8>, from: Endpoint) {
        let Ok(header) = TransportHeader::from_bytes(&datagram) else {
            bump(&self.counters.malformed);
            return;
        };
        let Some((peer, keypair)) = self
            .index
            .lookup(header.receiver_index)
            .and_then(|entry| Some((self.peer_by_id(entry.peer)?, entry.keypair()?)))
        else {
            bump(&self.counters.unknown_index);
            trace!("Data packet for unknown index {}", header.receiver_index);
            return;
        };
        // Counted before the liveness check so removal cannot miss us
        peer.begin_job();
        if peer.is_dead() {
            peer.end_job();
            return;
        }
        if !keypair.can_receive(Instant::now()) || header.counter >= REJECT_AFTER_MESSAGES {
            trace!("Data packet from peer {} on an expired session", peer);
            peer.end_job();
            return;
        }

        let slot = match peer.inbound.push() {
            Ok(slot) => slot,
            Err(_) => {
                bump(&self.counters.queue_overflow);
                peer.end_job();
                return;
            }
        };
        self.decrypt_pool.submit(Job::Decrypt(DecryptJob {
            peer,
            keypair,
            counter: header.counter,
            datagram,
            endpoint: from,
            slot,
        }));
    }

    /// Validate and hand decrypted packets to the sink, in order
    async fn deliver_inbound(&self, peer: &Arc<Peer>) {
        let mut confirmed = false;
        {
            let _delivery = peer.inbound_delivery.lock().await;
            let ready = peer.inbound.drain_ready();
            let total = ready.len();
            for (handled, packet) in ready.into_iter().enumerate() {
                if peer.is_dead() {
                    break;
                }
                if !self.is_up() {
                    self.drop_while_down(peer, total - handled);
                    break;
                }
                if packet.keypair.validate_counter(packet.counter).is_err() {
                    bump(&self.counters.replays);
                    trace!(
                        "Packet has invalid nonce {} for peer {}",
                        packet.counter,
                        peer
                    );
                    continue;
                }

                peer.set_endpoint(packet.endpoint);
                let promoted = peer.keypairs.lock().confirm(&packet.keypair);
                if let Some(released) = promoted {
                    self.release_keypairs(peer, released);
                    self.handshake_completed(peer);
                    confirmed = true;
                }

                peer.add_rx_bytes(packet.wire_len);
                bump(&self.counters.rx_packets);
                peer.timers.any_authenticated_packet_received();
                peer.timers.any_authenticated_packet_traversal();
                self.keep_key_fresh_on_receive(peer).await;

                if packet.plaintext.is_empty() {
                    trace!("Receiving keepalive packet from peer {}", peer);
                    continue;
                }
                peer.timers.data_received();

                let Some(plaintext) = packet::trim_padding(packet.plaintext) else {
                    bump(&self.counters.malformed);
                    trace!("Packet from peer {} has an invalid IP header", peer);
                    continue;
                };
                if self.allowed_ips.lookup_packet(&plaintext, Direction::In) != Some(peer.id) {
                    bump(&self.counters.spoofed);
                    trace!(
                        "Packet from peer {} has disallowed source {:?}",
                        peer,
                        packet::source_address(&plaintext)
                    );
                    continue;
                }
                if let Err(e) = self.sink.deliver(plaintext).await {
                    debug!("Failed to deliver packet from peer {}: {}", peer, e);
                }
            }
        }

        // A freshly confirmed session flushes anything staged meanwhile
        if confirmed {
            self.send_staged(peer).await;
        }
    }

    async fn keep_key_fresh_on_receive(&self, peer: &Arc<Peer>) {
        if peer.sent_lastminute_handshake.load(Ordering::Relaxed) {
            return;
        }
        let now = Instant::now();
        let needs_rekey = peer
            .keypairs
            .lock()
            .current()
            .is_some_and(|current| current.can_send(now) && current.needs_rekey_on_receive(now));
        if needs_rekey {
            peer.sent_lastminute_handshake.store(true, Ordering::Relaxed);
            self.send_handshake_initiation(peer, false).await;
        }
    }
}
