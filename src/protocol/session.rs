//! Session state management for WireGuard
//!
//! Protocol timing constants, the per-peer current/previous/next keypair
//! rotation, and the peer lifecycle state derived from them.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::handshake::HandshakeStage;
use crate::protocol::transport::Keypair;

/// Initiate rekey after this many seconds
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Reject packets from sessions older than this
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Give up on a handshake after retrying for this long
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);

/// Retransmit an unanswered initiation after this long
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound of the random delay added to handshake timers
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(333);

/// Keepalive timeout - send keepalive if no packet sent within this time
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Retransmissions before a handshake attempt is abandoned
pub const MAX_TIMER_HANDSHAKES: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;

/// Start a new handshake when sent data has gone unanswered this long
pub const NEW_HANDSHAKE_TIMEOUT: Duration =
    Duration::from_secs(KEEPALIVE_TIMEOUT.as_secs() + REKEY_TIMEOUT.as_secs());

/// Erase all key material after this long without a new session
pub const ZERO_KEYS_TIMEOUT: Duration = Duration::from_secs(REJECT_AFTER_TIME.as_secs() * 3);

/// Conceptual peer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    HandshakeInitiated,
    HandshakeResponded,
    SessionActive,
    SessionExpiring,
}

impl PeerState {
    pub fn derive(stage: HandshakeStage, keypairs: &KeypairSet, now: Instant) -> Self {
        if let Some(current) = keypairs.current() {
            if current.can_send(now) {
                if current.age(now) >= REKEY_AFTER_TIME {
                    return PeerState::SessionExpiring;
                }
                return PeerState::SessionActive;
            }
        }
        match stage {
            HandshakeStage::CreatedInitiation => PeerState::HandshakeInitiated,
            HandshakeStage::ConsumedInitiation | HandshakeStage::CreatedResponse => {
                PeerState::HandshakeResponded
            }
            _ if keypairs.next().is_some() => PeerState::HandshakeResponded,
            _ if keypairs.current().is_some() || keypairs.previous().is_some() => {
                PeerState::SessionExpiring
            }
            _ => PeerState::Idle,
        }
    }
}

/// The up-to-three live sessions of one peer.
///
/// `current` encrypts new traffic. `previous` keeps decrypting packets
/// already in flight across a rekey. `next` is a responder-side session
/// waiting for the initiator's first data packet to confirm it.
#[derive(Debug, Default)]
pub struct KeypairSet {
    current: Option<Arc<Keypair>>,
    previous: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

impl KeypairSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Arc<Keypair>> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&Arc<Keypair>> {
        self.previous.as_ref()
    }

    pub fn next(&self) -> Option<&Arc<Keypair>> {
        self.next.as_ref()
    }

    /// Install a freshly derived session. Returns the sessions that dropped out.
    pub fn install(&mut self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut released = Vec::new();
        if keypair.is_initiator {
            if let Some(next) = self.next.take() {
                released.extend(self.previous.replace(next));
                released.extend(self.current.take());
            } else {
                released.extend(self.previous.take());
                self.previous = self.current.take();
            }
            self.current = Some(keypair);
        } else {
            released.extend(self.next.replace(keypair));
            released.extend(self.previous.take());
        }
        released
    }

    /// Note an authenticated packet on `keypair`. If it is the pending
    /// `next` session, promote it to current and return the sessions that
    /// dropped out; `None` means nothing changed.
    pub fn confirm(&mut self, keypair: &Arc<Keypair>) -> Option<Vec<Arc<Keypair>>> {
        let is_next = self
            .next
            .as_ref()
            .is_some_and(|next| Arc::ptr_eq(next, keypair));
        if !is_next {
            return None;
        }
        let released = self.previous.take().into_iter().collect();
        self.previous = self.current.take();
        self.current = self.next.take();
        Some(released)
    }

    /// Drop every session
    pub fn clear(&mut self) -> Vec<Arc<Keypair>> {
        [self.current.take(), self.previous.take(), self.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Keypair>> {
        self.current
            .iter()
            .chain(self.previous.iter())
            .chain(self.next.iter())
    }
}
