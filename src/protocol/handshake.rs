//! WireGuard handshake implementation
//!
//! Implements the Noise IKpsk2 handshake pattern for key exchange. A
//! [`Handshake`] lives inside each peer and plays either role: it creates an
//! initiation and consumes the response, or accepts an initiation and creates
//! the response. MAC1/MAC2 are not handled here; see [`crate::protocol::cookie`].

use std::time::Duration;

use tai64::Tai64N;
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::noise::SymmetricState;
use crate::crypto::x25519;
use crate::error::HandshakeError;
use crate::protocol::messages::{HandshakeInitiation, HandshakeResponse};

/// Minimum spacing between accepted initiations from one peer (50 per second)
pub const INITIATION_MIN_INTERVAL: Duration = Duration::from_millis(1000 / 50);

/// Length of a TAI64N timestamp
pub const TIMESTAMP_LEN: usize = 12;

/// The local static keypair
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticIdentity {
    private: [u8; 32],
    public: [u8; 32],
}

impl StaticIdentity {
    pub fn new(private: [u8; 32]) -> Self {
        let public = x25519::public_key(&private);
        Self { private, public }
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn private(&self) -> &[u8; 32] {
        &self.private
    }
}

/// Progress of the handshake held by one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Zeroed,
    CreatedInitiation,
    ConsumedInitiation,
    CreatedResponse,
    ConsumedResponse,
}

impl HandshakeStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Zeroed => "zeroed",
            Self::CreatedInitiation => "created-initiation",
            Self::ConsumedInitiation => "consumed-initiation",
            Self::CreatedResponse => "created-response",
            Self::ConsumedResponse => "consumed-response",
        }
    }
}

/// Transport keys derived when a handshake completes
pub struct SessionKeys {
    pub local_index: u32,
    pub remote_index: u32,
    pub sending_key: [u8; 32],
    pub receiving_key: [u8; 32],
    pub is_initiator: bool,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.sending_key.zeroize();
        self.receiving_key.zeroize();
    }
}

/// An initiation that authenticated against our identity but has not yet
/// been checked against the sending peer's replay and flood state.
pub struct ConsumedInitiation {
    pub remote_static: [u8; 32],
    pub sender_index: u32,
    pub(crate) remote_ephemeral: [u8; 32],
    pub(crate) timestamp: [u8; TIMESTAMP_LEN],
    symmetric: SymmetricState,
}

impl Drop for ConsumedInitiation {
    fn drop(&mut self) {
        self.symmetric.zeroize();
    }
}

/// Authenticate an initiation addressed to `identity`.
///
/// Performs both DH operations and decrypts the sender's static key and
/// timestamp. The caller resolves the sender by `remote_static` and hands
/// the result to that peer's [`Handshake::accept_initiation`].
pub fn consume_initiation(
    identity: &StaticIdentity,
    msg: &HandshakeInitiation,
) -> Result<ConsumedInitiation, HandshakeError> {
    let mut symmetric = SymmetricState::new(identity.public());

    // e
    symmetric.mix_hash(&msg.ephemeral_public);
    symmetric.mix_chain(&msg.ephemeral_public);

    // es
    let es = x25519::dh(identity.private(), &msg.ephemeral_public).ok_or(HandshakeError::WeakKey)?;
    let key = symmetric.mix_key(&es);

    // s
    let static_plain = symmetric.decrypt_and_hash(&key, &msg.encrypted_static)?;
    let remote_static: [u8; 32] = static_plain
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::Decryption)?;

    // ss
    let ss = x25519::dh(identity.private(), &remote_static).ok_or(HandshakeError::WeakKey)?;
    let key = symmetric.mix_key(&ss);

    // {t}
    let ts_plain = symmetric.decrypt_and_hash(&key, &msg.encrypted_timestamp)?;
    let timestamp: [u8; TIMESTAMP_LEN] = ts_plain
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::Decryption)?;

    Ok(ConsumedInitiation {
        remote_static,
        sender_index: msg.sender_index,
        remote_ephemeral: msg.ephemeral_public,
        timestamp,
        symmetric,
    })
}

/// Per-peer handshake state
pub struct Handshake {
    remote_static: [u8; 32],
    precomputed_ss: Option<[u8; 32]>,
    psk: [u8; 32],
    stage: HandshakeStage,
    symmetric: SymmetricState,
    ephemeral_private: [u8; 32],
    remote_ephemeral: [u8; 32],
    local_index: u32,
    remote_index: u32,
    latest_timestamp: [u8; TIMESTAMP_LEN],
    last_initiation_consumption: Option<Instant>,
}

impl Handshake {
    pub fn new(
        remote_static: [u8; 32],
        psk: Option<[u8; 32]>,
        identity: Option<&StaticIdentity>,
    ) -> Self {
        let mut handshake = Self {
            remote_static,
            precomputed_ss: None,
            psk: psk.unwrap_or([0u8; 32]),
            stage: HandshakeStage::Zeroed,
            symmetric: SymmetricState::default(),
            ephemeral_private: [0u8; 32],
            remote_ephemeral: [0u8; 32],
            local_index: 0,
            remote_index: 0,
            latest_timestamp: [0u8; TIMESTAMP_LEN],
            last_initiation_consumption: None,
        };
        handshake.set_identity(identity);
        handshake
    }

    /// Recompute the static-static DH after the local key changes
    pub fn set_identity(&mut self, identity: Option<&StaticIdentity>) {
        if let Some(ss) = self.precomputed_ss.as_mut() {
            ss.zeroize();
        }
        self.precomputed_ss =
            identity.and_then(|id| x25519::dh(id.private(), &self.remote_static));
    }

    pub fn set_psk(&mut self, psk: Option<[u8; 32]>) {
        self.psk.zeroize();
        self.psk = psk.unwrap_or([0u8; 32]);
    }

    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Index of the in-progress handshake, if any
    pub fn local_index(&self) -> Option<u32> {
        match self.stage {
            HandshakeStage::CreatedInitiation | HandshakeStage::CreatedResponse => {
                Some(self.local_index)
            }
            _ => None,
        }
    }

    /// Build an initiation. MACs are left zero for the cookie layer to fill.
    pub fn create_initiation(
        &mut self,
        identity: Option<&StaticIdentity>,
        local_index: u32,
    ) -> Result<HandshakeInitiation, HandshakeError> {
        let identity = identity.ok_or(HandshakeError::NoIdentity)?;
        let ss = self.precomputed_ss.ok_or(HandshakeError::WeakKey)?;

        self.clear();
        let mut symmetric = SymmetricState::new(&self.remote_static);
        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();

        // e
        symmetric.mix_hash(&ephemeral_public);
        symmetric.mix_chain(&ephemeral_public);

        // es
        let es = x25519::dh(&ephemeral_private, &self.remote_static)
            .ok_or(HandshakeError::WeakKey)?;
        let key = symmetric.mix_key(&es);

        // s
        let encrypted_static = symmetric.encrypt_and_hash::<48>(&key, identity.public())?;

        // ss
        let key = symmetric.mix_key(&ss);

        // {t}
        let timestamp = Tai64N::now().to_bytes();
        let encrypted_timestamp = symmetric.encrypt_and_hash::<28>(&key, &timestamp)?;

        self.symmetric = symmetric;
        self.ephemeral_private = ephemeral_private;
        self.local_index = local_index;
        self.stage = HandshakeStage::CreatedInitiation;

        Ok(HandshakeInitiation {
            sender_index: local_index,
            ephemeral_public,
            encrypted_static,
            encrypted_timestamp,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Apply replay and flood protection, then adopt the initiation.
    pub fn accept_initiation(
        &mut self,
        consumed: ConsumedInitiation,
        now: Instant,
    ) -> Result<(), HandshakeError> {
        if consumed.timestamp <= self.latest_timestamp {
            return Err(HandshakeError::StaleTimestamp);
        }
        if let Some(last) = self.last_initiation_consumption {
            if now.saturating_duration_since(last) < INITIATION_MIN_INTERVAL {
                return Err(HandshakeError::Flood);
            }
        }

        self.clear();
        self.latest_timestamp = consumed.timestamp;
        self.last_initiation_consumption = Some(now);
        self.symmetric = consumed.symmetric.clone();
        self.remote_ephemeral = consumed.remote_ephemeral;
        self.remote_index = consumed.sender_index;
        self.stage = HandshakeStage::ConsumedInitiation;
        Ok(())
    }

    /// Build the response to an accepted initiation
    pub fn create_response(&mut self, local_index: u32) -> Result<HandshakeResponse, HandshakeError> {
        if self.stage != HandshakeStage::ConsumedInitiation {
            return Err(HandshakeError::UnexpectedState {
                state: self.stage.name(),
            });
        }

        let mut symmetric = self.symmetric.clone();
        let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();

        // e
        symmetric.mix_hash(&ephemeral_public);
        symmetric.mix_chain(&ephemeral_public);

        // ee
        let ee = x25519::dh(&ephemeral_private, &self.remote_ephemeral)
            .ok_or(HandshakeError::WeakKey)?;
        symmetric.mix_chain(&ee);

        // se
        let se = x25519::dh(&ephemeral_private, &self.remote_static)
            .ok_or(HandshakeError::WeakKey)?;
        symmetric.mix_chain(&se);

        // psk
        let key = symmetric.mix_key_and_hash(&self.psk);

        // {}
        let encrypted_nothing = symmetric.encrypt_and_hash::<16>(&key, &[])?;

        self.symmetric = symmetric;
        self.ephemeral_private = ephemeral_private;
        self.local_index = local_index;
        self.stage = HandshakeStage::CreatedResponse;

        Ok(HandshakeResponse {
            sender_index: local_index,
            receiver_index: self.remote_index,
            ephemeral_public,
            encrypted_nothing,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Consume the response to our initiation. State is only committed once
    /// the empty payload authenticates.
    pub fn consume_response(
        &mut self,
        identity: &StaticIdentity,
        msg: &HandshakeResponse,
    ) -> Result<(), HandshakeError> {
        if self.stage != HandshakeStage::CreatedInitiation {
            return Err(HandshakeError::UnexpectedState {
                state: self.stage.name(),
            });
        }
        if msg.receiver_index != self.local_index {
            return Err(HandshakeError::UnknownIndex {
                index: msg.receiver_index,
            });
        }

        let mut symmetric = self.symmetric.clone();

        // e
        symmetric.mix_hash(&msg.ephemeral_public);
        symmetric.mix_chain(&msg.ephemeral_public);

        // ee
        let ee = x25519::dh(&self.ephemeral_private, &msg.ephemeral_public)
            .ok_or(HandshakeError::WeakKey)?;
        symmetric.mix_chain(&ee);

        // se
        let se = x25519::dh(identity.private(), &msg.ephemeral_public)
            .ok_or(HandshakeError::WeakKey)?;
        symmetric.mix_chain(&se);

        // psk
        let key = symmetric.mix_key_and_hash(&self.psk);

        // {}
        symmetric.decrypt_and_hash(&key, &msg.encrypted_nothing)?;

        self.symmetric = symmetric;
        self.remote_ephemeral = msg.ephemeral_public;
        self.remote_index = msg.sender_index;
        self.stage = HandshakeStage::ConsumedResponse;
        Ok(())
    }

    /// Derive transport keys and reset the handshake
    pub fn begin_session(&mut self) -> Result<SessionKeys, HandshakeError> {
        let (initiator_send, responder_send) = self.symmetric.split();
        let keys = match self.stage {
            HandshakeStage::ConsumedResponse => SessionKeys {
                local_index: self.local_index,
                remote_index: self.remote_index,
                sending_key: initiator_send,
                receiving_key: responder_send,
                is_initiator: true,
            },
            HandshakeStage::CreatedResponse => SessionKeys {
                local_index: self.local_index,
                remote_index: self.remote_index,
                sending_key: responder_send,
                receiving_key: initiator_send,
                is_initiator: false,
            },
            stage => {
                return Err(HandshakeError::UnexpectedState { state: stage.name() });
            }
        };
        self.clear();
        Ok(keys)
    }

    /// Forget the in-progress handshake. Replay state survives.
    pub fn clear(&mut self) {
        self.symmetric.zeroize();
        self.ephemeral_private.zeroize();
        self.remote_ephemeral.zeroize();
        self.local_index = 0;
        self.remote_index = 0;
        self.stage = HandshakeStage::Zeroed;
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.clear();
        self.psk.zeroize();
        if let Some(ss) = self.precomputed_ss.as_mut() {
            ss.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Side {
        identity: StaticIdentity,
        handshake: Handshake,
    }

    fn pair(psk_a: Option<[u8; 32]>, psk_b: Option<[u8; 32]>) -> (Side, Side) {
        let (a_priv, a_pub) = x25519::generate_keypair();
        let (b_priv, b_pub) = x25519::generate_keypair();
        let a_id = StaticIdentity::new(a_priv);
        let b_id = StaticIdentity::new(b_priv);
        let a = Side {
            handshake: Handshake::new(b_pub, psk_a, Some(&a_id)),
            identity: a_id,
        };
        let b = Side {
            handshake: Handshake::new(a_pub, psk_b, Some(&b_id)),
            identity: b_id,
        };
        (a, b)
    }

    #[test]
    fn test_full_handshake_derives_matching_keys() {
        let (mut a, mut b) = pair(Some([7u8; 32]), Some([7u8; 32]));

        let init = a.handshake.create_initiation(Some(&a.identity), 11).unwrap();
        assert_eq!(a.handshake.stage(), HandshakeStage::CreatedInitiation);
        assert_eq!(a.handshake.local_index(), Some(11));

        let consumed = consume_initiation(&b.identity, &init).unwrap();
        assert_eq!(&consumed.remote_static, a.identity.public());
        assert_eq!(consumed.sender_index, 11);
        b.handshake.accept_initiation(consumed, Instant::now()).unwrap();

        let resp = b.handshake.create_response(22).unwrap();
        assert_eq!(resp.receiver_index, 11);
        let b_keys = b.handshake.begin_session().unwrap();
        assert_eq!(b.handshake.stage(), HandshakeStage::Zeroed);

        a.handshake.consume_response(&a.identity, &resp).unwrap();
        let a_keys = a.handshake.begin_session().unwrap();

        assert!(a_keys.is_initiator);
        assert!(!b_keys.is_initiator);
        assert_eq!(a_keys.sending_key, b_keys.receiving_key);
        assert_eq!(a_keys.receiving_key, b_keys.sending_key);
        assert_ne!(a_keys.sending_key, a_keys.receiving_key);
        assert_eq!((a_keys.local_index, a_keys.remote_index), (11, 22));
        assert_eq!((b_keys.local_index, b_keys.remote_index), (22, 11));
    }

    #[test]
    fn test_psk_mismatch_fails_response() {
        let (mut a, mut b) = pair(Some([1u8; 32]), Some([2u8; 32]));
        let init = a.handshake.create_initiation(Some(&a.identity), 1).unwrap();
        let consumed = consume_initiation(&b.identity, &init).unwrap();
        b.handshake.accept_initiation(consumed, Instant::now()).unwrap();
        let resp = b.handshake.create_response(2).unwrap();

        assert!(matches!(
            a.handshake.consume_response(&a.identity, &resp),
            Err(HandshakeError::Decryption)
        ));
        // Failed response leaves the initiation usable
        assert_eq!(a.handshake.stage(), HandshakeStage::CreatedInitiation);
    }

    #[test]
    fn test_initiation_for_other_identity_rejected() {
        let (mut a, _) = pair(None, None);
        let (stranger, _) = x25519::generate_keypair();
        let init = a.handshake.create_initiation(Some(&a.identity), 1).unwrap();
        assert!(consume_initiation(&StaticIdentity::new(stranger), &init).is_err());
    }

    #[test]
    fn test_replayed_initiation_rejected() {
        let (mut a, mut b) = pair(None, None);
        let init = a.handshake.create_initiation(Some(&a.identity), 1).unwrap();
        let now = Instant::now();

        let first = consume_initiation(&b.identity, &init).unwrap();
        b.handshake.accept_initiation(first, now).unwrap();

        let replay = consume_initiation(&b.identity, &init).unwrap();
        assert!(matches!(
            b.handshake.accept_initiation(replay, now + Duration::from_secs(1)),
            Err(HandshakeError::StaleTimestamp)
        ));
    }

    #[test]
    fn test_initiation_flood_rejected() {
        let (mut a, mut b) = pair(None, None);
        let now = Instant::now();

        let init = a.handshake.create_initiation(Some(&a.identity), 1).unwrap();
        let first = consume_initiation(&b.identity, &init).unwrap();
        b.handshake.accept_initiation(first, now).unwrap();

        let init = a.handshake.create_initiation(Some(&a.identity), 2).unwrap();
        let mut second = consume_initiation(&b.identity, &init).unwrap();
        second.timestamp = [0xff; TIMESTAMP_LEN];
        assert!(matches!(
            b.handshake
                .accept_initiation(second, now + Duration::from_millis(5)),
            Err(HandshakeError::Flood)
        ));

        let mut third = consume_initiation(&b.identity, &init).unwrap();
        third.timestamp = [0xff; TIMESTAMP_LEN];
        b.handshake
            .accept_initiation(third, now + INITIATION_MIN_INTERVAL)
            .unwrap();
    }

    #[test]
    fn test_response_with_wrong_index_rejected() {
        let (mut a, mut b) = pair(None, None);
        let init = a.handshake.create_initiation(Some(&a.identity), 5).unwrap();
        let consumed = consume_initiation(&b.identity, &init).unwrap();
        b.handshake.accept_initiation(consumed, Instant::now()).unwrap();
        let mut resp = b.handshake.create_response(6).unwrap();
        resp.receiver_index = 99;
        assert!(matches!(
            a.handshake.consume_response(&a.identity, &resp),
            Err(HandshakeError::UnknownIndex { index: 99 })
        ));
    }

    #[test]
    fn test_no_identity() {
        let (_, peer_pub) = x25519::generate_keypair();
        let mut handshake = Handshake::new(peer_pub, None, None);
        assert!(matches!(
            handshake.create_initiation(None, 1),
            Err(HandshakeError::NoIdentity)
        ));
    }

    #[test]
    fn test_begin_session_requires_completed_handshake() {
        let (mut a, _) = pair(None, None);
        assert!(a.handshake.begin_session().is_err());
        a.handshake.create_initiation(Some(&a.identity), 1).unwrap();
        assert!(a.handshake.begin_session().is_err());
    }
}
