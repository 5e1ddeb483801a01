//! WireGuard protocol implementation
//!
//! This module contains the core protocol components:
//! - Message wire formats
//! - Handshake logic (Noise IKpsk2)
//! - Cookie/DoS protection and per-source rate limiting
//! - Transport encryption and replay protection
//! - Session rotation and timing constants

pub mod cookie;
pub mod handshake;
pub mod messages;
pub mod ratelimit;
pub mod session;
pub mod transport;

pub use cookie::{CookieChecker, CookieState, CookieVerdict};
pub use handshake::{consume_initiation, ConsumedInitiation, Handshake, HandshakeStage, SessionKeys, StaticIdentity};
pub use messages::{
    CookieReply, HandshakeInitiation, HandshakeResponse, MessageType, TransportHeader,
};
pub use session::{KeypairSet, PeerState};
pub use transport::{Keypair, ReplayWindow};
