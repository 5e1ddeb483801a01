//! Cookie handling for WireGuard DoS protection
//!
//! Every handshake message carries MAC1, keyed by the receiver's public key.
//! When a responder is under load it answers initiations that lack a valid
//! MAC2 with a Cookie Reply instead of processing them. The sender must then
//! key MAC2 with the decrypted cookie on subsequent handshake attempts.
//!
//! [`CookieChecker`] is the device-wide receiving side. [`CookieState`] is
//! the per-peer sending side.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use parking_lot::RwLock;
use rand::RngCore;
use tokio::time::Instant;
use zeroize::Zeroize;

use crate::crypto::{aead, blake2s, constant_time_eq, noise};
use crate::error::{CryptoError, HandshakeError};
use crate::protocol::messages::{handshake_sender_index, mac_regions, CookieReply, MAC_LEN};
use crate::protocol::ratelimit::{RateLimitConfig, RateLimiter};

/// Lifetime of the responder's cookie secret
pub const COOKIE_SECRET_MAX_AGE: Duration = Duration::from_secs(120);

/// Allowance for a cookie's trip back to the initiator
pub const COOKIE_SECRET_LATENCY: Duration = Duration::from_secs(5);

/// Outcome of MAC validation for an incoming handshake message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieVerdict {
    /// Process the handshake
    Accept,
    /// MAC1 is valid but the message must prove its source; send a cookie reply
    NeedsCookie,
    /// Drop silently
    Reject,
}

struct CheckerKeys {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
}

struct Secret {
    value: [u8; 32],
    birth: Option<Instant>,
}

impl Secret {
    fn fresh() -> Self {
        let mut value = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut value);
        Self {
            value,
            birth: Some(Instant::now()),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.birth
            .is_some_and(|birth| now.saturating_duration_since(birth) < COOKIE_SECRET_MAX_AGE)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

/// Device-wide MAC1/MAC2 validation and cookie reply generation
pub struct CookieChecker {
    keys: RwLock<Option<CheckerKeys>>,
    secret: RwLock<Secret>,
    limiter: RateLimiter,
}

impl CookieChecker {
    pub fn new(local_public: Option<&[u8; 32]>) -> Self {
        let checker = Self {
            keys: RwLock::new(None),
            secret: RwLock::new(Secret::fresh()),
            limiter: RateLimiter::new(RateLimitConfig::default()),
        };
        checker.set_identity(local_public);
        checker
    }

    /// Rederive the MAC1 and cookie-encryption keys from our public key
    pub fn set_identity(&self, local_public: Option<&[u8; 32]>) {
        *self.keys.write() = local_public.map(|public| CheckerKeys {
            mac1_key: noise::mac1_key(public),
            cookie_key: noise::cookie_key(public),
        });
    }

    /// Replace the cookie secret. Cookies issued under the old one stop validating.
    pub fn rotate_secret(&self) {
        *self.secret.write() = Secret::fresh();
    }

    /// Zeroize the secret and forget rate limiter state
    pub fn clear(&self) {
        let mut secret = self.secret.write();
        secret.value.zeroize();
        secret.birth = None;
        self.limiter.clear();
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn make_cookie(secret: &[u8; 32], src: &SocketAddr) -> [u8; MAC_LEN] {
        let port = src.port().to_be_bytes();
        match src.ip() {
            IpAddr::V4(ip) => blake2s::mac(secret, &[&ip.octets(), &port]),
            IpAddr::V6(ip) => blake2s::mac(secret, &[&ip.octets(), &port]),
        }
    }

    pub fn validate_packet(&self, msg: &[u8], src: SocketAddr, under_load: bool) -> CookieVerdict {
        let Some((mac1_data, mac1, mac2_data, mac2)) = mac_regions(msg) else {
            return CookieVerdict::Reject;
        };

        {
            let keys = self.keys.read();
            let Some(keys) = keys.as_ref() else {
                return CookieVerdict::Reject;
            };
            let expected = blake2s::mac(&keys.mac1_key, &[mac1_data]);
            if !constant_time_eq(&expected, mac1) {
                return CookieVerdict::Reject;
            }
        }

        if !under_load {
            return CookieVerdict::Accept;
        }

        let now = Instant::now();
        let cookie = {
            let secret = self.secret.read();
            if !secret.is_fresh(now) {
                return CookieVerdict::NeedsCookie;
            }
            Self::make_cookie(&secret.value, &src)
        };
        let expected = blake2s::mac(&cookie, &[mac2_data]);
        if !constant_time_eq(&expected, mac2) {
            return CookieVerdict::NeedsCookie;
        }

        if self.limiter.allow(src.ip(), now) {
            CookieVerdict::Accept
        } else {
            CookieVerdict::Reject
        }
    }

    /// Build the stateless cookie reply for a handshake message from `src`
    pub fn create_reply(&self, msg: &[u8], src: SocketAddr) -> Result<CookieReply, HandshakeError> {
        let too_short = HandshakeError::InvalidMessageLength {
            expected: 8 + 2 * MAC_LEN,
            got: msg.len(),
        };
        let (Some((_, mac1, _, _)), Some(receiver_index)) =
            (mac_regions(msg), handshake_sender_index(msg))
        else {
            return Err(too_short);
        };

        let now = Instant::now();
        let cookie = {
            let fresh = self.secret.read().is_fresh(now);
            if !fresh {
                self.rotate_secret();
            }
            Self::make_cookie(&self.secret.read().value, &src)
        };

        let cookie_key = self
            .keys
            .read()
            .as_ref()
            .map(|keys| keys.cookie_key)
            .ok_or(HandshakeError::NoIdentity)?;

        let mut nonce = [0u8; aead::XNONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed =
            aead::xseal(&cookie_key, &nonce, &cookie, mac1).map_err(HandshakeError::Crypto)?;
        let encrypted_cookie: [u8; 32] = sealed
            .try_into()
            .map_err(|_| HandshakeError::Crypto(CryptoError::Encryption))?;

        Ok(CookieReply {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

/// Per-peer MAC generation and received-cookie storage
pub struct CookieState {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
    /// Decrypted cookie value (16 bytes)
    cookie: Option<[u8; MAC_LEN]>,
    /// When the cookie was received
    received_at: Option<Instant>,
    /// MAC1 of the last handshake message we sent, the AAD of its cookie reply
    last_mac1: Option<[u8; MAC_LEN]>,
}

impl CookieState {
    pub fn new(peer_public: &[u8; 32]) -> Self {
        Self {
            mac1_key: noise::mac1_key(peer_public),
            cookie_key: noise::cookie_key(peer_public),
            cookie: None,
            received_at: None,
            last_mac1: None,
        }
    }

    /// Check if we have a valid (non-expired) cookie
    pub fn has_valid_cookie(&self) -> bool {
        match (self.cookie, self.received_at) {
            (Some(_), Some(received)) => {
                received.elapsed() < COOKIE_SECRET_MAX_AGE - COOKIE_SECRET_LATENCY
            }
            _ => false,
        }
    }

    /// Fill MAC1 and, when a cookie is held, MAC2 into a serialized handshake message
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        let len = msg.len();
        if len < 2 * MAC_LEN {
            return;
        }
        let mac1_off = len - 2 * MAC_LEN;
        let mac2_off = len - MAC_LEN;

        let mac1 = blake2s::mac(&self.mac1_key, &[&msg[..mac1_off]]);
        msg[mac1_off..mac2_off].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        let mac2 = match self.cookie {
            Some(cookie) if self.has_valid_cookie() => blake2s::mac(&cookie, &[&msg[..mac2_off]]),
            _ => [0u8; MAC_LEN],
        };
        msg[mac2_off..].copy_from_slice(&mac2);
    }

    /// Decrypt a Cookie Reply and store the cookie
    pub fn consume_reply(&mut self, reply: &CookieReply) -> Result<(), HandshakeError> {
        let last_mac1 = self.last_mac1.ok_or(HandshakeError::UnexpectedState {
            state: "no handshake sent",
        })?;

        let decrypted = aead::xopen(&self.cookie_key, &reply.nonce, &reply.encrypted_cookie, &last_mac1)?;
        let cookie: [u8; MAC_LEN] = decrypted
            .as_slice()
            .try_into()
            .map_err(|_| HandshakeError::Decryption)?;

        self.cookie = Some(cookie);
        self.received_at = Some(Instant::now());
        // A reply is only honoured once per message sent
        self.last_mac1 = None;

        tracing::debug!(
            "Stored new cookie (valid for {}s)",
            (COOKIE_SECRET_MAX_AGE - COOKIE_SECRET_LATENCY).as_secs()
        );
        Ok(())
    }

    /// Clear the stored cookie
    pub fn clear(&mut self) {
        if let Some(cookie) = self.cookie.as_mut() {
            cookie.zeroize();
        }
        self.cookie = None;
        self.received_at = None;
        self.last_mac1 = None;
    }
}
