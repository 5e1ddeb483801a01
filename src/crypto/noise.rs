//! Noise IKpsk2 symmetric state for WireGuard
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Chaining key and transcript hash of an in-progress handshake
#[derive(Clone, Default)]
pub struct SymmetricState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// Both sides start from the responder's static public key:
    /// ck = HASH(CONSTRUCTION), h = HASH(HASH(ck || IDENTIFIER) || S_r)
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let chaining_key = blake2s::hash(&[CONSTRUCTION]);
        let h = blake2s::hash(&[&chaining_key, IDENTIFIER]);
        Self {
            chaining_key,
            hash: blake2s::hash(&[&h, responder_static]),
        }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash(&[&self.hash, data]);
    }

    /// ck = KDF1(ck, input); used for ephemeral keys and DH results that do
    /// not produce an encryption key
    pub fn mix_chain(&mut self, input: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, input);
    }

    /// (ck, k) = KDF2(ck, input)
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (ck, key) = blake2s::kdf2(&self.chaining_key, input);
        self.chaining_key = ck;
        key
    }

    /// (ck, t, k) = KDF3(ck, psk); h = HASH(h || t)
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (ck, mut temp, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = ck;
        self.mix_hash(&temp);
        temp.zeroize();
        key
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash<const N: usize>(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<[u8; N], CryptoError> {
        let ciphertext = aead::seal_fixed::<N>(key, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-Open(k, 0, ciphertext, h); h = HASH(h || ciphertext)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::open(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive (initiator_send, responder_send) = KDF2(ck, "")
    pub fn split(&self) -> ([u8; 32], [u8; 32]) {
        blake2s::kdf2(&self.chaining_key, &[])
    }
}

impl Zeroize for SymmetricState {
    fn zeroize(&mut self) {
        self.chaining_key.zeroize();
        self.hash.zeroize();
    }
}

/// mac1_key = HASH(LABEL_MAC1 || public_key)
pub fn mac1_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_MAC1, public_key])
}

/// cookie_key = HASH(LABEL_COOKIE || public_key)
pub fn cookie_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash(&[LABEL_COOKIE, public_key])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_depends_on_responder() {
        let a = SymmetricState::new(&[0u8; 32]);
        let b = SymmetricState::new(&[1u8; 32]);
        assert_eq!(a.chaining_key, b.chaining_key);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_encrypt_decrypt_and_hash_keep_transcripts_equal() {
        let mut sender = SymmetricState::new(&[5u8; 32]);
        let mut receiver = sender.clone();
        let key = sender.mix_key(b"dh result");
        assert_eq!(receiver.mix_key(b"dh result"), key);

        let sealed: [u8; 30] = sender.encrypt_and_hash(&key, b"fourteen bytes").unwrap();
        let opened = receiver.decrypt_and_hash(&key, &sealed).unwrap();
        assert_eq!(opened, b"fourteen bytes");
        assert_eq!(sender.hash, receiver.hash);
    }

    #[test]
    fn test_decrypt_with_diverged_transcript_fails() {
        let mut sender = SymmetricState::new(&[5u8; 32]);
        let mut receiver = sender.clone();
        receiver.mix_hash(b"extra");
        let key = [1u8; 32];
        let sealed: [u8; 16] = sender.encrypt_and_hash(&key, &[]).unwrap();
        assert!(receiver.decrypt_and_hash(&key, &sealed).is_err());
    }

    #[test]
    fn test_psk_mix_changes_hash_and_chain() {
        let mut state = SymmetricState::new(&[2u8; 32]);
        let before = state.clone();
        let key = state.mix_key_and_hash(&[0u8; 32]);
        assert_ne!(state.hash, before.hash);
        assert_ne!(state.chaining_key, before.chaining_key);
        assert_ne!(key, [0u8; 32]);
    }

    #[test]
    fn test_split_directions_differ() {
        let state = SymmetricState::new(&[3u8; 32]);
        let (a, b) = state.split();
        assert_ne!(a, b);
    }
}
